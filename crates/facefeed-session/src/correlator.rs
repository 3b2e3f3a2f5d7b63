//! Capture request correlation.
//!
//! At most one capture is outstanding, and it belongs to the attempt that
//! issued it. Only a result from that same attempt resolves it; teardown
//! resolves it as abandoned. Either way it resolves exactly once.

use facefeed_core::{AttemptId, MatchDescriptor, SearchResult, Termination};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Final outcome of a capture request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The search ran; these gallery images matched (possibly none).
    Matched(Vec<MatchDescriptor>),
    /// The service could not run the search.
    Failed { reason: String },
    /// The attempt went away before a result arrived.
    Abandoned(AbandonReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// `close()` was called.
    Closed,
    /// The attempt ended on its own.
    Terminated(Termination),
    /// The session was disposed.
    Disposed,
    /// The session task is gone without resolving the capture.
    SessionGone,
}

impl From<SearchResult> for CaptureOutcome {
    fn from(result: SearchResult) -> Self {
        match result {
            SearchResult::Found(matches) => CaptureOutcome::Matched(matches),
            SearchResult::Failed { reason } => CaptureOutcome::Failed { reason },
        }
    }
}

/// Caller's side of an in-flight capture. Resolves exactly once.
#[derive(Debug)]
pub struct PendingCapture {
    attempt: AttemptId,
    rx: oneshot::Receiver<CaptureOutcome>,
}

impl PendingCapture {
    /// Attempt the capture was issued on.
    pub fn attempt(&self) -> &AttemptId {
        &self.attempt
    }
}

impl Future for PendingCapture {
    type Output = CaptureOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(CaptureOutcome::Abandoned(AbandonReason::SessionGone)))
    }
}

struct InFlight {
    attempt: AttemptId,
    reply: oneshot::Sender<CaptureOutcome>,
}

#[derive(Default)]
pub(crate) struct CaptureCorrelator {
    in_flight: Option<InFlight>,
}

impl CaptureCorrelator {
    pub(crate) fn is_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Register a capture for `attempt`. Returns `None` if one is already in flight.
    pub(crate) fn begin(&mut self, attempt: AttemptId) -> Option<PendingCapture> {
        if self.in_flight.is_some() {
            return None;
        }
        let (reply, rx) = oneshot::channel();
        self.in_flight = Some(InFlight {
            attempt: attempt.clone(),
            reply,
        });
        Some(PendingCapture { attempt, rx })
    }

    /// Resolve the in-flight capture with a result received on `attempt`.
    ///
    /// Returns `None`, leaving any capture untouched, when nothing is in
    /// flight or the capture belongs to another attempt.
    pub(crate) fn resolve(
        &mut self,
        attempt: &AttemptId,
        result: SearchResult,
    ) -> Option<CaptureOutcome> {
        match &self.in_flight {
            Some(in_flight) if in_flight.attempt == *attempt => {}
            _ => return None,
        }
        let in_flight = self.in_flight.take()?;
        let outcome = CaptureOutcome::from(result);
        // Receiver may be gone; the capture still counts as resolved.
        let _ = in_flight.reply.send(outcome.clone());
        Some(outcome)
    }

    /// Resolve whatever is in flight as abandoned.
    pub(crate) fn abandon(&mut self, reason: AbandonReason) -> Option<(AttemptId, CaptureOutcome)> {
        let in_flight = self.in_flight.take()?;
        let outcome = CaptureOutcome::Abandoned(reason);
        let _ = in_flight.reply.send(outcome.clone());
        Some((in_flight.attempt, outcome))
    }
}
