//! Event stream from a session to its owner.
//!
//! Status events travel on an unbounded channel and are never dropped.
//! Frames go through a bounded buffer; when the consumer falls behind, new
//! frames are dropped and counted.

use crate::correlator::CaptureOutcome;
use facefeed_core::{AttemptId, FrameTick, RetryDecision, Termination};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A socket is being opened for `attempt`.
    Connecting { attempt: AttemptId },
    /// The service completed its handshake; capture is now possible.
    Connected { attempt: AttemptId },
    /// One feed tick. `sequence` counts frames within the attempt, from 1.
    Frame {
        attempt: AttemptId,
        sequence: u64,
        tick: FrameTick,
    },
    CaptureResolved {
        attempt: AttemptId,
        outcome: CaptureOutcome,
    },
    /// The attempt ended; `decision` says whether a retry is scheduled.
    Terminated {
        attempt: AttemptId,
        termination: Termination,
        message: String,
        decision: RetryDecision,
    },
    /// `close()` finished.
    Closed { attempt: Option<AttemptId> },
}

/// Receiving half handed to the session's owner.
pub struct SessionEvents {
    status: mpsc::UnboundedReceiver<SessionEvent>,
    frames: mpsc::Receiver<SessionEvent>,
}

impl SessionEvents {
    /// Next event, status first. Returns `None` once the session is gone.
    ///
    /// Frames are not ordered against status events: a frame from attempt N
    /// can arrive after `Terminated` for N, or after `Connecting` for N + 1.
    /// Consumers that care about the current attempt must check the frame's
    /// `attempt`.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        tokio::select! {
            biased;
            Some(event) = self.status.recv() => Some(event),
            Some(event) = self.frames.recv() => Some(event),
            else => None,
        }
    }

    /// Next event if one is ready now.
    pub fn try_next(&mut self) -> Option<SessionEvent> {
        self.status
            .try_recv()
            .ok()
            .or_else(|| self.frames.try_recv().ok())
    }
}

/// Sending half, owned by the controller.
pub(crate) struct EventSink {
    status: mpsc::UnboundedSender<SessionEvent>,
    frames: mpsc::Sender<SessionEvent>,
    disposed: Arc<AtomicBool>,
    dropped_frames: u64,
}

pub(crate) fn channel(
    frame_buffer: usize,
    disposed: Arc<AtomicBool>,
) -> (EventSink, SessionEvents) {
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::channel(frame_buffer.max(1));
    (
        EventSink {
            status: status_tx,
            frames: frames_tx,
            disposed,
            dropped_frames: 0,
        },
        SessionEvents {
            status: status_rx,
            frames: frames_rx,
        },
    )
}

impl EventSink {
    pub(crate) fn status(&self, event: SessionEvent) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        // The owner may have dropped its receiver; that is not our problem.
        let _ = self.status.send(event);
    }

    pub(crate) fn frame(&mut self, event: SessionEvent) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        match self.frames.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_frames += 1;
                if self.dropped_frames == 1 || self.dropped_frames % 30 == 0 {
                    tracing::debug!(
                        dropped = self.dropped_frames,
                        "frame consumer lagging; dropping frames"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }
}
