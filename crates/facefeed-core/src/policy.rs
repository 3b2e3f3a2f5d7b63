//! Reconnection policy.
//!
//! A pure function of how an attempt ended and how many automatic retries the
//! session has already spent. Scheduling the retry is the caller's job.

use std::fmt;
use std::time::Duration;

/// Why a connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Transport closed (or never connected) before any frame arrived.
    ClosedBeforeFeed,
    /// Transport closed after the feed had started.
    ClosedMidStream,
    /// The service sent an `error` event.
    ExplicitError,
    /// No `connected` event within the connect timeout.
    Timeout,
    /// The socket could not even be constructed (bad endpoint).
    TransportFailure,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::ClosedBeforeFeed => write!(f, "closed-before-feed"),
            Termination::ClosedMidStream => write!(f, "closed-mid-stream"),
            Termination::ExplicitError => write!(f, "explicit-error"),
            Termination::Timeout => write!(f, "timeout"),
            Termination::TransportFailure => write!(f, "transport-failure"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// This kind of termination is never retried automatically.
    NotEligible,
    /// The session spent all of its automatic retries.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reopen after `after`; this will be automatic retry number `retry`.
    Retry { after: Duration, retry: u32 },
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    /// Also retry when the feed drops after it started.
    pub retry_mid_stream: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(1500),
            retry_mid_stream: false,
        }
    }
}

impl ReconnectPolicy {
    /// Decide whether `termination` earns another automatic attempt.
    pub fn decide(&self, termination: Termination, retries_used: u32) -> RetryDecision {
        let eligible = match termination {
            Termination::ClosedBeforeFeed => true,
            Termination::ClosedMidStream => self.retry_mid_stream,
            Termination::ExplicitError | Termination::Timeout | Termination::TransportFailure => {
                false
            }
        };

        let decision = if !eligible {
            RetryDecision::GiveUp(GiveUpReason::NotEligible)
        } else if retries_used >= self.max_retries {
            RetryDecision::GiveUp(GiveUpReason::Exhausted)
        } else {
            RetryDecision::Retry {
                after: self.delay,
                retry: retries_used + 1,
            }
        };

        tracing::debug!(%termination, retries_used, ?decision, "reconnect decision");
        decision
    }
}
