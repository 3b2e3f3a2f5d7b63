//! JSON codec for the live-feed socket.
//!
//! Outbound: `{"action": "close"}` and `{"action": "capture"}`.
//! Inbound: objects discriminated by `event` (`connected`, `frame`, `error`,
//! `search_result`). Everything inbound is validated here before dispatch;
//! callers log and drop anything that fails.

use crate::types::{FrameTick, MatchDescriptor, SearchResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason reported when the service fails a search without saying why.
pub const DEFAULT_SEARCH_FAILURE: &str = "No faces detected in captured image";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {event} event: {reason}")]
    Invalid {
        event: &'static str,
        reason: &'static str,
    },
    #[error("unexpected binary message ({len} bytes)")]
    Binary { len: usize },
}

/// Commands the client sends. Neither carries a payload; a capture is
/// correlated implicitly (one outstanding per attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Close,
    Capture,
}

/// A validated event from the service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Connected,
    Frame(FrameTick),
    Error { message: String },
    SearchResult(SearchResult),
}

impl ServiceEvent {
    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceEvent::Connected => "connected",
            ServiceEvent::Frame(_) => "frame",
            ServiceEvent::Error { .. } => "error",
            ServiceEvent::SearchResult(_) => "search_result",
        }
    }
}

/// Wire shape before validation.
#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RawEvent {
    Connected,
    Frame {
        image: String,
        #[serde(default)]
        faces_detected: Option<i64>,
        #[serde(default)]
        fps: Option<f64>,
    },
    Error {
        message: String,
    },
    SearchResult {
        success: bool,
        #[serde(default)]
        matches: Option<Vec<MatchDescriptor>>,
        #[serde(default)]
        message: Option<String>,
    },
}

/// Encode an outbound command as a JSON text message.
pub fn encode_command(command: ClientCommand) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&command)?)
}

/// Decode and validate one inbound text message.
pub fn decode_event(text: &str) -> Result<ServiceEvent, CodecError> {
    let raw: RawEvent = serde_json::from_str(text)?;
    match raw {
        RawEvent::Connected => Ok(ServiceEvent::Connected),
        RawEvent::Frame {
            image,
            faces_detected,
            fps,
        } => {
            if image.is_empty() {
                return Err(CodecError::Invalid {
                    event: "frame",
                    reason: "empty image",
                });
            }
            // A missing count means the detector saw nothing.
            let faces_detected = match faces_detected {
                None => 0,
                Some(n) => u32::try_from(n).map_err(|_| CodecError::Invalid {
                    event: "frame",
                    reason: "faces_detected out of range",
                })?,
            };
            if let Some(fps) = fps {
                if !fps.is_finite() || fps < 0.0 {
                    return Err(CodecError::Invalid {
                        event: "frame",
                        reason: "fps must be a non-negative number",
                    });
                }
            }
            Ok(ServiceEvent::Frame(FrameTick {
                image,
                faces_detected,
                fps,
            }))
        }
        RawEvent::Error { message } => Ok(ServiceEvent::Error { message }),
        RawEvent::SearchResult {
            success: true,
            matches,
            ..
        } => {
            let matches = matches.ok_or(CodecError::Invalid {
                event: "search_result",
                reason: "successful result without matches",
            })?;
            Ok(ServiceEvent::SearchResult(SearchResult::Found(matches)))
        }
        RawEvent::SearchResult {
            success: false,
            message,
            ..
        } => Ok(ServiceEvent::SearchResult(SearchResult::Failed {
            reason: message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_SEARCH_FAILURE.to_string()),
        })),
    }
}
