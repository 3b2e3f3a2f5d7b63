use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable identity of one session, generated once per facade instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Arc<str>);

impl ClientId {
    /// Generate a fresh random (UUID v4) client id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one connection attempt: `(client_id, attempt_number)`.
///
/// Every transport event and timer carries the `AttemptId` it belongs to;
/// the controller compares it against its current attempt before acting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptId {
    pub client: ClientId,
    pub number: u32,
}

impl AttemptId {
    pub fn new(client: ClientId, number: u32) -> Self {
        Self { client, number }
    }

    /// Path segment used in the feed URL: `{client_id}-{attempt_number}`.
    pub fn path_segment(&self) -> String {
        format!("{}-{}", self.client, self.number)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.client, self.number)
    }
}

/// One gallery image matched by a capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDescriptor {
    pub path: String,
}

/// One tick of the annotated live feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTick {
    /// Base64-encoded still as sent by the service (JPEG in practice).
    pub image: String,
    pub faces_detected: u32,
    pub fps: Option<f64>,
}

impl FrameTick {
    /// Decode the base64 payload into the encoded still's bytes.
    ///
    /// No pixel decoding happens here; the bytes are whatever image format the
    /// service produced.
    pub fn image_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(self.image.as_bytes())
    }
}

/// Outcome reported by the service for a capture request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResult {
    /// Search ran; zero or more gallery images matched.
    Found(Vec<MatchDescriptor>),
    /// Search could not run (e.g. no face in the captured frame).
    Failed { reason: String },
}
