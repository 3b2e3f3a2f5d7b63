//! facefeed-session — Client session for the live face-search feed.
//!
//! Opens one WebSocket per connection attempt, tracks the feed, correlates
//! capture requests with their search results, and retries attempts that
//! die before the feed starts. Everything runs on a single task per session;
//! callers hold a [`Session`] handle and read [`SessionEvents`].

pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod socket;

mod cleanup;
mod controller;
mod facade;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, SessionConfig};
pub use controller::{SessionSnapshot, SessionState};
pub use correlator::{AbandonReason, CaptureOutcome, PendingCapture};
pub use error::SessionError;
pub use events::{SessionEvent, SessionEvents};
pub use facade::Session;
pub use socket::{
    Connector, TransportError, WireMessage, WirePair, WireSink, WireStream, WsConnector,
};
