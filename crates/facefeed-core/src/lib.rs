//! facefeed-core — Wire protocol and pure policy for the live face-search feed.
//!
//! Holds the pieces that do no I/O: attempt identity, the JSON codec for the
//! `live-feed` socket, and the reconnection policy.

pub mod codec;
pub mod policy;
pub mod types;

pub use codec::{decode_event, encode_command, ClientCommand, CodecError, ServiceEvent};
pub use policy::{GiveUpReason, ReconnectPolicy, RetryDecision, Termination};
pub use types::{AttemptId, ClientId, FrameTick, MatchDescriptor, SearchResult};
