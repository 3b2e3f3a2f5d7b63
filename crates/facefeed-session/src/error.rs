use crate::config::ConfigError;
use crate::controller::SessionState;
use crate::socket::TransportError;
use facefeed_core::AttemptId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is {0}; close it before opening again")]
    AlreadyActive(SessionState),
    #[error("capture needs a connected feed (session is {0})")]
    NotReady(SessionState),
    #[error("a capture is already in flight on attempt {0}")]
    AlreadyCapturing(AttemptId),
    #[error("no face in view")]
    NoFaceInView,
    #[error("invalid feed endpoint: {0}")]
    InvalidEndpoint(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("session task exited")]
    ChannelClosed,
}
