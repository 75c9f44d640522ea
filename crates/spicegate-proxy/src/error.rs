use std::io;
use std::time::Duration;

use spicegate_core::crypto::CryptoError;
use spicegate_core::wire::{AuthMethod, ErrorCode, WireError};
use spicegate_services::{FrameError, SessionError};

/// Why a handshake ended early. None of these is retried.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),

    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("authentication method {0} is not available")]
    AuthUnavailable(AuthMethod),

    #[error("authentication rejected")]
    AuthRejected,

    #[error("authenticator failed: {0:#}")]
    Authenticator(anyhow::Error),

    #[error("session {session_id} could not be resolved: {source}")]
    SessionResolution {
        session_id: u32,
        source: SessionError,
    },

    #[error("compute host refused at {stage} stage: {code:?}")]
    ComputeRefused { stage: &'static str, code: ErrorCode },

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("handshake step timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake already terminated")]
    Terminated,
}

impl From<FrameError> for HandshakeError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => HandshakeError::Io(e),
            FrameError::Wire(e) => HandshakeError::Protocol(e),
        }
    }
}
