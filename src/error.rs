use crate::dialog::DialogId;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Message(#[from] rsip::Error),

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid refer-to target: {0}")]
    InvalidReferTarget(String),

    #[error("status code {0} is not acceptable here")]
    InvalidStatusCode(u16),

    #[error("tone string contains invalid characters")]
    InvalidTones,

    #[error("{op} is not possible in state {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("peer does not allow {0}")]
    NotAllowedByPeer(rsip::Method),

    #[error("another {0} is still in progress")]
    RequestPending(rsip::Method),

    #[error("request timed out")]
    RequestTimedOut,

    #[error("peer rejected the request with {0}")]
    PeerRejected(u16),

    #[error(transparent)]
    Media(#[from] crate::media::MediaError),

    #[error("dialog {0}: {1}")]
    Dialog(DialogId, String),

    #[error("body is not a valid sipfrag")]
    InvalidSipFrag,

    #[error("user agent misconfigured: {0} not set")]
    Misconfigured(&'static str),

    #[error("user agent is shut down")]
    ShutDown,
}

impl Error {
    pub(crate) fn invalid_state(op: &'static str, state: &'static str) -> Self {
        Error::InvalidState { op, state }
    }
}
