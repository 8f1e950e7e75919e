//! Session description seam.
//!
//! The signaling core never interprets SDP; it hands bodies to a
//! [`MediaHandler`] owned by the session and maps its failures onto the
//! cause vocabulary.

use crate::events::Cause;
use async_trait::async_trait;
use std::fmt;

#[derive(Debug)]
pub enum MediaError {
    /// The user declined access to capture devices.
    Denied,
    /// The remote description could not be applied.
    BadDescription,
    /// Any other backend failure.
    Backend(String),
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::Denied => f.write_str("media access denied"),
            MediaError::BadDescription => f.write_str("bad session description"),
            MediaError::Backend(msg) => write!(f, "media backend: {msg}"),
        }
    }
}

impl std::error::Error for MediaError {}

impl MediaError {
    pub(crate) fn cause(&self) -> Cause {
        match self {
            MediaError::Denied => Cause::UserDeniedMediaAccess,
            MediaError::BadDescription => Cause::BadMediaDescription,
            MediaError::Backend(_) => Cause::WebrtcError,
        }
    }
}

/// SDP backend driven by a [`Session`](crate::Session).
///
/// Bodies are opaque `application/sdp` bytes on this side of the seam.
#[async_trait]
pub trait MediaHandler: Send + 'static {
    /// Produce the local offer for an outgoing INVITE (or a bodyless
    /// incoming one).
    async fn create_offer(&mut self) -> Result<Vec<u8>, MediaError>;

    /// Take the remote offer and produce the local answer.
    async fn create_answer(&mut self, remote_offer: Vec<u8>) -> Result<Vec<u8>, MediaError>;

    /// Apply the remote answer to a previously created offer.
    async fn apply_answer(&mut self, remote_answer: Vec<u8>) -> Result<(), MediaError>;

    /// Release the media resources. Must be idempotent.
    fn close(&mut self);
}
