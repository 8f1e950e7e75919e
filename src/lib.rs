//! # SIP user-agent signaling
//!
//! The state-machine core of a SIP user agent: dialogs (RFC 3261 §12),
//! INVITE sessions with forking, re-INVITE/UPDATE and RFC 4028 session
//! timers, REFER with its implicit subscription (RFC 3515/4488/4538),
//! and one-shot MESSAGE exchanges.
//!
//! Notable types are
//!
//! - [`UserAgent`] owns the registries and routes all traffic
//! - [`Session`] a call in any stage of its INVITE lifecycle
//! - [`IncomingRefer`] / [`OutgoingRefer`] a transfer subscription
//! - [`IncomingMessage`] / [`OutgoingMessage`] pager-mode messaging
//!
//! Message grammar, the RFC 3261 §17 transaction machines, transports,
//! registration and media are external collaborators: messages enter
//! pre-parsed through [`UserAgent::receive`] and leave through the
//! [`Transport`] trait, SDP bodies pass opaquely through a
//! [`MediaHandler`].
//!
//! The stack expects a single-threaded runtime driving it; entity state
//! is internally locked, and no handler of the same entity ever runs
//! concurrently with another.

mod endpoint;
mod error;
mod events;
mod media;
mod timer;
mod transaction;
mod transport;

pub mod dialog;
pub mod headers;
pub mod message;
pub mod refer;
pub mod session;

pub use endpoint::{UaEvent, UaEvents, UserAgent, UserAgentBuilder, UserAgentConfig};
pub use error::{Error, Result};
pub use events::{Cause, Originator};
pub use media::{MediaError, MediaHandler};
pub use timer::{TimerService, TimerToken};
pub use transport::{SipTarget, Transport};

pub use dialog::{Dialog, DialogId, DialogLayer, DialogRole, DialogState};
pub use headers::SipFrag;
pub use message::{
    IncomingMessage, MessageEvent, MessageEvents, OutgoingMessage, SendMessageOptions,
};
pub use refer::{
    IncomingRefer, NotifyOptions, OutgoingRefer, ReferEvent, ReferEvents, ReferOptions,
    ReferProgress,
};
pub use session::{
    dtmf::DtmfOptions, AnswerOptions, CallOptions, ReInviteResponder, Session, SessionDirection,
    SessionEvent, SessionEvents, SessionState, TerminateOptions, UpdateResponder,
};
