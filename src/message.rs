//! One-shot MESSAGE exchanges (RFC 3428). No dialog is involved.

use crate::endpoint::{UaEvent, UserAgentInner};
use crate::events::{Cause, Originator};
use crate::headers::{self, status_code_num};
use crate::transaction::{make_call_id, make_tag, ClientTransaction, ServerTransaction};
use crate::transport::SipTarget;
use crate::{Error, Result};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Recognized fields for [`UserAgent::send_message`](crate::UserAgent::send_message).
#[derive(Default)]
pub struct SendMessageOptions {
    /// Defaults to `text/plain`.
    pub content_type: Option<String>,
    pub extra_headers: Vec<rsip::Header>,
}

pub enum MessageEvent {
    Succeeded {
        response: rsip::Response,
    },
    Failed {
        originator: Originator,
        cause: Cause,
        response: Option<rsip::Response>,
    },
}

pub struct MessageEvents {
    rx: mpsc::UnboundedReceiver<MessageEvent>,
}

impl MessageEvents {
    pub async fn recv(&mut self) -> Option<MessageEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MessageEvent> {
        self.rx.try_recv().ok()
    }
}

/// An out-of-dialog MESSAGE in flight.
pub struct OutgoingMessage {
    request: rsip::Request,
}

impl OutgoingMessage {
    pub fn request(&self) -> &rsip::Request {
        &self.request
    }
}

pub(crate) async fn send_message(
    ua: Arc<UserAgentInner>,
    target: &str,
    body: Vec<u8>,
    options: SendMessageOptions,
) -> Result<(OutgoingMessage, MessageEvents)> {
    let uri = rsip::Uri::try_from(target).map_err(|_| Error::InvalidTarget(target.to_owned()))?;

    let from = rsip::typed::From {
        display_name: None,
        uri: ua.config.identity.clone(),
        params: vec![],
    }
    .with_tag(make_tag().into());

    let to = rsip::typed::To {
        display_name: None,
        uri: uri.clone(),
        params: vec![],
    };

    let content_type = options
        .content_type
        .unwrap_or_else(|| "text/plain".to_owned());

    let mut hdrs: Vec<rsip::Header> = vec![
        rsip::Header::From(from.into()),
        rsip::Header::To(to.into()),
        rsip::Header::CallId(make_call_id().into()),
        rsip::Header::CSeq(
            rsip::typed::CSeq {
                seq: rand::rng().random_range(0..10_000),
                method: rsip::Method::Message,
            }
            .into(),
        ),
        rsip::Header::MaxForwards(70.into()),
        rsip::Header::UserAgent(ua.config.user_agent.clone().into()),
        rsip::Header::ContentType(content_type.into()),
    ];
    hdrs.extend(options.extra_headers);
    hdrs.push(rsip::Header::ContentLength((body.len() as u32).into()));

    let request = rsip::Request {
        method: rsip::Method::Message,
        uri: uri.clone(),
        headers: hdrs.into(),
        version: rsip::Version::V2,
        body,
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let target = SipTarget::from_uri(&uri);
    let task_request = request.clone();

    tokio::spawn(async move {
        let mut tsx = match ClientTransaction::send(ua, task_request, target).await {
            Ok(tsx) => tsx,
            Err(_) => {
                let _ = events_tx.send(MessageEvent::Failed {
                    originator: Originator::System,
                    cause: Cause::ConnectionError,
                    response: None,
                });
                return;
            }
        };

        // provisionals are skipped by the final-response wait
        let event = match tsx.receive_final().await {
            Ok(response) => {
                let code = status_code_num(&response.status_code);
                if code < 300 {
                    MessageEvent::Succeeded { response }
                } else {
                    MessageEvent::Failed {
                        originator: Originator::Remote,
                        cause: Cause::from_status(code),
                        response: Some(response),
                    }
                }
            }
            Err(Error::RequestTimedOut) => MessageEvent::Failed {
                originator: Originator::System,
                cause: Cause::RequestTimeout,
                response: None,
            },
            Err(_) => MessageEvent::Failed {
                originator: Originator::System,
                cause: Cause::ConnectionError,
                response: None,
            },
        };

        let _ = events_tx.send(event);
    });

    Ok((OutgoingMessage { request }, MessageEvents { rx: events_rx }))
}

struct IncomingMessageInner {
    tsx: ServerTransaction,
    replied: AtomicBool,
}

/// A received MESSAGE. Replying is optional: dropping the handle while
/// the transaction is still pending acknowledges with a 200.
#[derive(Clone)]
pub struct IncomingMessage {
    inner: Arc<IncomingMessageInner>,
}

impl IncomingMessage {
    pub fn request(&self) -> &rsip::Request {
        self.inner.tsx.request()
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.tsx.request().body
    }

    pub fn content_type(&self) -> Option<String> {
        headers::content_type(&self.inner.tsx.request().headers)
    }

    pub async fn accept(&self, extra_headers: Vec<rsip::Header>) -> Result<()> {
        if self.inner.replied.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state("accept", "already replied"));
        }

        self.inner
            .tsx
            .reply(rsip::StatusCode::OK, extra_headers, None)
            .await
    }

    pub async fn reject(&self, status_code: u16, extra_headers: Vec<rsip::Header>) -> Result<()> {
        let status = headers::status_from_u16(status_code)?;
        if status_code < 300 {
            return Err(Error::InvalidStatusCode(status_code));
        }

        if self.inner.replied.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state("reject", "already replied"));
        }

        self.inner.tsx.reply(status, extra_headers, None).await
    }
}

impl Drop for IncomingMessageInner {
    fn drop(&mut self) {
        if self.replied.load(Ordering::SeqCst) || !self.tsx.is_pending() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let tsx = self.tsx.clone();
        handle.spawn(async move {
            if let Err(e) = tsx.reply(rsip::StatusCode::OK, vec![], None).await {
                debug!(error = %e, "default MESSAGE reply failed");
            }
        });
    }
}

pub(crate) async fn init_incoming(ua: Arc<UserAgentInner>, tsx: ServerTransaction) {
    let message = IncomingMessage {
        inner: Arc::new(IncomingMessageInner {
            tsx,
            replied: AtomicBool::new(false),
        }),
    };

    ua.emit(UaEvent::NewMessage { message });
}
