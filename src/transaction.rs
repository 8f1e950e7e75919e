//! Thin transaction seam.
//!
//! The RFC 3261 §17 state machines (INVITE retransmission, timers A-K)
//! belong to the host's transaction layer. What lives here is the part the
//! upper layers cannot do without: branch allocation, request/response
//! correlation, and server-side response bookkeeping (the
//! `Trying/Proceeding/Completed` progression the dialog gatekeeper and the
//! 2xx retransmission loop consult).

use crate::endpoint::UserAgentInner;
use crate::headers::status_code_num;
use crate::transport::SipTarget;
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::{rng, Rng};
use rsip::headers::UntypedHeader;
use rsip::prelude::HeadersExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod consts {
    use std::time::Duration;

    pub const T1: Duration = Duration::from_millis(500);
    pub const T2: Duration = Duration::from_secs(4);
    pub const T4: Duration = Duration::from_secs(5);

    /// Non-INVITE transaction timeout (64*T1).
    pub const TIMER_F: Duration = Duration::from_secs(32);
    /// Wait for ACK after a 2xx (64*T1).
    pub const TIMER_H: Duration = Duration::from_secs(32);

    pub const RFC3261_BRANCH_PREFIX: &str = "z9hG4bK";
}

pub(crate) fn random_string(len: usize) -> String {
    rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub(crate) fn generate_branch() -> String {
    format!("{}{}", consts::RFC3261_BRANCH_PREFIX, random_string(23))
}

pub(crate) fn make_tag() -> String {
    random_string(10)
}

pub(crate) fn make_call_id() -> String {
    random_string(22)
}

/// Correlation key: top Via branch plus CSeq method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransactionKey {
    pub branch: String,
    pub method: rsip::Method,
}

impl std::hash::Hash for TransactionKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.method.to_string().hash(state);
    }
}

impl TransactionKey {
    pub(crate) fn from_response(response: &rsip::Response) -> Option<Self> {
        let branch = response
            .via_header()
            .ok()?
            .params()
            .ok()?
            .into_iter()
            .find_map(|p| match p {
                rsip::Param::Branch(b) => Some(b.value().to_string()),
                _ => None,
            })?;

        let method = response.cseq_header().ok()?.method().ok()?;

        Some(Self { branch, method })
    }
}

pub(crate) fn branch_of(request: &rsip::Request) -> Option<String> {
    request
        .via_header()
        .ok()?
        .params()
        .ok()?
        .into_iter()
        .find_map(|p| match p {
            rsip::Param::Branch(b) => Some(b.value().to_string()),
            _ => None,
        })
}

/// Client-side correlation table, keyed by branch + method.
#[derive(Default)]
pub(crate) struct Transactions {
    map: Mutex<HashMap<TransactionKey, mpsc::UnboundedSender<rsip::Response>>>,
}

impl Transactions {
    pub(crate) fn register(&self, key: TransactionKey) -> mpsc::UnboundedReceiver<rsip::Response> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.map.lock().insert(key, tx);
        rx
    }

    /// Hand a response to the matching client transaction.
    pub(crate) fn deliver(&self, response: rsip::Response) -> Result<(), rsip::Response> {
        let Some(key) = TransactionKey::from_response(&response) else {
            return Err(response);
        };

        let map = self.map.lock();
        match map.get(&key) {
            Some(tx) => tx.send(response).map_err(|e| e.0),
            None => Err(response),
        }
    }

    pub(crate) fn remove(&self, key: &TransactionKey) {
        self.map.lock().remove(key);
    }

    pub(crate) fn clear(&self) {
        self.map.lock().clear();
    }
}

/// An in-flight outgoing request.
///
/// Dropping the transaction deregisters it; late responses are then
/// discarded by the router.
pub(crate) struct ClientTransaction {
    ua: Arc<UserAgentInner>,
    key: TransactionKey,
    target: SipTarget,
    rx: mpsc::UnboundedReceiver<rsip::Response>,
}

impl ClientTransaction {
    pub(crate) async fn send(
        ua: Arc<UserAgentInner>,
        request: rsip::Request,
        target: SipTarget,
    ) -> Result<Self> {
        Self::send_with_branch(ua, request, target, generate_branch()).await
    }

    /// Send with a caller-chosen branch. CANCEL reuses the branch of the
    /// INVITE it cancels.
    pub(crate) async fn send_with_branch(
        ua: Arc<UserAgentInner>,
        mut request: rsip::Request,
        target: SipTarget,
        branch: String,
    ) -> Result<Self> {
        let via = rsip::headers::Via::new(format!(
            "SIP/2.0/{} {};branch={}",
            target.transport_or_default(),
            ua.transport.via_addr(),
            branch
        ));
        crate::headers::push_front(&mut request.headers, via.into());

        let key = TransactionKey {
            branch,
            method: request.method.clone(),
        };

        let rx = ua.transactions.register(key.clone());

        if let Err(e) = ua.transport.send(&target, request.into()).await {
            ua.transactions.remove(&key);
            return Err(e.into());
        }

        Ok(Self {
            ua,
            key,
            target,
            rx,
        })
    }

    pub(crate) fn branch(&self) -> &str {
        &self.key.branch
    }

    pub(crate) fn target(&self) -> &SipTarget {
        &self.target
    }

    /// Next correlated response, provisional or final. `None` once the
    /// user agent shuts down.
    pub(crate) async fn receive(&mut self) -> Option<rsip::Response> {
        self.rx.recv().await
    }

    /// Wait for a final response, bounded by the transaction timeout.
    pub(crate) async fn receive_final(&mut self) -> Result<rsip::Response> {
        let wait = async {
            while let Some(response) = self.rx.recv().await {
                if status_code_num(&response.status_code) >= 200 {
                    return Some(response);
                }
            }
            None
        };

        match tokio::time::timeout(consts::TIMER_F, wait).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(Error::ShutDown),
            Err(_) => Err(Error::RequestTimedOut),
        }
    }
}

impl Drop for ClientTransaction {
    fn drop(&mut self) {
        self.ua.transactions.remove(&self.key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerTsxState {
    Trying,
    Proceeding,
    Completed,
}

struct ServerTsxInner {
    ua: Arc<UserAgentInner>,
    request: rsip::Request,
    source: SipTarget,
    state: Mutex<ServerTsxState>,
    last_response: Mutex<Option<rsip::Response>>,
    /// Tag appended to To on non-100 responses built by [`reply`].
    local_tag: Mutex<Option<String>>,
}

/// Responder handle for one incoming request.
#[derive(Clone)]
pub(crate) struct ServerTransaction {
    inner: Arc<ServerTsxInner>,
}

impl ServerTransaction {
    pub(crate) fn new(ua: Arc<UserAgentInner>, request: rsip::Request, source: SipTarget) -> Self {
        Self {
            inner: Arc::new(ServerTsxInner {
                ua,
                request,
                source,
                state: Mutex::new(ServerTsxState::Trying),
                last_response: Mutex::new(None),
                local_tag: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn set_local_tag(&self, tag: String) {
        *self.inner.local_tag.lock() = Some(tag);
    }

    pub(crate) fn request(&self) -> &rsip::Request {
        &self.inner.request
    }

    pub(crate) fn state(&self) -> ServerTsxState {
        *self.inner.state.lock()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state() != ServerTsxState::Completed
    }

    pub(crate) async fn respond(&self, response: rsip::Response) -> Result<()> {
        let final_response = status_code_num(&response.status_code) >= 200;

        {
            let mut state = self.inner.state.lock();
            if *state == ServerTsxState::Completed {
                return Err(Error::invalid_state("respond", "completed"));
            }
            *state = if final_response {
                ServerTsxState::Completed
            } else {
                ServerTsxState::Proceeding
            };
        }

        *self.inner.last_response.lock() = Some(response.clone());

        self.inner
            .ua
            .transport
            .send(&self.inner.source, response.into())
            .await
            .map_err(Into::into)
    }

    /// Re-send the last response. Used by the session layer to retransmit
    /// a 2xx, which the transaction machines cannot do.
    pub(crate) async fn retransmit(&self) -> Result<()> {
        let response = self.inner.last_response.lock().clone();

        match response {
            Some(response) => self
                .inner
                .ua
                .transport
                .send(&self.inner.source, response.into())
                .await
                .map_err(Into::into),
            None => Err(Error::invalid_state("retransmit", "trying")),
        }
    }

    /// Build and send a response from the stored request.
    pub(crate) async fn reply(
        &self,
        status: rsip::StatusCode,
        extra_headers: Vec<rsip::Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let local_tag = self.inner.local_tag.lock().clone();
        let response = self.inner.ua.create_response(
            &self.inner.request,
            status,
            local_tag.as_deref(),
            extra_headers,
            body,
        );
        self.respond(response).await
    }
}
