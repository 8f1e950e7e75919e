//! Dialog state (RFC 3261 §12) and the RFC 4028 session-timer sub-state.
//!
//! Dialogs live in the user agent's [`DialogLayer`] registry, which is the
//! single point of truth for their lifetime; sessions and refer
//! subscriptions hold cheap clones and are pointed back at through
//! non-owning [`DialogOwner`] references.

use crate::endpoint::UserAgentInner;
use crate::headers::{
    self, contact_uri, MinSe, Refresher, SessionExpires, MIN_SE, SESSION_EXPIRES,
};
use crate::refer::ReferInner;
use crate::session::SessionInner;
use crate::transaction::{ServerTransaction, ServerTsxState};
use crate::timer::TimerToken;
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

mod key;
mod layer;

pub use key::DialogId;
pub use layer::DialogLayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    Uac,
    Uas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
}

/// Entity the dialog delivers accepted in-dialog requests to.
pub(crate) enum DialogOwner {
    Session(Weak<SessionInner>),
    Refer(Weak<ReferInner>),
}

/// RFC 4028 session-timer sub-state of one dialog.
pub(crate) struct SessionTimer {
    pub interval: Option<u32>,
    pub min_interval: u32,
    pub local_refresher: bool,
    timer: Option<TimerToken>,
}

impl SessionTimer {
    fn new(min_interval: u32) -> Self {
        Self {
            interval: None,
            min_interval,
            local_refresher: false,
            timer: None,
        }
    }
}

pub(crate) struct DialogInner {
    pub(crate) ua: Arc<UserAgentInner>,
    pub(crate) id: DialogId,
    pub(crate) role: DialogRole,
    state: Mutex<DialogState>,

    pub(crate) local_uri: rsip::Uri,
    pub(crate) remote_uri: rsip::Uri,
    remote_target: Mutex<rsip::Uri>,
    route_set: Vec<rsip::headers::Route>,

    /// Preformatted From header value carrying the local tag.
    local_value: String,
    /// Preformatted To header value carrying the remote tag.
    remote_value: String,

    local_seq: Mutex<Option<u32>>,
    remote_seq: Mutex<Option<u32>>,

    last_invite_tx: Mutex<Option<ServerTransaction>>,
    last_update_tx: Mutex<Option<ServerTransaction>>,

    pub(crate) session_timer: Mutex<SessionTimer>,
    pub(crate) owner: Mutex<Option<DialogOwner>>,

    registered: AtomicBool,
}

#[derive(Clone)]
pub struct Dialog {
    pub(crate) inner: Arc<DialogInner>,
}

impl Dialog {
    /// Create a dialog from a dialog-establishing request we received.
    ///
    /// Fails when the request has no Contact or no From tag. The caller
    /// supplies the freshly minted local tag.
    pub(crate) fn new_uas(
        ua: Arc<UserAgentInner>,
        request: &rsip::Request,
        local_tag: &str,
        state: DialogState,
    ) -> Result<Dialog> {
        let contact = request
            .contact_header()
            .map_err(|_| Error::MissingHeader("Contact"))?;
        let remote_target = contact_uri(contact)?;

        let from = request.from_header()?.typed()?;
        let to = request.to_header()?.typed()?;

        let remote_tag = request
            .from_header()?
            .tag()?
            .ok_or(Error::MissingHeader("From tag"))?;

        let call_id = request.call_id_header()?.value().to_string();
        let id = DialogId::new(call_id, local_tag, remote_tag.value());

        // Record-Route order is preserved on the UAS side
        let route_set = request
            .headers
            .iter()
            .filter_map(|h| match h {
                rsip::Header::RecordRoute(rr) => {
                    Some(rsip::headers::Route::from(rr.value().to_string()))
                }
                _ => None,
            })
            .collect();

        let remote_seq = request.cseq_header()?.seq()?;

        // a NOTIFY-formed dialog arrives with our tag already in To
        let already_tagged = to.params.iter().any(|p| matches!(p, rsip::Param::Tag(_)));
        let local_value = if already_tagged {
            to.to_string()
        } else {
            to.clone()
                .with_tag(local_tag.to_string().into())
                .to_string()
        };
        let remote_value = from.to_string();

        let dialog = Dialog {
            inner: Arc::new(DialogInner {
                ua: ua.clone(),
                id,
                role: DialogRole::Uas,
                state: Mutex::new(state),
                local_uri: to.uri.clone(),
                remote_uri: from.uri.clone(),
                remote_target: Mutex::new(remote_target),
                route_set,
                local_value,
                remote_value,
                local_seq: Mutex::new(None),
                remote_seq: Mutex::new(Some(remote_seq)),
                last_invite_tx: Mutex::new(None),
                last_update_tx: Mutex::new(None),
                session_timer: Mutex::new(SessionTimer::new(ua.config.min_session_expires)),
                owner: Mutex::new(None),
                registered: AtomicBool::new(true),
            }),
        };

        ua.dialogs.insert(dialog.clone())?;

        Ok(dialog)
    }

    /// Create a dialog from a response to a dialog-establishing request we
    /// sent. Early for status < 200, Confirmed otherwise.
    pub(crate) fn new_uac(
        ua: Arc<UserAgentInner>,
        request: &rsip::Request,
        response: &rsip::Response,
    ) -> Result<Dialog> {
        let contact = response
            .contact_header()
            .map_err(|_| Error::MissingHeader("Contact"))?;
        let remote_target = contact_uri(contact)?;

        let id = DialogId::from_response(response).ok_or(Error::MissingHeader("To tag"))?;

        let from = request.from_header()?.typed()?;
        let to = response.to_header()?.typed()?;

        // Record-Route is reversed on the UAC side
        let mut route_set: Vec<rsip::headers::Route> = response
            .headers
            .iter()
            .filter_map(|h| match h {
                rsip::Header::RecordRoute(rr) => {
                    Some(rsip::headers::Route::from(rr.value().to_string()))
                }
                _ => None,
            })
            .collect();
        route_set.reverse();

        let local_seq = request.cseq_header()?.seq()?;

        let state = if headers::status_code_num(&response.status_code) < 200 {
            DialogState::Early
        } else {
            DialogState::Confirmed
        };

        let dialog = Dialog {
            inner: Arc::new(DialogInner {
                ua: ua.clone(),
                id,
                role: DialogRole::Uac,
                state: Mutex::new(state),
                local_uri: from.uri.clone(),
                remote_uri: to.uri.clone(),
                remote_target: Mutex::new(remote_target),
                route_set,
                local_value: from.to_string(),
                remote_value: to.to_string(),
                local_seq: Mutex::new(Some(local_seq)),
                remote_seq: Mutex::new(None),
                last_invite_tx: Mutex::new(None),
                last_update_tx: Mutex::new(None),
                session_timer: Mutex::new(SessionTimer::new(ua.config.min_session_expires)),
                owner: Mutex::new(None),
                registered: AtomicBool::new(true),
            }),
        };

        ua.dialogs.insert(dialog.clone())?;

        Ok(dialog)
    }

    pub fn id(&self) -> &DialogId {
        &self.inner.id
    }

    pub fn role(&self) -> DialogRole {
        self.inner.role
    }

    pub fn state(&self) -> DialogState {
        *self.inner.state.lock()
    }

    pub fn remote_target(&self) -> rsip::Uri {
        self.inner.remote_target.lock().clone()
    }

    /// Where in-dialog requests are sent: the first Route entry when a
    /// route set exists (loose routing), the remote target otherwise.
    pub(crate) fn next_hop(&self) -> crate::transport::SipTarget {
        let route_uri = self.inner.route_set.first().and_then(|route| {
            route
                .typed()
                .ok()
                .and_then(|typed| typed.uris().first().map(|u| u.uri.clone()))
        });

        let uri = match route_uri {
            Some(mut uri) => {
                uri.params
                    .retain(|p| matches!(p, rsip::Param::Transport(_)));
                uri
            }
            None => self.inner.remote_target.lock().clone(),
        };

        crate::transport::SipTarget::from_uri(&uri)
    }

    pub(crate) fn set_owner(&self, owner: DialogOwner) {
        *self.inner.owner.lock() = Some(owner);
    }

    /// Promote an early dialog. The only legal state transition.
    pub(crate) fn confirm(&self) {
        let mut state = self.inner.state.lock();
        if *state == DialogState::Early {
            *state = DialogState::Confirmed;
        }
    }

    /// Next CSeq for `method`: CANCEL and ACK reuse the current number,
    /// everything else increments first. Lazily seeded when this dialog
    /// was not created by a request of ours.
    fn next_cseq(&self, method: &rsip::Method) -> u32 {
        let mut seq = self.inner.local_seq.lock();
        let current = seq.get_or_insert_with(|| rand::rng().random_range(0..10_000));

        match method {
            rsip::Method::Cancel | rsip::Method::Ack => *current,
            _ => {
                *current += 1;
                *current
            }
        }
    }

    /// Build an in-dialog request (RFC 3261 §12.2.1.1).
    pub(crate) fn make_request(
        &self,
        method: rsip::Method,
        cseq: Option<u32>,
        extra_headers: Vec<rsip::Header>,
        body: Option<Vec<u8>>,
    ) -> rsip::Request {
        let inner = &self.inner;
        let seq = cseq.unwrap_or_else(|| self.next_cseq(&method));

        let mut headers: Vec<rsip::Header> = Vec::with_capacity(extra_headers.len() + 10);

        headers.push(rsip::Header::From(inner.local_value.clone().into()));
        headers.push(rsip::Header::To(inner.remote_value.clone().into()));
        headers.push(rsip::Header::CallId(inner.id.call_id.clone().into()));
        headers.push(rsip::Header::CSeq(
            rsip::typed::CSeq {
                seq,
                method: method.clone(),
            }
            .into(),
        ));
        headers.push(rsip::Header::MaxForwards(70.into()));
        headers.push(
            rsip::typed::Contact {
                display_name: None,
                uri: inner.ua.config.contact.clone(),
                params: vec![],
            }
            .into(),
        );
        headers.push(rsip::Header::UserAgent(
            inner.ua.config.user_agent.clone().into(),
        ));

        for route in &inner.route_set {
            headers.push(rsip::Header::Route(route.clone()));
        }

        if matches!(method, rsip::Method::Invite | rsip::Method::Update) {
            let timer = inner.session_timer.lock();
            let interval = timer.interval.unwrap_or(inner.ua.config.session_expires);
            headers.push(headers::extension(
                SESSION_EXPIRES,
                SessionExpires {
                    interval,
                    refresher: Refresher::Unspecified,
                },
            ));
            headers.push(headers::extension(MIN_SE, MinSe(timer.min_interval)));
        }

        headers.extend(extra_headers);

        let body = body.unwrap_or_default();
        headers.push(rsip::Header::ContentLength((body.len() as u32).into()));

        rsip::Request {
            method,
            uri: inner.remote_target.lock().clone(),
            headers: headers.into(),
            version: rsip::Version::V2,
            body,
        }
    }

    /// Gatekeeper for incoming in-dialog requests. Returns `true` when the
    /// request may be handed to the dialog's owner.
    pub(crate) async fn check_in_dialog_request(&self, tsx: &ServerTransaction) -> Result<bool> {
        let request = tsx.request();
        let cseq = request.cseq_header()?.seq()?;
        let method = request.method.clone();

        let stale = {
            let mut remote_seq = self.inner.remote_seq.lock();
            match *remote_seq {
                None => {
                    *remote_seq = Some(cseq);
                    false
                }
                Some(current) if cseq < current => true,
                Some(current) => {
                    if cseq > current {
                        *remote_seq = Some(cseq);
                    }
                    false
                }
            }
        };

        if stale {
            debug!(dialog = %self.inner.id, %method, cseq, "request below remote CSeq");
            if method != rsip::Method::Ack {
                tsx.reply(rsip::StatusCode::ServerInternalError, vec![], None)
                    .await?;
            }
            return Ok(false);
        }

        match method {
            rsip::Method::Invite => {
                let busy = self
                    .inner
                    .last_invite_tx
                    .lock()
                    .as_ref()
                    .map(|t| t.state() == ServerTsxState::Proceeding)
                    .unwrap_or(false);

                if busy {
                    self.reply_retry_later(tsx).await?;
                    return Ok(false);
                }

                *self.inner.last_invite_tx.lock() = Some(tsx.clone());
            }
            rsip::Method::Update => {
                let busy = self
                    .inner
                    .last_update_tx
                    .lock()
                    .as_ref()
                    .map(|t| {
                        matches!(
                            t.state(),
                            ServerTsxState::Trying | ServerTsxState::Proceeding
                        )
                    })
                    .unwrap_or(false);

                if busy {
                    self.reply_retry_later(tsx).await?;
                    return Ok(false);
                }

                *self.inner.last_update_tx.lock() = Some(tsx.clone());
            }
            _ => {}
        }

        Ok(true)
    }

    async fn reply_retry_later(&self, tsx: &ServerTransaction) -> Result<()> {
        let after = rand::rng().random_range(1..=10u32);
        tsx.reply(
            rsip::StatusCode::ServerInternalError,
            vec![headers::extension("Retry-After", after)],
            None,
        )
        .await
    }

    /// Replace the remote target after the owner accepted a
    /// target-refresh request.
    pub(crate) fn target_refresh(&self, request: &rsip::Request) {
        if !matches!(
            request.method,
            rsip::Method::Invite | rsip::Method::Update | rsip::Method::Notify
        ) {
            return;
        }

        if let Ok(contact) = request.contact_header() {
            if let Ok(uri) = contact_uri(contact) {
                *self.inner.remote_target.lock() = uri;
            }
        }
    }

    pub(crate) fn owner_session(&self) -> Option<Arc<SessionInner>> {
        match self.inner.owner.lock().as_ref() {
            Some(DialogOwner::Session(weak)) => weak.upgrade(),
            _ => None,
        }
    }

    pub(crate) fn owner_refer(&self) -> Option<Arc<ReferInner>> {
        match self.inner.owner.lock().as_ref() {
            Some(DialogOwner::Refer(weak)) => weak.upgrade(),
            _ => None,
        }
    }

    /// Apply RFC 4028 headers of an INVITE/UPDATE request we accepted
    /// with a 2xx.
    pub(crate) fn process_timer_request(&self, headers: &rsip::Headers) {
        let refresher = SessionExpires::from_headers(headers).map(|se| se.refresher);
        // Request side: we refresh unless the peer claimed the uac role.
        let local = !matches!(refresher, Some(Refresher::Uac));
        self.process_timer(headers, local);
    }

    /// Apply RFC 4028 headers of a 2xx response to an INVITE/UPDATE we
    /// sent.
    pub(crate) fn process_timer_response(&self, headers: &rsip::Headers) {
        let refresher = SessionExpires::from_headers(headers).map(|se| se.refresher);
        // Response side: the refresher parameter is mandatory; without it
        // refresh stays disabled rather than guessed.
        match refresher {
            Some(Refresher::Uac) => self.process_timer(headers, true),
            Some(Refresher::Uas) => self.process_timer(headers, false),
            Some(Refresher::Unspecified) | None => self.disable_refresh(),
        }
    }

    fn process_timer(&self, hdrs: &rsip::Headers, local_refresher: bool) {
        let session_expires = SessionExpires::from_headers(hdrs);
        let min_se = MinSe::from_headers(hdrs);

        let delay = {
            let mut timer = self.inner.session_timer.lock();

            if let Some(MinSe(min)) = min_se {
                if min > timer.min_interval {
                    timer.min_interval = min;
                }
            }

            let Some(se) = session_expires else {
                drop(timer);
                self.disable_refresh();
                return;
            };

            timer.interval = Some(se.interval);
            timer.local_refresher = local_refresher;

            if let Some(token) = timer.timer.take() {
                self.inner.ua.timers.cancel(token);
            }

            let secs = if local_refresher {
                u64::from(se.interval) / 2
            } else {
                u64::from(se.interval).saturating_sub(u64::from(se.interval / 3).max(32))
            };

            Duration::from_secs(secs)
        };

        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.ua.timers.schedule(delay, async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let dialog = Dialog { inner };
            dialog.on_session_timer_fired().await;
        });

        self.inner.session_timer.lock().timer = Some(token);
    }

    fn disable_refresh(&self) {
        let mut timer = self.inner.session_timer.lock();
        timer.interval = None;
        if let Some(token) = timer.timer.take() {
            self.inner.ua.timers.cancel(token);
        }
    }

    async fn on_session_timer_fired(&self) {
        let local = self.inner.session_timer.lock().local_refresher;

        let Some(session) = self.owner_session() else {
            return;
        };

        if local {
            session.on_refresh_needed().await;
        } else {
            warn!(dialog = %self.inner.id, "session expired without refresh from peer");
            session.on_session_expired().await;
        }
    }

    /// Cancel the refresh timer and drop out of the registry. Idempotent.
    pub(crate) fn terminate(&self) {
        if !self.inner.registered.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut timer = self.inner.session_timer.lock();
        if let Some(token) = timer.timer.take() {
            self.inner.ua.timers.cancel(token);
        }
        drop(timer);

        self.inner.ua.dialogs.remove(&self.inner.id);
        debug!(dialog = %self.inner.id, "dialog terminated");
    }
}
