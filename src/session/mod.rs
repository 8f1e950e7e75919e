//! INVITE session lifecycle (RFC 3261 §13-§17).
//!
//! A [`Session`] owns at most one confirmed dialog plus any number of
//! early dialogs created by forking proxies, the re-INVITE/UPDATE
//! sub-transactions running on the confirmed dialog, and the media
//! handler. All state transitions funnel through [`SessionInner`] so the
//! retransmission and supervision timers can re-check state when they
//! fire.

use crate::dialog::{Dialog, DialogId, DialogOwner, DialogState};
use crate::endpoint::{UaEvent, UserAgentInner};
use crate::events::{Cause, Originator};
use crate::headers::{self, status_code_num, Reason, Refresher, SessionExpires, SESSION_EXPIRES};
use crate::media::MediaHandler;
use crate::refer::ReferInner;
use crate::transaction::{
    consts::{T1, T2, TIMER_H},
    make_call_id, make_tag, ClientTransaction, ServerTransaction,
};
use crate::timer::TimerToken;
use crate::transport::SipTarget;
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use rsip::prelude::{HeadersExt, UntypedHeader};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod dtmf;
pub mod reinvite;

pub use reinvite::{ReInviteResponder, UpdateResponder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Null,
    /// Initial INVITE sent, no provisional seen yet.
    Calling,
    /// A provisional with a To tag arrived.
    Early,
    /// Incoming INVITE passed validation.
    Incoming,
    WaitingForAnswer,
    WaitingForAck,
    Canceled,
    Confirmed,
    Terminated,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Null => "null",
            SessionState::Calling => "calling",
            SessionState::Early => "early",
            SessionState::Incoming => "incoming",
            SessionState::WaitingForAnswer => "waiting-for-answer",
            SessionState::WaitingForAck => "waiting-for-ack",
            SessionState::Canceled => "canceled",
            SessionState::Confirmed => "confirmed",
            SessionState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirection {
    Outgoing,
    Incoming,
}

/// Events delivered to the application, one stream per session.
pub enum SessionEvent {
    Progress {
        originator: Originator,
        response: Option<rsip::Response>,
    },
    Started {
        originator: Originator,
        response: Option<rsip::Response>,
    },
    Ended {
        originator: Originator,
        cause: Cause,
    },
    Failed {
        originator: Originator,
        cause: Cause,
        response: Option<rsip::Response>,
    },
    Dtmf {
        originator: Originator,
        tone: char,
        duration: u32,
    },
    ReInvite(ReInviteResponder),
    Update(UpdateResponder),
    /// The local side refreshed the session per RFC 4028.
    Refresh,
}

pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    pub(crate) fn from_rx(rx: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

/// Recognized fields for [`UserAgent::call`](crate::UserAgent::call).
#[derive(Default)]
pub struct CallOptions {
    pub anonymous: bool,
    pub expires: Option<u32>,
    pub extra_headers: Vec<rsip::Header>,
}

/// Recognized fields for [`Session::answer`].
#[derive(Default)]
pub struct AnswerOptions {
    pub extra_headers: Vec<rsip::Header>,
}

/// Recognized fields for [`Session::terminate`].
#[derive(Default)]
pub struct TerminateOptions {
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
    pub extra_headers: Vec<rsip::Header>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SessionKey {
    pub call_id: String,
    pub local_tag: String,
}

/// Context needed to CANCEL an in-flight outgoing INVITE.
struct PendingInvite {
    branch: String,
    request: rsip::Request,
    target: SipTarget,
}

#[derive(Default)]
struct SessionTimers {
    no_answer: Option<TimerToken>,
    expires: Option<TimerToken>,
    retrans_2xx: Option<TimerToken>,
    ack_wait: Option<TimerToken>,
}

pub(crate) struct SessionInner {
    pub(crate) ua: Arc<UserAgentInner>,
    pub(crate) key: SessionKey,
    pub(crate) direction: SessionDirection,

    state: Mutex<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,

    pub(crate) dialog: Mutex<Option<Dialog>>,
    early_dialogs: Mutex<HashMap<DialogId, Dialog>>,

    pub(crate) media: tokio::sync::Mutex<Option<Box<dyn MediaHandler>>>,
    remote_offer: Mutex<Option<Vec<u8>>>,
    /// Set when our 200 carried the offer and the answer rides the ACK.
    answer_in_ack: AtomicBool,

    /// UAS: the initial INVITE transaction.
    invite_tsx: Mutex<Option<ServerTransaction>>,
    /// UAC: what is needed to CANCEL the initial INVITE.
    pending_invite: Mutex<Option<PendingInvite>>,
    invite_cseq: Mutex<Option<u32>>,

    is_canceled: AtomicBool,
    cancel_sent: AtomicBool,
    cancel_reason: Mutex<Option<(u16, Option<String>)>>,
    received_100: AtomicBool,

    pub(crate) allowed_methods: Mutex<Option<Vec<rsip::Method>>>,

    timers: Mutex<SessionTimers>,
    /// Cached ACK, re-sent verbatim on duplicate 2xx.
    ack_for_2xx: Mutex<Option<rsip::Request>>,

    pub(crate) reinvite_busy: AtomicBool,
    update_busy: AtomicBool,
    pub(crate) reinvite_ack_cseq: Mutex<Option<u32>>,

    pub(crate) dtmf: Mutex<dtmf::DtmfQueue>,

    /// Refer subscriptions sharing this session's dialog, by Event id.
    pub(crate) refers: Mutex<HashMap<String, Arc<ReferInner>>>,

    closed: CancellationToken,
}

/// Handle to a multimedia call. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn direction(&self) -> SessionDirection {
        self.inner.direction
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Confirmed
    }

    pub fn call_id(&self) -> &str {
        &self.inner.key.call_id
    }

    /// The confirmed dialog, once there is one.
    pub fn dialog_id(&self) -> Option<DialogId> {
        self.inner.dialog.lock().as_ref().map(|d| d.id().clone())
    }

    /// Answer an incoming call with a 200.
    pub async fn answer(
        &self,
        media: Box<dyn MediaHandler>,
        options: AnswerOptions,
    ) -> Result<()> {
        self.inner.answer(media, options).await
    }

    /// Terminate the session in whatever way its state requires: BYE when
    /// established, CANCEL for a pending outgoing INVITE, a failure
    /// response for an unanswered incoming one. Idempotent once
    /// terminated.
    pub async fn terminate(&self, options: TerminateOptions) -> Result<()> {
        self.inner.terminate(options).await
    }

    /// Queue DTMF tones, sent as INFO requests.
    pub fn send_dtmf(&self, tones: &str, options: dtmf::DtmfOptions) -> Result<()> {
        dtmf::send_dtmf(&self.inner, tones, options)
    }

    /// Send a bodyless or SDP-bearing UPDATE.
    pub async fn send_update(&self, body: Option<Vec<u8>>) -> Result<()> {
        self.inner.send_update(body).await
    }

    /// Re-negotiate the session with a re-INVITE.
    pub async fn renegotiate(&self) -> Result<()> {
        reinvite::send_reinvite(&self.inner).await
    }

    /// Transfer the peer: send an in-dialog REFER.
    pub async fn refer(
        &self,
        refer_to: rsip::Uri,
        options: crate::refer::ReferOptions,
    ) -> Result<(crate::refer::OutgoingRefer, crate::refer::ReferEvents)> {
        crate::refer::send_refer_in_dialog(&self.inner, refer_to, options).await
    }
}

impl SessionInner {
    fn new(
        ua: Arc<UserAgentInner>,
        key: SessionKey,
        direction: SessionDirection,
        events: mpsc::UnboundedSender<SessionEvent>,
        media: Option<Box<dyn MediaHandler>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ua,
            key,
            direction,
            state: Mutex::new(SessionState::Null),
            events,
            dialog: Mutex::new(None),
            early_dialogs: Mutex::new(HashMap::new()),
            media: tokio::sync::Mutex::new(media),
            remote_offer: Mutex::new(None),
            answer_in_ack: AtomicBool::new(false),
            invite_tsx: Mutex::new(None),
            pending_invite: Mutex::new(None),
            invite_cseq: Mutex::new(None),
            is_canceled: AtomicBool::new(false),
            cancel_sent: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
            received_100: AtomicBool::new(false),
            allowed_methods: Mutex::new(None),
            timers: Mutex::new(SessionTimers::default()),
            ack_for_2xx: Mutex::new(None),
            reinvite_busy: AtomicBool::new(false),
            update_busy: AtomicBool::new(false),
            reinvite_ack_cseq: Mutex::new(None),
            dtmf: Mutex::new(dtmf::DtmfQueue::default()),
            refers: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        })
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, new: SessionState) -> SessionState {
        let mut state = self.state.lock();
        let old = *state;
        if old != SessionState::Terminated {
            *state = new;
        }
        old
    }

    /// Enter `Terminated`; returns false when already there.
    fn enter_terminated(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Terminated {
            false
        } else {
            *state = SessionState::Terminated;
            true
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn confirmed_dialog(&self) -> Option<Dialog> {
        self.dialog.lock().clone()
    }

    pub(crate) fn require_dialog(&self) -> Result<Dialog> {
        self.confirmed_dialog()
            .ok_or_else(|| Error::invalid_state("in-dialog request", self.state().name()))
    }

    pub(crate) fn check_peer_allows(&self, method: rsip::Method) -> Result<()> {
        let allowed = self.allowed_methods.lock();
        match allowed.as_ref() {
            Some(methods) if !methods.contains(&method) => Err(Error::NotAllowedByPeer(method)),
            _ => Ok(()),
        }
    }

    // ==== outgoing calls

    pub(crate) fn start_outgoing(
        ua: Arc<UserAgentInner>,
        target: rsip::Uri,
        media: Box<dyn MediaHandler>,
        options: CallOptions,
    ) -> (Session, SessionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();

        let key = SessionKey {
            call_id: make_call_id(),
            local_tag: make_tag(),
        };

        let inner = SessionInner::new(
            ua.clone(),
            key.clone(),
            SessionDirection::Outgoing,
            tx,
            Some(media),
        );

        ua.sessions.lock().insert(
            key,
            Session {
                inner: inner.clone(),
            },
        );

        let task = inner.clone();
        tokio::spawn(async move {
            task.run_outgoing(target, options).await;
        });

        (Session { inner }, SessionEvents { rx })
    }

    async fn run_outgoing(self: Arc<Self>, target: rsip::Uri, options: CallOptions) {
        let offer = {
            let mut media = self.media.lock().await;
            match media.as_mut() {
                Some(media) => media.create_offer().await,
                None => return,
            }
        };

        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                warn!(call_id = %self.key.call_id, error = %e, "local media failed");
                self.failed(Originator::Local, e.cause(), None).await;
                return;
            }
        };

        if self.state() == SessionState::Terminated {
            return;
        }

        let request = self.build_invite(&target, offer, &options);
        let sip_target = SipTarget::from_uri(&target);

        self.set_state(SessionState::Calling);

        let mut tsx = match ClientTransaction::send(self.ua.clone(), request.clone(), sip_target)
            .await
        {
            Ok(tsx) => tsx,
            Err(_) => {
                self.failed(Originator::System, Cause::ConnectionError, None)
                    .await;
                return;
            }
        };

        if let Ok(cseq) = request.cseq_header().and_then(|c| c.seq()) {
            *self.invite_cseq.lock() = Some(cseq);
        }

        *self.pending_invite.lock() = Some(PendingInvite {
            branch: tsx.branch().to_string(),
            request,
            target: tsx.target().clone(),
        });

        // terminate() may have latched a cancel while the offer was built
        if self.is_canceled.load(Ordering::SeqCst) && self.received_100.load(Ordering::SeqCst) {
            self.send_cancel().await;
        }

        loop {
            let response = tokio::select! {
                _ = self.closed.cancelled() => break,
                response = tsx.receive() => response,
            };

            let Some(response) = response else {
                break;
            };

            let code = status_code_num(&response.status_code);

            match code {
                100 => {
                    self.received_100.store(true, Ordering::SeqCst);
                    if self.is_canceled.load(Ordering::SeqCst) {
                        self.send_cancel().await;
                    }
                }
                101..=199 => self.handle_invite_provisional(response).await,
                200..=299 => self.handle_invite_2xx(response).await,
                _ => {
                    self.handle_invite_failure(response).await;
                    break;
                }
            }

            if self.state() == SessionState::Terminated {
                // keep draining for 2xx retransmissions of an absorbed
                // dialog? no: the throwaway dialogs answer with BYE
                break;
            }
        }
    }

    fn build_invite(
        &self,
        target: &rsip::Uri,
        offer: Vec<u8>,
        options: &CallOptions,
    ) -> rsip::Request {
        let config = &self.ua.config;

        let from_uri = if options.anonymous {
            rsip::Uri::try_from("sip:anonymous@anonymous.invalid")
                .unwrap_or_else(|_| config.identity.clone())
        } else {
            config.identity.clone()
        };

        let from = rsip::typed::From {
            display_name: options.anonymous.then(|| "Anonymous".to_string()),
            uri: from_uri,
            params: vec![],
        }
        .with_tag(self.key.local_tag.clone().into());

        let to = rsip::typed::To {
            display_name: None,
            uri: target.clone(),
            params: vec![],
        };

        let mut hdrs: Vec<rsip::Header> = vec![
            rsip::Header::From(from.into()),
            rsip::Header::To(to.into()),
            rsip::Header::CallId(self.key.call_id.clone().into()),
            rsip::Header::CSeq(
                rsip::typed::CSeq {
                    seq: rand::rng().random_range(0..10_000),
                    method: rsip::Method::Invite,
                }
                .into(),
            ),
            rsip::Header::MaxForwards(70.into()),
            rsip::typed::Contact {
                display_name: None,
                uri: config.contact.clone(),
                params: vec![],
            }
            .into(),
            rsip::Header::UserAgent(config.user_agent.clone().into()),
            rsip::Header::Allow(self.ua.allow_value().into()),
            rsip::Header::Supported(self.ua.supported_value().into()),
            rsip::Header::ContentType(headers::CONTENT_TYPE_SDP.to_string().into()),
        ];

        hdrs.push(headers::extension(
            SESSION_EXPIRES,
            SessionExpires {
                interval: config.session_expires,
                refresher: Refresher::Unspecified,
            },
        ));
        hdrs.push(headers::extension(
            headers::MIN_SE,
            headers::MinSe(config.min_session_expires),
        ));

        if let Some(expires) = options.expires {
            hdrs.push(rsip::Header::Expires(expires.to_string().into()));
        }

        hdrs.extend(options.extra_headers.iter().cloned());
        hdrs.push(rsip::Header::ContentLength((offer.len() as u32).into()));

        rsip::Request {
            method: rsip::Method::Invite,
            uri: target.clone(),
            headers: hdrs.into(),
            version: rsip::Version::V2,
            body: offer,
        }
    }

    async fn handle_invite_provisional(&self, response: rsip::Response) {
        self.received_100.store(true, Ordering::SeqCst);

        if self.is_canceled.load(Ordering::SeqCst) {
            self.send_cancel().await;
            return;
        }

        let has_to_tag = matches!(response.to_header().and_then(|t| t.tag()), Ok(Some(_)));

        if has_to_tag {
            let id = DialogId::from_response(&response);
            let request = self.pending_invite.lock().as_ref().map(|p| p.request.clone());

            if let (Some(id), Some(request)) = (id, request) {
                let known = self.early_dialogs.lock().contains_key(&id);

                if !known {
                    match Dialog::new_uac(self.ua.clone(), &request, &response) {
                        Ok(dialog) => {
                            self.early_dialogs.lock().insert(id, dialog);
                        }
                        Err(Error::MissingHeader("Contact")) => {
                            // no Contact, no early dialog; progress still counts
                        }
                        Err(e) => debug!(error = %e, "could not create early dialog"),
                    }
                }
            }

            self.set_state(SessionState::Early);
        }

        self.emit(SessionEvent::Progress {
            originator: Originator::Remote,
            response: Some(response),
        });
    }

    async fn handle_invite_failure(&self, response: rsip::Response) {
        let code = status_code_num(&response.status_code);

        for (_, dialog) in self.early_dialogs.lock().drain() {
            dialog.terminate();
        }

        if self.is_canceled.load(Ordering::SeqCst) {
            self.failed(Originator::Local, Cause::Canceled, Some(response))
                .await;
        } else {
            self.failed(Originator::Remote, Cause::from_status(code), Some(response))
                .await;
        }
    }

    async fn handle_invite_2xx(self: &Arc<Self>, response: rsip::Response) {
        let response_id = DialogId::from_response(&response);

        // CANCEL lost the race: accept the dialog, then drop it
        if self.is_canceled.load(Ordering::SeqCst) {
            self.absorb_2xx(&response).await;
            self.failed(Originator::Local, Cause::Canceled, None).await;
            return;
        }

        let confirmed = self.confirmed_dialog();

        if let Some(dialog) = confirmed {
            match response_id {
                Some(ref id) if *id == *dialog.id() => {
                    // retransmitted 2xx: answer with the cached ACK
                    self.retransmit_ack().await;
                }
                _ => {
                    info!(call_id = %self.key.call_id, "absorbing forked 2xx");
                    self.absorb_2xx(&response).await;
                }
            }
            return;
        }

        if self.state() == SessionState::Terminated {
            self.absorb_2xx(&response).await;
            return;
        }

        // promote the matching early dialog, or build one from the 2xx
        let dialog = match response_id.and_then(|id| self.early_dialogs.lock().remove(&id)) {
            Some(early) => {
                early.confirm();
                early
            }
            None => {
                let request = match self.pending_invite.lock().as_ref().map(|p| p.request.clone())
                {
                    Some(request) => request,
                    None => return,
                };

                match Dialog::new_uac(self.ua.clone(), &request, &response) {
                    Ok(dialog) => dialog,
                    Err(e) => {
                        warn!(error = %e, "2xx did not establish a dialog");
                        self.failed(Originator::Remote, Cause::InternalError, Some(response))
                            .await;
                        return;
                    }
                }
            }
        };

        let weak = Arc::downgrade(self);
        dialog.set_owner(DialogOwner::Session(weak));
        *self.dialog.lock() = Some(dialog.clone());

        *self.allowed_methods.lock() = headers::allow_methods(&response.headers);
        dialog.process_timer_response(&response.headers);

        let ack_cseq = response
            .cseq_header()
            .and_then(|c| c.seq())
            .ok()
            .or_else(|| *self.invite_cseq.lock());

        self.send_ack(&dialog, ack_cseq).await;

        // the 2xx must answer our offer
        let answer = response.body.clone();
        let media_result = if answer.is_empty() {
            Err(crate::media::MediaError::BadDescription)
        } else {
            let mut media = self.media.lock().await;
            match media.as_mut() {
                Some(media) => media.apply_answer(answer).await,
                None => Ok(()),
            }
        };

        if let Err(e) = media_result {
            warn!(call_id = %self.key.call_id, error = %e, "2xx answer rejected");
            self.send_bye_on(&dialog, vec![], None).await;
            self.failed(Originator::Remote, e.cause(), Some(response))
                .await;
            return;
        }

        self.set_state(SessionState::Confirmed);
        info!(call_id = %self.key.call_id, dialog = %dialog.id(), "session confirmed");
        self.emit(SessionEvent::Started {
            originator: Originator::Remote,
            response: Some(response),
        });
    }

    /// ACK then BYE a 2xx that will not become the session: a fork, a
    /// retransmission for a dead session, or the 2xx that raced our
    /// CANCEL.
    async fn absorb_2xx(&self, response: &rsip::Response) {
        let request = match self.pending_invite.lock().as_ref().map(|p| p.request.clone()) {
            Some(request) => request,
            None => return,
        };

        // remove a matching early dialog first so the throwaway does not
        // collide with it in the registry
        if let Some(id) = DialogId::from_response(response) {
            let early = self.early_dialogs.lock().remove(&id);
            if let Some(early) = early {
                early.confirm();
                let cseq = response.cseq_header().and_then(|c| c.seq()).ok();
                self.send_ack(&early, cseq).await;
                self.send_bye_on(&early, vec![], None).await;
                early.terminate();
                return;
            }
        }

        match Dialog::new_uac(self.ua.clone(), &request, response) {
            Ok(dialog) => {
                let cseq = response.cseq_header().and_then(|c| c.seq()).ok();
                self.send_ack(&dialog, cseq).await;
                self.send_bye_on(&dialog, vec![], None).await;
                dialog.terminate();
            }
            Err(e) => debug!(error = %e, "cannot absorb 2xx without dialog"),
        }
    }

    async fn send_ack(&self, dialog: &Dialog, cseq: Option<u32>) {
        let ack = dialog.make_request(rsip::Method::Ack, cseq, vec![], None);
        *self.ack_for_2xx.lock() = Some(ack.clone());

        let target = dialog.next_hop();
        if let Err(e) = self.ua.transport.send(&target, ack.into()).await {
            warn!(error = %e, "failed to send ACK");
        }
    }

    async fn retransmit_ack(&self) {
        let ack = self.ack_for_2xx.lock().clone();
        let Some(ack) = ack else { return };

        let target = SipTarget::from_uri(&ack.uri);
        if let Err(e) = self.ua.transport.send(&target, ack.into()).await {
            warn!(error = %e, "failed to retransmit ACK");
        }
    }

    async fn send_bye_on(
        &self,
        dialog: &Dialog,
        extra_headers: Vec<rsip::Header>,
        body: Option<Vec<u8>>,
    ) {
        let bye = dialog.make_request(rsip::Method::Bye, None, extra_headers, body);
        let target = dialog.next_hop();

        match ClientTransaction::send(self.ua.clone(), bye, target).await {
            Ok(mut tsx) => {
                tokio::spawn(async move {
                    let _ = tsx.receive_final().await;
                });
            }
            Err(e) => warn!(error = %e, "failed to send BYE"),
        }
    }

    async fn send_cancel(&self) {
        if self.cancel_sent.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some((branch, mut cancel, target)) = ({
            let pending = self.pending_invite.lock();
            pending.as_ref().map(|p| {
                let mut request = p.request.clone();
                request.method = rsip::Method::Cancel;
                request.body = Vec::new();
                (p.branch.clone(), request, p.target.clone())
            })
        }) else {
            return;
        };

        if let Ok(cseq) = cancel.cseq_header_mut() {
            // CANCEL shares the INVITE CSeq number with its own method
            let seq = cseq.seq().unwrap_or(1);
            *cseq = rsip::typed::CSeq {
                seq,
                method: rsip::Method::Cancel,
            }
            .into();
        }

        if let Some((code, text)) = self.cancel_reason.lock().clone() {
            cancel
                .headers
                .push(headers::extension(headers::REASON, Reason { cause: code, text }));
        }

        match ClientTransaction::send_with_branch(self.ua.clone(), cancel, target, branch).await {
            Ok(mut tsx) => {
                tokio::spawn(async move {
                    let _ = tsx.receive_final().await;
                });
            }
            Err(e) => warn!(error = %e, "failed to send CANCEL"),
        }
    }

    // ==== incoming calls

    pub(crate) async fn init_incoming(ua: Arc<UserAgentInner>, tsx: ServerTransaction) {
        let request = tsx.request().clone();

        if !request.body.is_empty() {
            let sdp = headers::content_type(&request.headers)
                .map(|ct| ct.contains(headers::CONTENT_TYPE_SDP))
                .unwrap_or(false);

            if !sdp {
                let _ = tsx
                    .reply(rsip::StatusCode::UnsupportedMediaType, vec![], None)
                    .await;
                return;
            }
        }

        let call_id = match request.call_id_header() {
            Ok(call_id) => call_id.value().to_string(),
            Err(_) => {
                let _ = tsx.reply(rsip::StatusCode::BadRequest, vec![], None).await;
                return;
            }
        };

        let local_tag = make_tag();

        // 100 goes out before the dialog exists; its To stays untagged
        let _ = tsx.reply(rsip::StatusCode::Trying, vec![], None).await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let key = SessionKey {
            call_id,
            local_tag: local_tag.clone(),
        };
        let inner = SessionInner::new(
            ua.clone(),
            key.clone(),
            SessionDirection::Incoming,
            events_tx,
            None,
        );

        tsx.set_local_tag(local_tag.clone());

        let dialog = match Dialog::new_uas(ua.clone(), &request, &local_tag, DialogState::Early) {
            Ok(dialog) => dialog,
            Err(e) => {
                debug!(error = %e, "rejecting INVITE that cannot form a dialog");
                let _ = tsx.reply(rsip::StatusCode::BadRequest, vec![], None).await;
                return;
            }
        };

        dialog.set_owner(DialogOwner::Session(Arc::downgrade(&inner)));
        *inner.dialog.lock() = Some(dialog);
        *inner.invite_tsx.lock() = Some(tsx.clone());
        *inner.invite_cseq.lock() = request.cseq_header().and_then(|c| c.seq()).ok();
        *inner.allowed_methods.lock() = headers::allow_methods(&request.headers);

        if !request.body.is_empty() {
            *inner.remote_offer.lock() = Some(request.body.clone());
        }

        inner.set_state(SessionState::Incoming);

        ua.sessions.lock().insert(
            key,
            Session {
                inner: inner.clone(),
            },
        );
        if let Some(branch) = crate::transaction::branch_of(&request) {
            ua.invite_branches.lock().insert(
                branch,
                Session {
                    inner: inner.clone(),
                },
            );
        }

        // ring and arm the supervision timers
        let contact = inner.contact_header();
        let allow = rsip::Header::Allow(ua.allow_value().into());
        if tsx
            .reply(rsip::StatusCode::Ringing, vec![contact, allow], None)
            .await
            .is_err()
        {
            inner.on_transport_error().await;
            return;
        }

        inner.set_state(SessionState::WaitingForAnswer);

        let no_answer = ua.config.no_answer_timeout;
        let weak = Arc::downgrade(&inner);
        inner.timers.lock().no_answer = Some(ua.timers.schedule(no_answer, async move {
            if let Some(session) = weak.upgrade() {
                session.on_no_answer().await;
            }
        }));

        if let Some(expires) = headers::expires_value(&request.headers) {
            let weak = Arc::downgrade(&inner);
            inner.timers.lock().expires = Some(ua.timers.schedule(
                Duration::from_secs(u64::from(expires)),
                async move {
                    if let Some(session) = weak.upgrade() {
                        session.on_expires().await;
                    }
                },
            ));
        }

        ua.emit(UaEvent::NewSession {
            session: Session { inner },
            events: SessionEvents { rx: events_rx },
        });
    }

    pub(crate) fn contact_header(&self) -> rsip::Header {
        rsip::typed::Contact {
            display_name: None,
            uri: self.ua.config.contact.clone(),
            params: vec![],
        }
        .into()
    }

    async fn answer(
        self: &Arc<Self>,
        mut media: Box<dyn MediaHandler>,
        options: AnswerOptions,
    ) -> Result<()> {
        {
            let state = self.state.lock();
            if *state != SessionState::WaitingForAnswer {
                return Err(Error::invalid_state("answer", state.name()));
            }
        }

        {
            let mut timers = self.timers.lock();
            for token in [timers.no_answer.take(), timers.expires.take()]
                .into_iter()
                .flatten()
            {
                self.ua.timers.cancel(token);
            }
        }

        let offer = self.remote_offer.lock().take();
        let sdp = match offer {
            Some(offer) => media.create_answer(offer).await,
            None => {
                // offer goes in our 200, answer arrives in the ACK
                self.answer_in_ack.store(true, Ordering::SeqCst);
                media.create_offer().await
            }
        };

        let sdp = match sdp {
            Ok(sdp) => sdp,
            Err(e) => {
                let status = match e {
                    crate::media::MediaError::Denied => rsip::StatusCode::TemporarilyUnavailable,
                    crate::media::MediaError::BadDescription => rsip::StatusCode::NotAcceptableHere,
                    crate::media::MediaError::Backend(_) => rsip::StatusCode::ServerInternalError,
                };

                let tsx = self.invite_tsx.lock().clone();
                if let Some(tsx) = tsx {
                    let _ = tsx.reply(status, vec![], None).await;
                }

                let cause = e.cause();
                self.failed(Originator::Local, cause, None).await;
                return Ok(());
            }
        };

        *self.media.lock().await = Some(media);

        let tsx = self
            .invite_tsx
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("answer", "no transaction"))?;

        let dialog = self.require_dialog()?;

        // RFC 4028: adopt what the INVITE asked for before answering
        let invite_supports_timer = SessionExpires::from_headers(&tsx.request().headers).is_some();
        if invite_supports_timer {
            dialog.process_timer_request(&tsx.request().headers);
        }

        let mut hdrs = vec![
            self.contact_header(),
            rsip::Header::Allow(self.ua.allow_value().into()),
            rsip::Header::Supported(self.ua.supported_value().into()),
            rsip::Header::ContentType(headers::CONTENT_TYPE_SDP.to_string().into()),
        ];

        if invite_supports_timer {
            hdrs.extend(reinvite::timer_response_headers(&dialog));
        }

        hdrs.extend(options.extra_headers);

        dialog.confirm();
        self.set_state(SessionState::WaitingForAck);

        if let Err(e) = tsx.reply(rsip::StatusCode::OK, hdrs, Some(sdp)).await {
            self.on_transport_error().await;
            return Err(e);
        }

        self.arm_2xx_retransmission(tsx.clone(), None);

        Ok(())
    }

    /// Retransmit the 2xx every T1 (doubling up to T2) until ACK or the
    /// ACK-wait gives up; the transaction layer tears down on the first
    /// 2xx so this lives here.
    pub(crate) fn arm_2xx_retransmission(
        self: &Arc<Self>,
        tsx: ServerTransaction,
        reinvite_cseq: Option<u32>,
    ) {
        if let Some(cseq) = reinvite_cseq {
            *self.reinvite_ack_cseq.lock() = Some(cseq);
        }

        let retrans_tsx = tsx.clone();
        let retrans = self.ua.timers.schedule(T1, async move {
            let mut delta = T1 * 2;
            loop {
                if retrans_tsx.retransmit().await.is_err() {
                    break;
                }
                tokio::time::sleep(delta.min(T2)).await;
                delta = (delta * 2).min(T2);
            }
        });

        let weak = Arc::downgrade(self);
        let ack_wait = self.ua.timers.schedule(TIMER_H, async move {
            if let Some(session) = weak.upgrade() {
                session.on_ack_timeout().await;
            }
        });

        let mut timers = self.timers.lock();
        if let Some(previous) = timers.retrans_2xx.replace(retrans) {
            self.ua.timers.cancel(previous);
        }
        if let Some(previous) = timers.ack_wait.replace(ack_wait) {
            self.ua.timers.cancel(previous);
        }
    }

    fn cancel_2xx_timers(&self) {
        let mut timers = self.timers.lock();
        for token in [timers.retrans_2xx.take(), timers.ack_wait.take()]
            .into_iter()
            .flatten()
        {
            self.ua.timers.cancel(token);
        }
    }

    pub(crate) async fn handle_ack(&self, request: rsip::Request) {
        let reinvite_cseq = *self.reinvite_ack_cseq.lock();
        let cseq = request.cseq_header().and_then(|c| c.seq()).ok();

        if let (Some(expected), Some(cseq)) = (reinvite_cseq, cseq) {
            if expected == cseq {
                *self.reinvite_ack_cseq.lock() = None;
                self.cancel_2xx_timers();
                self.reinvite_busy.store(false, Ordering::SeqCst);
                reinvite::apply_ack_answer(self, request).await;
                return;
            }
        }

        if self.state() != SessionState::WaitingForAck {
            return;
        }

        if let (Some(expected), Some(cseq)) = (*self.invite_cseq.lock(), cseq) {
            if expected != cseq {
                return;
            }
        }

        self.cancel_2xx_timers();

        if self.answer_in_ack.swap(false, Ordering::SeqCst) && !request.body.is_empty() {
            let result = {
                let mut media = self.media.lock().await;
                match media.as_mut() {
                    Some(media) => media.apply_answer(request.body.clone()).await,
                    None => Ok(()),
                }
            };

            if let Err(e) = result {
                warn!(error = %e, "answer in ACK rejected");
                if let Some(dialog) = self.confirmed_dialog() {
                    self.send_bye_on(&dialog, vec![], None).await;
                }
                self.failed(Originator::Remote, e.cause(), None).await;
                return;
            }
        }

        self.set_state(SessionState::Confirmed);
        info!(call_id = %self.key.call_id, "session confirmed");
        self.emit(SessionEvent::Started {
            originator: Originator::Remote,
            response: None,
        });
    }

    async fn on_ack_timeout(&self) {
        if self.state() != SessionState::WaitingForAck && self.reinvite_ack_cseq.lock().is_none() {
            return;
        }

        warn!(call_id = %self.key.call_id, "no ACK received, hanging up");
        self.cancel_2xx_timers();
        *self.reinvite_ack_cseq.lock() = None;

        if let Some(dialog) = self.confirmed_dialog() {
            self.send_bye_on(&dialog, vec![], None).await;
        }

        self.ended(Originator::Remote, Cause::NoAck).await;
    }

    async fn on_no_answer(&self) {
        if self.state() != SessionState::WaitingForAnswer {
            return;
        }

        let tsx = self.invite_tsx.lock().clone();
        if let Some(tsx) = tsx {
            let _ = tsx
                .reply(rsip::StatusCode::TemporarilyUnavailable, vec![], None)
                .await;
        }

        self.failed(Originator::Local, Cause::NoAnswer, None).await;
    }

    async fn on_expires(&self) {
        if self.state() != SessionState::WaitingForAnswer {
            return;
        }

        let tsx = self.invite_tsx.lock().clone();
        if let Some(tsx) = tsx {
            let _ = tsx
                .reply(rsip::StatusCode::RequestTerminated, vec![], None)
                .await;
        }

        self.failed(Originator::System, Cause::Expires, None).await;
    }

    /// Replay the last response to a retransmitted initial INVITE.
    pub(crate) async fn retransmit_invite_response(&self) {
        let tsx = self.invite_tsx.lock().clone();
        if let Some(tsx) = tsx {
            let _ = tsx.retransmit().await;
        }
    }

    pub(crate) async fn handle_cancel(&self, cancel_tsx: ServerTransaction) {
        let answerable = matches!(
            self.state(),
            SessionState::Incoming | SessionState::WaitingForAnswer
        );

        let _ = cancel_tsx.reply(rsip::StatusCode::OK, vec![], None).await;

        if !answerable {
            return;
        }

        self.set_state(SessionState::Canceled);

        let invite_tsx = self.invite_tsx.lock().clone();
        if let Some(invite_tsx) = invite_tsx {
            let _ = invite_tsx
                .reply(rsip::StatusCode::RequestTerminated, vec![], None)
                .await;
        }

        self.failed(Originator::Remote, Cause::Canceled, None).await;
    }

    pub(crate) async fn handle_bye(&self, tsx: ServerTransaction) {
        let _ = tsx.reply(rsip::StatusCode::OK, vec![], None).await;

        let established = matches!(
            self.state(),
            SessionState::Confirmed | SessionState::WaitingForAck
        );

        if established {
            self.ended(Originator::Remote, Cause::Bye).await;
        } else {
            // BYE before the final response also kills the INVITE
            let invite_tsx = self.invite_tsx.lock().clone();
            if let Some(invite_tsx) = invite_tsx {
                let _ = invite_tsx
                    .reply(rsip::StatusCode::RequestTerminated, vec![], None)
                    .await;
            }
            self.failed(Originator::Remote, Cause::Bye, None).await;
        }
    }

    // ==== session timer callbacks

    pub(crate) async fn on_refresh_needed(&self) {
        if self.state() != SessionState::Confirmed {
            return;
        }

        debug!(call_id = %self.key.call_id, "refreshing session");
        if self.send_update(None).await.is_ok() {
            self.emit(SessionEvent::Refresh);
        }
    }

    pub(crate) async fn on_session_expired(&self) {
        if self.enter_terminated() {
            if let Some(dialog) = self.confirmed_dialog() {
                let reason = headers::extension(
                    headers::REASON,
                    Reason::new(408, Some("Session Timer".to_owned())),
                );
                self.send_bye_on(&dialog, vec![reason], None).await;
            }

            self.emit(SessionEvent::Ended {
                originator: Originator::System,
                cause: Cause::SessionTimer,
            });
            self.cleanup().await;
        }
    }

    // ==== UPDATE

    pub(crate) async fn send_update(&self, body: Option<Vec<u8>>) -> Result<()> {
        {
            let state = self.state.lock();
            if !matches!(
                *state,
                SessionState::Confirmed | SessionState::WaitingForAck
            ) {
                return Err(Error::invalid_state("update", state.name()));
            }
        }

        self.check_peer_allows(rsip::Method::Update)?;

        if self.update_busy.swap(true, Ordering::SeqCst) {
            return Err(Error::RequestPending(rsip::Method::Update));
        }

        let result = self.do_send_update(body).await;
        self.update_busy.store(false, Ordering::SeqCst);
        result
    }

    async fn do_send_update(&self, body: Option<Vec<u8>>) -> Result<()> {
        let dialog = self.require_dialog()?;

        let mut hdrs = vec![self.contact_header()];
        if body.is_some() {
            hdrs.push(rsip::Header::ContentType(
                headers::CONTENT_TYPE_SDP.to_string().into(),
            ));
        }

        let request = dialog.make_request(rsip::Method::Update, None, hdrs, body);
        let target = dialog.next_hop();

        let mut tsx = ClientTransaction::send(self.ua.clone(), request, target).await?;
        let response = tsx.receive_final().await?;
        let code = status_code_num(&response.status_code);

        if (200..300).contains(&code) {
            dialog.process_timer_response(&response.headers);
            Ok(())
        } else {
            Err(Error::PeerRejected(code))
        }
    }

    // ==== termination

    async fn terminate(&self, options: TerminateOptions) -> Result<()> {
        if let Some(code) = options.status_code {
            if !(300..700).contains(&code) {
                return Err(Error::InvalidStatusCode(code));
            }
        }

        let state = self.state();

        match state {
            SessionState::Terminated => Ok(()),
            SessionState::Confirmed | SessionState::WaitingForAck => {
                if !self.enter_terminated() {
                    return Ok(());
                }

                let mut extra = options.extra_headers;
                if let Some(code) = options.status_code {
                    extra.push(headers::extension(
                        headers::REASON,
                        Reason {
                            cause: code,
                            text: options.reason_phrase,
                        },
                    ));
                }

                if let Some(dialog) = self.confirmed_dialog() {
                    self.send_bye_on(&dialog, extra, options.body).await;
                }

                self.emit(SessionEvent::Ended {
                    originator: Originator::Local,
                    cause: Cause::Bye,
                });
                self.cleanup().await;
                Ok(())
            }
            SessionState::Calling => {
                self.is_canceled.store(true, Ordering::SeqCst);
                if let Some(code) = options.status_code {
                    *self.cancel_reason.lock() = Some((code, options.reason_phrase));
                }
                self.set_state(SessionState::Canceled);

                // CANCEL may only chase the INVITE once a provisional
                // arrived; until then it stays latched
                if self.received_100.load(Ordering::SeqCst) {
                    self.send_cancel().await;
                }
                Ok(())
            }
            SessionState::Early => {
                self.is_canceled.store(true, Ordering::SeqCst);
                if let Some(code) = options.status_code {
                    *self.cancel_reason.lock() = Some((code, options.reason_phrase));
                }
                self.set_state(SessionState::Canceled);
                self.send_cancel().await;
                Ok(())
            }
            SessionState::Incoming | SessionState::WaitingForAnswer => {
                let status = headers::status_from_u16(options.status_code.unwrap_or(480))?;

                let tsx = self.invite_tsx.lock().clone();
                if let Some(tsx) = tsx {
                    let _ = tsx.reply(status, options.extra_headers, None).await;
                }

                self.failed(Originator::Local, Cause::Rejected, None).await;
                Ok(())
            }
            SessionState::Null | SessionState::Canceled => {
                self.failed(Originator::Local, Cause::Canceled, None).await;
                Ok(())
            }
        }
    }

    pub(crate) async fn on_transport_error(&self) {
        let established = matches!(
            self.state(),
            SessionState::Confirmed | SessionState::WaitingForAck
        );

        if established {
            self.ended(Originator::System, Cause::ConnectionError).await;
        } else {
            self.failed(Originator::System, Cause::ConnectionError, None)
                .await;
        }
    }

    async fn failed(&self, originator: Originator, cause: Cause, response: Option<rsip::Response>) {
        if self.enter_terminated() {
            self.emit(SessionEvent::Failed {
                originator,
                cause,
                response,
            });
            self.cleanup().await;
        }
    }

    async fn ended(&self, originator: Originator, cause: Cause) {
        if self.enter_terminated() {
            self.emit(SessionEvent::Ended { originator, cause });
            self.cleanup().await;
        }
    }

    /// Hang up after an unusable SDP exchange on an established session.
    pub(crate) async fn terminate_with_bad_media(&self) {
        if self.enter_terminated() {
            if let Some(dialog) = self.confirmed_dialog() {
                self.send_bye_on(&dialog, vec![], None).await;
            }
            self.emit(SessionEvent::Ended {
                originator: Originator::System,
                cause: Cause::BadMediaDescription,
            });
            self.cleanup().await;
        }
    }

    /// Release everything the session holds. Safe to run twice.
    async fn cleanup(&self) {
        self.closed.cancel();

        {
            let mut timers = self.timers.lock();
            for token in [
                timers.no_answer.take(),
                timers.expires.take(),
                timers.retrans_2xx.take(),
                timers.ack_wait.take(),
            ]
            .into_iter()
            .flatten()
            {
                self.ua.timers.cancel(token);
            }
        }

        self.dtmf.lock().abandon();

        {
            let mut media = self.media.lock().await;
            if let Some(media) = media.as_mut() {
                media.close();
            }
            *media = None;
        }

        let refers: Vec<_> = self.refers.lock().drain().map(|(_, r)| r).collect();
        for refer in refers {
            refer.reap().await;
        }

        for (_, dialog) in self.early_dialogs.lock().drain() {
            dialog.terminate();
        }

        if let Some(dialog) = self.dialog.lock().take() {
            dialog.terminate();
        }

        self.ua.sessions.lock().remove(&self.key);
        self.ua
            .invite_branches
            .lock()
            .retain(|_, s| s.inner.key != self.key);
    }
}
