//! REFER and its implicit subscription (RFC 3515, RFC 4488, RFC 4538).
//!
//! Two flavors share one engine: an out-of-dialog refer owns its dialog
//! for the whole subscription, while an in-dialog refer rides the owning
//! session's dialog and distinguishes itself with an `Event: refer;id=`
//! tag. Sipfrag payloads are kept parsed ([`SipFrag`]) and serialized
//! only when a NOTIFY goes out.

use crate::dialog::{Dialog, DialogOwner, DialogState};
use crate::endpoint::{UaEvent, UserAgentInner};
use crate::events::{Cause, Originator};
use crate::headers::{
    self, status_code_num, Event, ReferTo, SipFrag, SubState, SubscriptionState, EVENT, REFER_TO,
    SUBSCRIPTION_STATE, TARGET_DIALOG,
};
use crate::session::{CallOptions, Session, SessionEvent, SessionEvents, SessionInner, SessionKey};
use crate::timer::TimerToken;
use crate::transaction::{
    consts::{T4, TIMER_F},
    make_call_id, make_tag, ClientTransaction, ServerTransaction,
};
use crate::transport::SipTarget;
use crate::{Error, MediaHandler, Result};
use parking_lot::Mutex;
use rand::Rng;
use rsip::prelude::HeadersExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a sipfrag status maps onto the transfer's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferProgress {
    /// The referred INVITE is still provisional (< 200).
    Progress,
    /// The referred INVITE succeeded (< 300).
    Started,
    /// The referred INVITE failed (>= 300).
    Failed,
}

impl ReferProgress {
    fn from_frag(frag: &SipFrag) -> Self {
        match frag.code {
            0..=199 => ReferProgress::Progress,
            200..=299 => ReferProgress::Started,
            _ => ReferProgress::Failed,
        }
    }
}

/// Events of one refer subscription.
pub enum ReferEvent {
    /// The peer accepted the REFER with a 2xx.
    Accepted { response: rsip::Response },
    /// A NOTIFY arrived (or was synthesized at timeout/close).
    Notify {
        progress: ReferProgress,
        frag: SipFrag,
        final_notify: bool,
    },
    Failed {
        originator: Originator,
        cause: Cause,
        response: Option<rsip::Response>,
    },
}

pub struct ReferEvents {
    rx: mpsc::UnboundedReceiver<ReferEvent>,
}

impl ReferEvents {
    pub async fn recv(&mut self) -> Option<ReferEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ReferEvent> {
        self.rx.try_recv().ok()
    }
}

/// Recognized fields for sending a REFER.
#[derive(Default)]
pub struct ReferOptions {
    pub target_dialog: Option<crate::dialog::DialogId>,
    pub extra_headers: Vec<rsip::Header>,
}

/// Recognized fields for [`IncomingRefer::notify`].
#[derive(Default)]
pub struct NotifyOptions {
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
    pub body: Option<Vec<u8>>,
    pub final_notify: bool,
    pub terminate_reason: Option<String>,
    pub extra_headers: Vec<rsip::Header>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReferDirection {
    /// We sent the REFER and receive NOTIFYs.
    Subscriber,
    /// We received the REFER and send NOTIFYs.
    Notifier,
}

pub(crate) struct ReferInner {
    ua: Arc<UserAgentInner>,
    pub(crate) key: SessionKey,
    direction: ReferDirection,
    in_dialog: bool,
    event_id: Option<String>,

    state: Mutex<SubState>,
    dialog: Mutex<Option<Dialog>>,
    /// Owning session for in-dialog refers.
    session: Mutex<Option<Weak<SessionInner>>>,
    /// Transfer target named by a Target-Dialog header.
    target: Mutex<Option<Weak<SessionInner>>>,

    refer_to: Mutex<Option<ReferTo>>,
    last_frag: Mutex<Option<SipFrag>>,
    expiry_deadline: Mutex<Option<Instant>>,

    notify_wait: Mutex<Option<TimerToken>>,
    expiry_timer: Mutex<Option<TimerToken>>,

    got_notify: AtomicBool,
    final_seen: AtomicBool,
    closed: AtomicBool,

    events: mpsc::UnboundedSender<ReferEvent>,
}

/// A REFER we sent; NOTIFYs from the peer surface as [`ReferEvent`]s.
#[derive(Clone)]
pub struct OutgoingRefer {
    inner: Arc<ReferInner>,
}

impl OutgoingRefer {
    /// End the subscription. An active one synthesizes a final notify
    /// event before teardown.
    pub async fn close(&self) {
        self.inner.close_subscriber(true).await;
    }
}

/// A REFER we received; we are the notifier.
#[derive(Clone)]
pub struct IncomingRefer {
    pub(crate) inner: Arc<ReferInner>,
}

impl IncomingRefer {
    pub fn refer_to(&self) -> Option<ReferTo> {
        self.inner.refer_to.lock().clone()
    }

    /// The session this REFER targets, when it carried Target-Dialog.
    pub fn target_session(&self) -> Option<Session> {
        self.inner
            .target
            .lock()
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .map(|inner| Session { inner })
    }

    /// Call the refer-to URI and report the attempt back to the referrer
    /// with automatic NOTIFYs; `started`/`failed` close the subscription.
    pub async fn call(
        &self,
        media: Box<dyn MediaHandler>,
        options: CallOptions,
    ) -> Result<(Session, SessionEvents)> {
        self.inner.call(media, options).await
    }

    /// Send a NOTIFY with a sipfrag body. Ignored unless the
    /// subscription is active.
    pub async fn notify(&self, options: NotifyOptions) -> Result<()> {
        self.inner.notify(options).await
    }

    /// End the subscription; an active one gets a terminating NOTIFY
    /// first.
    pub async fn close(&self) {
        self.inner.close_notifier(None).await;
    }
}

impl ReferInner {
    #[allow(clippy::too_many_arguments)]
    fn new(
        ua: Arc<UserAgentInner>,
        key: SessionKey,
        direction: ReferDirection,
        in_dialog: bool,
        event_id: Option<String>,
        events: mpsc::UnboundedSender<ReferEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ua,
            key,
            direction,
            in_dialog,
            event_id,
            state: Mutex::new(SubState::Pending),
            dialog: Mutex::new(None),
            session: Mutex::new(None),
            target: Mutex::new(None),
            refer_to: Mutex::new(None),
            last_frag: Mutex::new(None),
            expiry_deadline: Mutex::new(None),
            notify_wait: Mutex::new(None),
            expiry_timer: Mutex::new(None),
            got_notify: AtomicBool::new(false),
            final_seen: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
        })
    }

    fn emit(&self, event: ReferEvent) {
        let _ = self.events.send(event);
    }

    fn event_matches(&self, headers: &rsip::Headers) -> bool {
        match Event::from_headers(headers) {
            Some(event) => event.package == "refer" && event.id == self.event_id,
            None => false,
        }
    }

    fn remaining_secs(&self) -> u32 {
        self.expiry_deadline
            .lock()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs() as u32)
            .unwrap_or(0)
    }

    fn cancel_timers(&self) {
        for token in [
            self.notify_wait.lock().take(),
            self.expiry_timer.lock().take(),
        ]
        .into_iter()
        .flatten()
        {
            self.ua.timers.cancel(token);
        }
    }

    fn deregister(&self) {
        self.ua.refers.lock().remove(&self.key);

        if let Some(session) = self
            .session
            .lock()
            .as_ref()
            .and_then(|weak| weak.upgrade())
        {
            if let Some(id) = &self.event_id {
                session.refers.lock().remove(id);
            }
        }

        if !self.in_dialog {
            if let Some(dialog) = self.dialog.lock().take() {
                dialog.terminate();
            }
        }
    }

    /// Direction-appropriate close, for user-agent shutdown.
    pub(crate) async fn close(&self) {
        match self.direction {
            ReferDirection::Subscriber => self.close_subscriber(true).await,
            ReferDirection::Notifier => self.close_notifier(None).await,
        }
    }

    /// Teardown without protocol traffic or events, for a session
    /// dragging its refers down with it.
    pub(crate) async fn reap(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.state.lock() = SubState::Terminated;
        self.cancel_timers();
        self.deregister();
    }

    // ==== subscriber (outgoing REFER) side

    async fn run_outgoing(self: Arc<Self>, request: rsip::Request, target: SipTarget) {
        let mut tsx = match ClientTransaction::send(self.ua.clone(), request, target).await {
            Ok(tsx) => tsx,
            Err(_) => {
                self.fail(Originator::System, Cause::ConnectionError, None)
                    .await;
                return;
            }
        };

        let response = match tsx.receive_final().await {
            Ok(response) => response,
            Err(Error::RequestTimedOut) => {
                self.fail(Originator::System, Cause::RequestTimeout, None)
                    .await;
                return;
            }
            Err(_) => {
                self.fail(Originator::System, Cause::ConnectionError, None)
                    .await;
                return;
            }
        };

        let code = status_code_num(&response.status_code);

        if code >= 300 {
            self.fail(Originator::Remote, Cause::from_status(code), Some(response))
                .await;
            return;
        }

        info!(call_id = %self.key.call_id, "REFER accepted");
        self.emit(ReferEvent::Accepted { response });

        // the implicit subscription is only real once a NOTIFY arrives
        let weak = Arc::downgrade(&self);
        let token = self.ua.timers.schedule(TIMER_F, async move {
            let Some(refer) = weak.upgrade() else { return };

            if !refer.got_notify.load(Ordering::SeqCst) {
                debug!(call_id = %refer.key.call_id, "no NOTIFY after REFER, closing");
                refer.close_subscriber(true).await;
            }
        });
        *self.notify_wait.lock() = Some(token);
    }

    async fn fail(
        &self,
        originator: Originator,
        cause: Cause,
        response: Option<rsip::Response>,
    ) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.state.lock() = SubState::Terminated;
        self.emit(ReferEvent::Failed {
            originator,
            cause,
            response,
        });
        self.cancel_timers();
        self.deregister();
    }

    /// NOTIFY carrying our subscription, possibly the dialog-forming one.
    pub(crate) async fn handle_notify(self: &Arc<Self>, tsx: ServerTransaction) {
        let request = tsx.request().clone();

        if self.direction != ReferDirection::Subscriber {
            let _ = tsx
                .reply(rsip::StatusCode::MethodNotAllowed, vec![], None)
                .await;
            return;
        }

        if !self.event_matches(&request.headers) {
            let status =
                headers::status_from_u16(489).unwrap_or(rsip::StatusCode::BadRequest);
            let _ = tsx.reply(status, vec![], None).await;
            return;
        }

        let Some(state) = SubscriptionState::from_headers(&request.headers) else {
            let _ = tsx.reply(rsip::StatusCode::BadRequest, vec![], None).await;
            return;
        };

        if let Some(ct) = headers::content_type(&request.headers) {
            if !ct.contains(headers::CONTENT_TYPE_SIPFRAG) {
                let _ = tsx
                    .reply(rsip::StatusCode::UnsupportedMediaType, vec![], None)
                    .await;
                return;
            }
        }

        let frag = match SipFrag::parse(&request.body) {
            Some(frag) => frag,
            None if request.body.is_empty() => SipFrag::new(100, "Trying"),
            None => {
                let _ = tsx.reply(rsip::StatusCode::BadRequest, vec![], None).await;
                return;
            }
        };

        self.got_notify.store(true, Ordering::SeqCst);
        if let Some(token) = self.notify_wait.lock().take() {
            self.ua.timers.cancel(token);
        }

        // nobody listening: decline and unsubscribe
        if self.events.is_closed() {
            let _ = tsx.reply(rsip::StatusCode::Decline, vec![], None).await;
            self.unsubscribe().await;
            return;
        }

        // first NOTIFY forms the dialog on out-of-dialog refers
        if !self.in_dialog && self.dialog.lock().is_none() {
            match Dialog::new_uas(
                self.ua.clone(),
                &request,
                &self.key.local_tag,
                DialogState::Confirmed,
            ) {
                Ok(dialog) => {
                    dialog.set_owner(DialogOwner::Refer(Arc::downgrade(self)));
                    *self.dialog.lock() = Some(dialog);
                }
                Err(e) => {
                    debug!(error = %e, "NOTIFY cannot form refer dialog");
                    let _ = tsx.reply(rsip::StatusCode::BadRequest, vec![], None).await;
                    return;
                }
            }
        }

        let _ = tsx.reply(rsip::StatusCode::OK, vec![], None).await;

        *self.last_frag.lock() = Some(frag.clone());
        let progress = ReferProgress::from_frag(&frag);

        if state.state == SubState::Terminated {
            self.final_seen.store(true, Ordering::SeqCst);
            self.emit(ReferEvent::Notify {
                progress,
                frag,
                final_notify: true,
            });
            self.close_subscriber(false).await;
            return;
        }

        *self.state.lock() = SubState::Active;

        if let Some(expires) = state.expires {
            let delay = Duration::from_secs(u64::from(expires)) + T4;
            *self.expiry_deadline.lock() = Some(Instant::now() + delay);

            let weak = Arc::downgrade(self);
            let token = self.ua.timers.schedule(delay, async move {
                if let Some(refer) = weak.upgrade() {
                    debug!(call_id = %refer.key.call_id, "refer subscription expired");
                    refer.close_subscriber(true).await;
                }
            });

            if let Some(previous) = self.expiry_timer.lock().replace(token) {
                self.ua.timers.cancel(previous);
            }
        }

        self.emit(ReferEvent::Notify {
            progress,
            frag,
            final_notify: false,
        });
    }

    /// SUBSCRIBE with Expires: 0 tells the notifier we are done.
    async fn unsubscribe(&self) {
        let dialog = self.dialog.lock().clone();

        if let Some(dialog) = dialog {
            let hdrs = vec![
                headers::extension(EVENT, Event::refer(self.event_id.clone())),
                rsip::Header::Expires("0".to_string().into()),
            ];
            let request = dialog.make_request(rsip::Method::Subscribe, None, hdrs, None);
            let target = dialog.next_hop();

            if let Ok(mut tsx) = ClientTransaction::send(self.ua.clone(), request, target).await {
                tokio::spawn(async move {
                    let _ = tsx.receive_final().await;
                });
            }
        }

        self.close_subscriber(false).await;
    }

    /// Close the subscriber side. With `synthesize`, an active
    /// subscription without a final NOTIFY emits one for its listeners.
    pub(crate) async fn close_subscriber(&self, synthesize: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if synthesize && !self.final_seen.load(Ordering::SeqCst) {
            let frag = self
                .last_frag
                .lock()
                .clone()
                .unwrap_or_else(|| SipFrag::new(100, "Trying"));

            self.emit(ReferEvent::Notify {
                progress: ReferProgress::from_frag(&frag),
                frag,
                final_notify: true,
            });
        }

        *self.state.lock() = SubState::Terminated;
        self.cancel_timers();
        self.deregister();
    }

    // ==== notifier (incoming REFER) side

    pub(crate) async fn init_incoming(
        ua: Arc<UserAgentInner>,
        tsx: ServerTransaction,
        owning_session: Option<Arc<SessionInner>>,
    ) {
        let request = tsx.request().clone();

        if headers::other_header_count(&request.headers, REFER_TO) != 1 {
            let _ = tsx.reply(rsip::StatusCode::BadRequest, vec![], None).await;
            return;
        }

        let refer_to = match ReferTo::from_headers(&request.headers) {
            Some(Ok(refer_to)) => refer_to,
            _ => {
                let _ = tsx.reply(rsip::StatusCode::BadRequest, vec![], None).await;
                return;
            }
        };

        // RFC 4538: an unresolvable Target-Dialog is a dead REFER
        let target_session = match headers::TargetDialog::from_headers(&request.headers) {
            Some(td) => {
                let session = ua
                    .dialogs
                    .find_target_dialog(&td)
                    .and_then(|dialog| dialog.owner_session());

                match session {
                    Some(session) => Some(session),
                    None => {
                        let _ = tsx
                            .reply(rsip::StatusCode::CallTransactionDoesNotExist, vec![], None)
                            .await;
                        return;
                    }
                }
            }
            None => None,
        };

        let in_dialog = owning_session.is_some();

        let (key, event_id, dialog) = if let Some(session) = &owning_session {
            let cseq = request
                .cseq_header()
                .and_then(|c| c.seq())
                .map(|s| s.to_string())
                .unwrap_or_else(|_| rand::rng().random_range(0..100_000u32).to_string());

            let dialog = match session.require_dialog() {
                Ok(dialog) => dialog,
                Err(_) => {
                    let _ = tsx
                        .reply(rsip::StatusCode::CallTransactionDoesNotExist, vec![], None)
                        .await;
                    return;
                }
            };

            let key = SessionKey {
                call_id: session.key.call_id.clone(),
                local_tag: session.key.local_tag.clone(),
            };

            (key, Some(cseq), dialog)
        } else {
            let local_tag = make_tag();
            tsx.set_local_tag(local_tag.clone());

            let dialog = match Dialog::new_uas(
                ua.clone(),
                &request,
                &local_tag,
                DialogState::Confirmed,
            ) {
                Ok(dialog) => dialog,
                Err(e) => {
                    debug!(error = %e, "REFER cannot form a dialog");
                    let _ = tsx.reply(rsip::StatusCode::BadRequest, vec![], None).await;
                    return;
                }
            };

            let key = SessionKey {
                call_id: dialog.id().call_id.clone(),
                local_tag,
            };

            (key, None, dialog)
        };

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let inner = ReferInner::new(
            ua.clone(),
            key.clone(),
            ReferDirection::Notifier,
            in_dialog,
            event_id.clone(),
            events_tx,
        );

        *inner.dialog.lock() = Some(dialog.clone());
        *inner.refer_to.lock() = Some(refer_to);
        *inner.state.lock() = SubState::Active;

        if let Some(session) = &owning_session {
            *inner.session.lock() = Some(Arc::downgrade(session));
            if let Some(id) = &event_id {
                session.refers.lock().insert(id.clone(), inner.clone());
            }
        } else {
            dialog.set_owner(DialogOwner::Refer(Arc::downgrade(&inner)));
            ua.refers.lock().insert(key, inner.clone());
        }

        if let Some(target) = target_session {
            *inner.target.lock() = Some(Arc::downgrade(&target));
        }

        let accepted = tsx
            .reply(
                rsip::StatusCode::Accepted,
                vec![rsip::typed::Contact {
                    display_name: None,
                    uri: ua.config.contact.clone(),
                    params: vec![],
                }
                .into()],
                None,
            )
            .await;

        if accepted.is_err() {
            inner.reap().await;
            return;
        }

        let expires = headers::expires_value(&request.headers)
            .filter(|&e| e > 0)
            .unwrap_or(ua.config.refer_expires);
        inner.arm_expiry(expires);

        // the referrer learns immediately that nothing has happened yet
        let _ = inner
            .send_notify_frag(
                &SipFrag::new(100, "Trying"),
                SubscriptionState::active(expires),
                vec![],
            )
            .await;

        ua.emit(UaEvent::NewRefer {
            refer: IncomingRefer { inner },
        });
    }

    fn arm_expiry(self: &Arc<Self>, expires: u32) {
        let delay = Duration::from_secs(u64::from(expires));
        *self.expiry_deadline.lock() = Some(Instant::now() + delay);

        let weak = Arc::downgrade(self);
        let token = self.ua.timers.schedule(delay, async move {
            if let Some(refer) = weak.upgrade() {
                debug!(call_id = %refer.key.call_id, "refer subscription timed out");
                refer.close_notifier(Some("timeout")).await;
            }
        });

        if let Some(previous) = self.expiry_timer.lock().replace(token) {
            self.ua.timers.cancel(previous);
        }
    }

    async fn send_notify_frag(
        &self,
        frag: &SipFrag,
        state: SubscriptionState,
        extra_headers: Vec<rsip::Header>,
    ) -> Result<()> {
        let dialog = self
            .dialog
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("notify", "no dialog"))?;

        let mut hdrs = vec![
            headers::extension(EVENT, Event::refer(self.event_id.clone())),
            headers::extension(SUBSCRIPTION_STATE, &state),
            rsip::Header::ContentType(headers::CONTENT_TYPE_SIPFRAG.to_string().into()),
        ];
        hdrs.extend(extra_headers);

        let request = dialog.make_request(
            rsip::Method::Notify,
            None,
            hdrs,
            Some(frag.to_string().into_bytes()),
        );
        let target = dialog.next_hop();

        let mut tsx = ClientTransaction::send(self.ua.clone(), request, target).await?;
        tokio::spawn(async move {
            if let Err(e) = tsx.receive_final().await {
                debug!(error = %e, "NOTIFY got no final response");
            }
        });

        Ok(())
    }

    async fn notify(&self, options: NotifyOptions) -> Result<()> {
        if *self.state.lock() != SubState::Active {
            return Ok(());
        }

        let frag = match options.body {
            Some(body) => SipFrag::parse(&body).ok_or(Error::InvalidSipFrag)?,
            None => {
                let code = options.status_code.unwrap_or(100);
                if !(100..700).contains(&code) {
                    return Err(Error::InvalidStatusCode(code));
                }
                match options.reason_phrase {
                    Some(reason) => SipFrag::new(code, reason),
                    None => SipFrag::from_code(code),
                }
            }
        };

        *self.last_frag.lock() = Some(frag.clone());

        if options.final_notify {
            *self.state.lock() = SubState::Terminated;

            let reason = options
                .terminate_reason
                .unwrap_or_else(|| "noresource".to_owned());

            self.send_notify_frag(
                &frag,
                SubscriptionState::terminated(&reason),
                options.extra_headers,
            )
            .await?;

            self.teardown_notifier();
            Ok(())
        } else {
            self.send_notify_frag(
                &frag,
                SubscriptionState::active(self.remaining_secs()),
                options.extra_headers,
            )
            .await
        }
    }

    /// Bridge a new outbound call to the refer target; its lifecycle is
    /// mirrored to the referrer as NOTIFYs.
    async fn call(
        self: &Arc<Self>,
        media: Box<dyn MediaHandler>,
        options: CallOptions,
    ) -> Result<(Session, SessionEvents)> {
        if *self.state.lock() != SubState::Active {
            return Err(Error::invalid_state("call", "subscription closed"));
        }

        let refer_to = self
            .refer_to
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("call", "no refer-to"))?;

        if !refer_to.is_sip() {
            return Err(Error::InvalidReferTarget(refer_to.to_string()));
        }

        let (session, mut events) =
            SessionInner::start_outgoing(self.ua.clone(), refer_to.uri, media, options);

        let (bridge_tx, bridge_rx) = mpsc::unbounded_channel();
        let refer = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event {
                    SessionEvent::Progress { response, .. } => {
                        let frag = response
                            .as_ref()
                            .map(|r| SipFrag::from_code(status_code_num(&r.status_code)))
                            .unwrap_or_else(|| SipFrag::from_code(180));

                        let _ = refer
                            .notify(NotifyOptions {
                                body: Some(frag.to_string().into_bytes()),
                                ..Default::default()
                            })
                            .await;
                    }
                    SessionEvent::Started { .. } => {
                        let _ = refer
                            .notify(NotifyOptions {
                                status_code: Some(200),
                                reason_phrase: Some("OK".to_owned()),
                                final_notify: true,
                                ..Default::default()
                            })
                            .await;
                    }
                    SessionEvent::Failed { response, .. } => {
                        let code = response
                            .as_ref()
                            .map(|r| status_code_num(&r.status_code))
                            .unwrap_or(500);

                        let _ = refer
                            .notify(NotifyOptions {
                                status_code: Some(code),
                                final_notify: true,
                                ..Default::default()
                            })
                            .await;
                    }
                    _ => {}
                }

                let terminal = matches!(
                    event,
                    SessionEvent::Started { .. } | SessionEvent::Failed { .. }
                );

                if bridge_tx.send(event).is_err() && terminal {
                    break;
                }

                if terminal {
                    break;
                }
            }

            // keep forwarding the call's remaining events to the app
            while let Some(event) = events.recv().await {
                if bridge_tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok((session, SessionEvents::from_rx(bridge_rx)))
    }

    /// In-dialog SUBSCRIBE refreshing or ending the subscription.
    pub(crate) async fn handle_subscribe(self: &Arc<Self>, tsx: ServerTransaction) {
        if self.direction != ReferDirection::Notifier {
            let _ = tsx
                .reply(rsip::StatusCode::MethodNotAllowed, vec![], None)
                .await;
            return;
        }

        let request = tsx.request().clone();

        if !self.event_matches(&request.headers) {
            let status =
                headers::status_from_u16(489).unwrap_or(rsip::StatusCode::BadRequest);
            let _ = tsx.reply(status, vec![], None).await;
            return;
        }

        let expires = headers::expires_value(&request.headers);

        match expires {
            Some(0) => {
                let _ = tsx
                    .reply(
                        rsip::StatusCode::OK,
                        vec![rsip::Header::Expires("0".to_string().into())],
                        None,
                    )
                    .await;
                self.close_notifier(None).await;
            }
            other => {
                let expires = other.unwrap_or(self.ua.config.refer_expires);
                self.arm_expiry(expires);

                let _ = tsx
                    .reply(
                        rsip::StatusCode::OK,
                        vec![rsip::Header::Expires(expires.to_string().into())],
                        None,
                    )
                    .await;
            }
        }
    }

    /// Close the notifier side; an active subscription gets a
    /// terminating NOTIFY first.
    pub(crate) async fn close_notifier(&self, reason: Option<&str>) {
        let active = {
            let state = self.state.lock();
            *state == SubState::Active
        };

        if active {
            let frag = self
                .last_frag
                .lock()
                .clone()
                .unwrap_or_else(|| SipFrag::new(100, "Trying"));

            *self.state.lock() = SubState::Terminated;

            let reason = reason.unwrap_or("noresource");
            if let Err(e) = self
                .send_notify_frag(&frag, SubscriptionState::terminated(reason), vec![])
                .await
            {
                warn!(error = %e, "terminating NOTIFY failed");
            }
        }

        self.teardown_notifier();
    }

    fn teardown_notifier(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.state.lock() = SubState::Terminated;
        self.cancel_timers();
        self.deregister();
    }
}

/// Out-of-dialog REFER.
pub(crate) async fn send_refer(
    ua: Arc<UserAgentInner>,
    target: &str,
    refer_to: &str,
    options: ReferOptions,
) -> Result<(OutgoingRefer, ReferEvents)> {
    let target_uri =
        rsip::Uri::try_from(target).map_err(|_| Error::InvalidTarget(target.to_owned()))?;
    let refer_to = ReferTo::parse(refer_to)?;

    let key = SessionKey {
        call_id: make_call_id(),
        local_tag: make_tag(),
    };

    let from = rsip::typed::From {
        display_name: None,
        uri: ua.config.identity.clone(),
        params: vec![],
    }
    .with_tag(key.local_tag.clone().into());

    let to = rsip::typed::To {
        display_name: None,
        uri: target_uri.clone(),
        params: vec![],
    };

    let mut hdrs: Vec<rsip::Header> = vec![
        rsip::Header::From(from.into()),
        rsip::Header::To(to.into()),
        rsip::Header::CallId(key.call_id.clone().into()),
        rsip::Header::CSeq(
            rsip::typed::CSeq {
                seq: rand::rng().random_range(0..10_000),
                method: rsip::Method::Refer,
            }
            .into(),
        ),
        rsip::Header::MaxForwards(70.into()),
        rsip::typed::Contact {
            display_name: None,
            uri: ua.config.contact.clone(),
            params: vec![],
        }
        .into(),
        rsip::Header::UserAgent(ua.config.user_agent.clone().into()),
        headers::extension(REFER_TO, &refer_to),
    ];

    if let Some(td) = &options.target_dialog {
        // tags swap to the recipient's point of view
        hdrs.push(headers::extension(
            TARGET_DIALOG,
            headers::TargetDialog {
                call_id: td.call_id.clone(),
                local_tag: td.local_tag.clone(),
                remote_tag: td.remote_tag.clone(),
            },
        ));
        hdrs.push(rsip::Header::Require("tdialog".to_string().into()));
    }

    hdrs.extend(options.extra_headers);
    hdrs.push(rsip::Header::ContentLength(0.into()));

    let request = rsip::Request {
        method: rsip::Method::Refer,
        uri: target_uri.clone(),
        headers: hdrs.into(),
        version: rsip::Version::V2,
        body: vec![],
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let inner = ReferInner::new(
        ua.clone(),
        key.clone(),
        ReferDirection::Subscriber,
        false,
        None,
        events_tx,
    );
    *inner.refer_to.lock() = Some(refer_to);

    ua.refers.lock().insert(key, inner.clone());

    let task = inner.clone();
    let target = SipTarget::from_uri(&target_uri);
    tokio::spawn(async move {
        task.run_outgoing(request, target).await;
    });

    Ok((
        OutgoingRefer { inner },
        ReferEvents { rx: events_rx },
    ))
}

/// In-dialog REFER on a session's confirmed dialog.
pub(crate) async fn send_refer_in_dialog(
    session: &Arc<SessionInner>,
    refer_to: rsip::Uri,
    options: ReferOptions,
) -> Result<(OutgoingRefer, ReferEvents)> {
    let state = session.state();
    if state != crate::session::SessionState::Confirmed {
        return Err(Error::invalid_state("REFER", state.name()));
    }

    session.check_peer_allows(rsip::Method::Refer)?;
    let dialog = session.require_dialog()?;

    let refer_to = ReferTo { uri: refer_to };

    let mut hdrs = vec![headers::extension(REFER_TO, &refer_to)];

    if let Some(td) = &options.target_dialog {
        hdrs.push(headers::extension(
            TARGET_DIALOG,
            headers::TargetDialog {
                call_id: td.call_id.clone(),
                local_tag: td.local_tag.clone(),
                remote_tag: td.remote_tag.clone(),
            },
        ));
        hdrs.push(rsip::Header::Require("tdialog".to_string().into()));
    }

    hdrs.extend(options.extra_headers.iter().cloned());

    let request = dialog.make_request(rsip::Method::Refer, None, hdrs, None);

    let event_id = request
        .cseq_header()
        .and_then(|c| c.seq())
        .map(|s| s.to_string())?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let inner = ReferInner::new(
        session.ua.clone(),
        session.key.clone(),
        ReferDirection::Subscriber,
        true,
        Some(event_id.clone()),
        events_tx,
    );

    *inner.dialog.lock() = Some(dialog.clone());
    *inner.refer_to.lock() = Some(refer_to);
    *inner.session.lock() = Some(Arc::downgrade(session));

    session.refers.lock().insert(event_id, inner.clone());

    let task = inner.clone();
    let target = dialog.next_hop();
    tokio::spawn(async move {
        task.run_outgoing(request, target).await;
    });

    Ok((
        OutgoingRefer { inner },
        ReferEvents { rx: events_rx },
    ))
}
