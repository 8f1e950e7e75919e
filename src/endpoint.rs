//! User-agent façade.
//!
//! [`UserAgent`] is a cheap handle over the shared inner state: the
//! registries, the timer service, the transport handle and the top-level
//! event channel. All inbound traffic enters through
//! [`UserAgent::receive`] and is routed to the entity that owns it.

use crate::dialog::{Dialog, DialogId, DialogLayer};
use crate::headers::Event;
use crate::message::{self, IncomingMessage, MessageEvents, OutgoingMessage, SendMessageOptions};
use crate::refer::{IncomingRefer, OutgoingRefer, ReferEvents, ReferInner, ReferOptions};
use crate::session::{
    dtmf, reinvite, CallOptions, Session, SessionEvents, SessionInner, SessionKey,
};
use crate::timer::TimerService;
use crate::transaction::{branch_of, ServerTransaction, Transactions};
use crate::transport::{SipTarget, Transport};
use crate::{Error, MediaHandler, Result};
use parking_lot::Mutex;
use rsip::prelude::ToTypedHeader;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// Static configuration of a user agent.
pub struct UserAgentConfig {
    /// Product token stamped on locally built requests and responses.
    pub user_agent: String,
    /// Address-of-record used in From headers.
    pub identity: rsip::Uri,
    /// Where in-dialog requests should reach us.
    pub contact: rsip::Uri,
    pub no_answer_timeout: Duration,
    /// RFC 4028 Session-Expires offered on INVITE/UPDATE.
    pub session_expires: u32,
    pub min_session_expires: u32,
    /// Default lifetime of a REFER subscription.
    pub refer_expires: u32,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        // identity and contact are placeholders until the host sets real
        // addresses
        let placeholder =
            rsip::Uri::try_from("sip:anonymous@anonymous.invalid").expect("static uri parses");

        Self {
            user_agent: concat!("sipua/", env!("CARGO_PKG_VERSION")).to_owned(),
            identity: placeholder.clone(),
            contact: placeholder,
            no_answer_timeout: Duration::from_secs(120),
            session_expires: 1800,
            min_session_expires: 90,
            refer_expires: 180,
        }
    }
}

/// Top-level events, one per new remote-initiated entity.
pub enum UaEvent {
    NewSession {
        session: Session,
        events: SessionEvents,
    },
    NewMessage {
        message: IncomingMessage,
    },
    NewRefer {
        refer: IncomingRefer,
    },
}

pub struct UaEvents {
    rx: mpsc::UnboundedReceiver<UaEvent>,
}

impl UaEvents {
    pub async fn recv(&mut self) -> Option<UaEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<UaEvent> {
        self.rx.try_recv().ok()
    }
}

pub struct UserAgentBuilder {
    transport: Option<Arc<dyn Transport>>,
    identity: Option<rsip::Uri>,
    contact: Option<rsip::Uri>,
    user_agent: String,
    no_answer_timeout: Duration,
    session_expires: u32,
    min_session_expires: u32,
    refer_expires: u32,
}

impl Default for UserAgentBuilder {
    fn default() -> Self {
        let defaults = UserAgentConfig::default();

        Self {
            transport: None,
            identity: None,
            contact: None,
            user_agent: defaults.user_agent,
            no_answer_timeout: defaults.no_answer_timeout,
            session_expires: defaults.session_expires,
            min_session_expires: defaults.min_session_expires,
            refer_expires: defaults.refer_expires,
        }
    }
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn identity(mut self, identity: rsip::Uri) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn contact(mut self, contact: rsip::Uri) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn no_answer_timeout(mut self, timeout: Duration) -> Self {
        self.no_answer_timeout = timeout;
        self
    }

    pub fn session_expires(mut self, seconds: u32) -> Self {
        self.session_expires = seconds;
        self
    }

    pub fn refer_expires(mut self, seconds: u32) -> Self {
        self.refer_expires = seconds;
        self
    }

    pub fn build(self) -> Result<(UserAgent, UaEvents)> {
        let transport = self.transport.ok_or(Error::Misconfigured("transport"))?;
        let identity = self.identity.ok_or(Error::Misconfigured("identity"))?;
        let contact = self.contact.ok_or(Error::Misconfigured("contact"))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(UserAgentInner {
            config: UserAgentConfig {
                user_agent: self.user_agent,
                identity,
                contact,
                no_answer_timeout: self.no_answer_timeout,
                session_expires: self.session_expires,
                min_session_expires: self.min_session_expires,
                refer_expires: self.refer_expires,
            },
            transport,
            timers: TimerService::new(),
            transactions: Transactions::default(),
            dialogs: DialogLayer::default(),
            sessions: Mutex::new(HashMap::new()),
            invite_branches: Mutex::new(HashMap::new()),
            refers: Mutex::new(HashMap::new()),
            events: events_tx,
            shutdown: CancellationToken::new(),
        });

        Ok((UserAgent { inner }, UaEvents { rx: events_rx }))
    }
}

pub(crate) struct UserAgentInner {
    pub(crate) config: UserAgentConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) timers: TimerService,
    pub(crate) transactions: Transactions,
    pub(crate) dialogs: DialogLayer,
    pub(crate) sessions: Mutex<HashMap<SessionKey, Session>>,
    pub(crate) invite_branches: Mutex<HashMap<String, Session>>,
    pub(crate) refers: Mutex<HashMap<SessionKey, Arc<ReferInner>>>,
    events: mpsc::UnboundedSender<UaEvent>,
    shutdown: CancellationToken,
}

impl UserAgentInner {
    pub(crate) fn emit(&self, event: UaEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn allow_value(&self) -> String {
        "INVITE, ACK, CANCEL, BYE, UPDATE, INFO, MESSAGE, REFER, NOTIFY, SUBSCRIBE".to_owned()
    }

    pub(crate) fn supported_value(&self) -> String {
        "timer, tdialog".to_owned()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(Error::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Build a response from a request, copying the routing headers and
    /// tagging To with `local_tag` on anything but a 100.
    pub(crate) fn create_response(
        &self,
        request: &rsip::Request,
        status: rsip::StatusCode,
        local_tag: Option<&str>,
        extra_headers: Vec<rsip::Header>,
        body: Option<Vec<u8>>,
    ) -> rsip::Response {
        let mut headers = rsip::Headers::default();

        for header in request.headers.iter() {
            match header {
                rsip::Header::Via(_)
                | rsip::Header::From(_)
                | rsip::Header::CSeq(_)
                | rsip::Header::CallId(_)
                | rsip::Header::RecordRoute(_) => headers.push(header.clone()),
                rsip::Header::To(to) => {
                    let tagged = match (status == rsip::StatusCode::Trying, local_tag) {
                        (false, Some(tag)) => match to.clone().typed() {
                            Ok(typed) => {
                                let has_tag = typed
                                    .params
                                    .iter()
                                    .any(|p| matches!(p, rsip::Param::Tag(_)));

                                if has_tag {
                                    rsip::Header::To(typed.into())
                                } else {
                                    rsip::Header::To(typed.with_tag(tag.to_string().into()).into())
                                }
                            }
                            Err(_) => header.clone(),
                        },
                        _ => header.clone(),
                    };
                    headers.push(tagged);
                }
                _ => {}
            }
        }

        for header in extra_headers {
            headers.unique_push(header);
        }

        headers.unique_push(rsip::Header::UserAgent(self.config.user_agent.clone().into()));

        let body = body.unwrap_or_default();
        headers.unique_push(rsip::Header::ContentLength((body.len() as u32).into()));

        rsip::Response {
            status_code: status,
            headers,
            version: request.version.clone(),
            body,
        }
    }

    pub(crate) async fn receive(self: &Arc<Self>, msg: rsip::SipMessage, source: SipTarget) {
        match msg {
            rsip::SipMessage::Response(response) => {
                if let Err(response) = self.transactions.deliver(response) {
                    debug!(status = %response.status_code, "dropping unmatched response");
                }
            }
            rsip::SipMessage::Request(request) => {
                let span = info_span!("request", method = %request.method);
                self.receive_request(request, source).instrument(span).await;
            }
        }
    }

    async fn receive_request(self: &Arc<Self>, request: rsip::Request, source: SipTarget) {
        let method = request.method.clone();

        // CANCEL targets the INVITE transaction through its branch
        if method == rsip::Method::Cancel {
            let session = branch_of(&request)
                .and_then(|branch| self.invite_branches.lock().get(&branch).cloned());

            let tsx = ServerTransaction::new(self.clone(), request, source);

            match session {
                Some(session) => session.inner.handle_cancel(tsx).await,
                None => {
                    let _ = tsx
                        .reply(rsip::StatusCode::CallTransactionDoesNotExist, vec![], None)
                        .await;
                }
            }
            return;
        }

        if let Some(id) = DialogId::from_incoming(&request) {
            if let Some(dialog) = self.dialogs.get(&id) {
                self.receive_in_dialog(dialog, request, source).await;
                return;
            }

            match method {
                rsip::Method::Ack => {
                    // ACK for a dialog that is already gone
                    debug!(dialog = %id, "dropping stray ACK");
                }
                rsip::Method::Notify => {
                    // possibly the dialog-forming NOTIFY of a pending refer
                    let key = SessionKey {
                        call_id: id.call_id.clone(),
                        local_tag: id.local_tag.clone(),
                    };
                    let refer = self.refers.lock().get(&key).cloned();
                    let tsx = ServerTransaction::new(self.clone(), request, source);

                    match refer {
                        Some(refer) => refer.handle_notify(tsx).await,
                        None => {
                            let _ = tsx
                                .reply(rsip::StatusCode::CallTransactionDoesNotExist, vec![], None)
                                .await;
                        }
                    }
                }
                _ => {
                    let tsx = ServerTransaction::new(self.clone(), request, source);
                    let _ = tsx
                        .reply(rsip::StatusCode::CallTransactionDoesNotExist, vec![], None)
                        .await;
                }
            }
            return;
        }

        // out-of-dialog requests construct fresh owners
        match method {
            rsip::Method::Invite => {
                // a retransmitted INVITE re-triggers the last response
                if let Some(branch) = branch_of(&request) {
                    if let Some(session) = self.invite_branches.lock().get(&branch).cloned() {
                        session.inner.retransmit_invite_response().await;
                        return;
                    }
                }

                let tsx = ServerTransaction::new(self.clone(), request, source);
                SessionInner::init_incoming(self.clone(), tsx).await;
            }
            rsip::Method::Message => {
                let tsx = ServerTransaction::new(self.clone(), request, source);
                message::init_incoming(self.clone(), tsx).await;
            }
            rsip::Method::Refer => {
                let tsx = ServerTransaction::new(self.clone(), request, source);
                ReferInner::init_incoming(self.clone(), tsx, None).await;
            }
            rsip::Method::Ack => {
                debug!("dropping out-of-dialog ACK");
            }
            rsip::Method::Bye
            | rsip::Method::Notify
            | rsip::Method::Subscribe
            | rsip::Method::Update
            | rsip::Method::Info => {
                let tsx = ServerTransaction::new(self.clone(), request, source);
                let _ = tsx
                    .reply(rsip::StatusCode::CallTransactionDoesNotExist, vec![], None)
                    .await;
            }
            _ => {
                let tsx = ServerTransaction::new(self.clone(), request, source);
                let allow = rsip::Header::Allow(self.allow_value().into());
                let _ = tsx
                    .reply(rsip::StatusCode::MethodNotAllowed, vec![allow], None)
                    .await;
            }
        }
    }

    async fn receive_in_dialog(
        self: &Arc<Self>,
        dialog: Dialog,
        request: rsip::Request,
        source: SipTarget,
    ) {
        let method = request.method.clone();

        if method == rsip::Method::Ack {
            if let Some(session) = dialog.owner_session() {
                session.handle_ack(request).await;
            }
            return;
        }

        let tsx = ServerTransaction::new(self.clone(), request.clone(), source);

        match dialog.check_in_dialog_request(&tsx).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(dialog = %dialog.id(), error = %e, "gatekeeper failed");
                return;
            }
        }

        dialog.target_refresh(&request);

        if let Some(session) = dialog.owner_session() {
            match method {
                rsip::Method::Invite => reinvite::handle_reinvite(&session, tsx).await,
                rsip::Method::Update => reinvite::handle_update(&session, tsx).await,
                rsip::Method::Bye => session.handle_bye(tsx).await,
                rsip::Method::Info => dtmf::handle_info(&session, tsx).await,
                rsip::Method::Refer => {
                    ReferInner::init_incoming(self.clone(), tsx, Some(session)).await;
                }
                rsip::Method::Notify | rsip::Method::Subscribe => {
                    let refer = Event::from_headers(&request.headers)
                        .and_then(|event| event.id)
                        .and_then(|id| session.refers.lock().get(&id).cloned());

                    match refer {
                        Some(refer) if method == rsip::Method::Notify => {
                            refer.handle_notify(tsx).await;
                        }
                        Some(refer) => refer.handle_subscribe(tsx).await,
                        None => {
                            let _ = tsx
                                .reply(rsip::StatusCode::CallTransactionDoesNotExist, vec![], None)
                                .await;
                        }
                    }
                }
                _ => {
                    let allow = rsip::Header::Allow(self.allow_value().into());
                    let _ = tsx
                        .reply(rsip::StatusCode::MethodNotAllowed, vec![allow], None)
                        .await;
                }
            }
        } else if let Some(refer) = dialog.owner_refer() {
            match method {
                rsip::Method::Notify => refer.handle_notify(tsx).await,
                rsip::Method::Subscribe => refer.handle_subscribe(tsx).await,
                _ => {
                    let allow = rsip::Header::Allow(self.allow_value().into());
                    let _ = tsx
                        .reply(rsip::StatusCode::MethodNotAllowed, vec![allow], None)
                        .await;
                }
            }
        } else {
            let _ = tsx
                .reply(rsip::StatusCode::CallTransactionDoesNotExist, vec![], None)
                .await;
        }
    }
}

/// A SIP user agent. Cheap to clone; all clones share one stack.
#[derive(Clone)]
pub struct UserAgent {
    pub(crate) inner: Arc<UserAgentInner>,
}

impl UserAgent {
    pub fn builder() -> UserAgentBuilder {
        UserAgentBuilder::new()
    }

    /// Feed one parsed inbound message into the stack.
    pub async fn receive(&self, msg: rsip::SipMessage, source: SipTarget) {
        self.inner.receive(msg, source).await;
    }

    /// Start an outgoing call.
    pub fn call(
        &self,
        target: &str,
        media: Box<dyn MediaHandler>,
        options: CallOptions,
    ) -> Result<(Session, SessionEvents)> {
        self.inner.ensure_running()?;

        let uri =
            rsip::Uri::try_from(target).map_err(|_| Error::InvalidTarget(target.to_owned()))?;

        Ok(SessionInner::start_outgoing(
            self.inner.clone(),
            uri,
            media,
            options,
        ))
    }

    /// Send an out-of-dialog MESSAGE.
    pub async fn send_message(
        &self,
        target: &str,
        body: Vec<u8>,
        options: SendMessageOptions,
    ) -> Result<(OutgoingMessage, MessageEvents)> {
        self.inner.ensure_running()?;
        message::send_message(self.inner.clone(), target, body, options).await
    }

    /// Send an out-of-dialog REFER.
    pub async fn refer(
        &self,
        target: &str,
        refer_to: &str,
        options: ReferOptions,
    ) -> Result<(OutgoingRefer, ReferEvents)> {
        self.inner.ensure_running()?;
        crate::refer::send_refer(self.inner.clone(), target, refer_to, options).await
    }

    /// The dialog registry, including Target-Dialog lookup.
    pub fn dialogs(&self) -> &DialogLayer {
        &self.inner.dialogs
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Terminate every live entity and cancel all timers.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let sessions: Vec<Session> = self.inner.sessions.lock().values().cloned().collect();
        for session in sessions {
            let _ = session.terminate(Default::default()).await;
        }

        let refers: Vec<Arc<ReferInner>> =
            self.inner.refers.lock().values().cloned().collect();
        for refer in refers {
            refer.close().await;
        }

        for dialog in self.inner.dialogs.drain() {
            dialog.terminate();
        }

        self.inner.timers.cancel_all();
        self.inner.transactions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = UserAgentConfig::default();

        assert_eq!(config.no_answer_timeout, Duration::from_secs(120));
        assert_eq!(config.session_expires, 1800);
        assert_eq!(config.min_session_expires, 90);
        assert_eq!(config.refer_expires, 180);
        assert_eq!(config.identity, config.contact);
    }
}
