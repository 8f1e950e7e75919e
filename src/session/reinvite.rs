//! In-dialog session modification: re-INVITE and UPDATE (RFC 3311).
//!
//! At most one modifier runs per direction at a time; a competing
//! incoming re-INVITE is answered 491 here, while the CSeq-level
//! conflicts are already handled by the dialog gatekeeper. Rejecting a
//! modification never touches the established session.

use super::{AnswerOptions, SessionEvent, SessionInner, SessionState};
use crate::headers::{self, status_code_num, Refresher, SessionExpires, SESSION_EXPIRES};
use crate::timer::TimerToken;
use crate::transaction::{ClientTransaction, ServerTransaction};
use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

const PROVISIONAL_DELAY: Duration = Duration::from_secs(1);

/// Answer handle for an incoming re-INVITE, delivered with
/// [`SessionEvent::ReInvite`]. Dropping it unanswered rejects the
/// modification with 488.
pub struct ReInviteResponder {
    session: Weak<SessionInner>,
    tsx: ServerTransaction,
    provisional_timer: TimerToken,
    handled: bool,
}

impl ReInviteResponder {
    pub fn request(&self) -> &rsip::Request {
        self.tsx.request()
    }

    /// Accept the modification; answers the offer (or makes one when the
    /// re-INVITE came bodyless) and responds 200.
    pub async fn accept(mut self, options: AnswerOptions) -> Result<()> {
        self.handled = true;

        let session = self.session.upgrade().ok_or(Error::ShutDown)?;
        session.ua.timers.cancel(self.provisional_timer);

        accept_reinvite(&session, &self.tsx, options).await
    }

    /// Reject only the modification; the session stays confirmed.
    pub async fn reject(mut self, status_code: u16) -> Result<()> {
        self.handled = true;

        let session = self.session.upgrade().ok_or(Error::ShutDown)?;
        session.ua.timers.cancel(self.provisional_timer);

        let status = headers::status_from_u16(status_code)?;
        if status_code < 300 {
            return Err(Error::InvalidStatusCode(status_code));
        }

        self.tsx.reply(status, vec![], None).await?;
        session.reinvite_busy.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ReInviteResponder {
    fn drop(&mut self) {
        if self.handled {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let tsx = self.tsx.clone();
        let session = self.session.clone();
        let timer = self.provisional_timer;

        handle.spawn(async move {
            let _ = tsx
                .reply(rsip::StatusCode::NotAcceptableHere, vec![], None)
                .await;

            if let Some(session) = session.upgrade() {
                session.ua.timers.cancel(timer);
                session.reinvite_busy.store(false, Ordering::SeqCst);
            }
        });
    }
}

/// Answer handle for an incoming SDP-bearing UPDATE, delivered with
/// [`SessionEvent::Update`]. Dropping it unanswered replies 488;
/// bodyless UPDATEs never reach the application.
pub struct UpdateResponder {
    session: Weak<SessionInner>,
    tsx: ServerTransaction,
    handled: bool,
}

impl UpdateResponder {
    pub fn request(&self) -> &rsip::Request {
        self.tsx.request()
    }

    pub async fn accept(mut self, options: AnswerOptions) -> Result<()> {
        self.handled = true;

        let session = self.session.upgrade().ok_or(Error::ShutDown)?;
        let dialog = session.require_dialog()?;
        let request = self.tsx.request().clone();

        let answer = {
            let mut media = session.media.lock().await;
            let media = media
                .as_mut()
                .ok_or_else(|| Error::invalid_state("accept", "no media"))?;
            media.create_answer(request.body.clone()).await
        };

        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                let _ = self
                    .tsx
                    .reply(rsip::StatusCode::NotAcceptableHere, vec![], None)
                    .await;
                return Err(e.into());
            }
        };

        dialog.process_timer_request(&request.headers);

        let mut hdrs = vec![
            session.contact_header(),
            rsip::Header::ContentType(headers::CONTENT_TYPE_SDP.to_string().into()),
        ];
        hdrs.extend(timer_response_headers(&dialog));
        hdrs.extend(options.extra_headers);

        self.tsx.reply(rsip::StatusCode::OK, hdrs, Some(answer)).await
    }

    pub async fn reject(mut self, status_code: u16) -> Result<()> {
        self.handled = true;

        let status = headers::status_from_u16(status_code)?;
        if status_code < 300 {
            return Err(Error::InvalidStatusCode(status_code));
        }

        self.tsx.reply(status, vec![], None).await
    }
}

impl Drop for UpdateResponder {
    fn drop(&mut self) {
        if self.handled {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let tsx = self.tsx.clone();
        handle.spawn(async move {
            let _ = tsx
                .reply(rsip::StatusCode::NotAcceptableHere, vec![], None)
                .await;
        });
    }
}

/// RFC 4028 headers for a 2xx we send on INVITE/UPDATE, from the
/// negotiated timer state.
pub(crate) fn timer_response_headers(dialog: &crate::dialog::Dialog) -> Vec<rsip::Header> {
    let timer = dialog.inner.session_timer.lock();

    match timer.interval {
        Some(interval) => vec![
            rsip::Header::Require("timer".to_string().into()),
            headers::extension(
                SESSION_EXPIRES,
                SessionExpires {
                    interval,
                    refresher: if timer.local_refresher {
                        Refresher::Uas
                    } else {
                        Refresher::Uac
                    },
                },
            ),
        ],
        None => vec![],
    }
}

/// Incoming re-INVITE, already past the dialog gatekeeper.
pub(crate) async fn handle_reinvite(session: &Arc<SessionInner>, tsx: ServerTransaction) {
    if session.state() != SessionState::Confirmed {
        let _ = tsx
            .reply(rsip::StatusCode::RequestPending, vec![], None)
            .await;
        return;
    }

    if session.reinvite_busy.swap(true, Ordering::SeqCst) {
        let _ = tsx
            .reply(rsip::StatusCode::RequestPending, vec![], None)
            .await;
        return;
    }

    let request = tsx.request();

    if !request.body.is_empty() {
        let sdp = headers::content_type(&request.headers)
            .map(|ct| ct.contains(headers::CONTENT_TYPE_SDP))
            .unwrap_or(false);

        if !sdp {
            let _ = tsx
                .reply(rsip::StatusCode::UnsupportedMediaType, vec![], None)
                .await;
            session.reinvite_busy.store(false, Ordering::SeqCst);
            return;
        }
    }

    // ring back if the application keeps us waiting
    let timer_tsx = tsx.clone();
    let provisional_timer = session.ua.timers.schedule(PROVISIONAL_DELAY, async move {
        if timer_tsx.is_pending() {
            let _ = timer_tsx.reply(rsip::StatusCode::Ringing, vec![], None).await;
        }
    });

    session.emit(SessionEvent::ReInvite(ReInviteResponder {
        session: Arc::downgrade(session),
        tsx,
        provisional_timer,
        handled: false,
    }));
}

async fn accept_reinvite(
    session: &Arc<SessionInner>,
    tsx: &ServerTransaction,
    options: AnswerOptions,
) -> Result<()> {
    let request = tsx.request().clone();
    let dialog = session.require_dialog()?;

    let sdp = {
        let mut media = session.media.lock().await;
        let media = media
            .as_mut()
            .ok_or_else(|| Error::invalid_state("accept", "no media"))?;

        if request.body.is_empty() {
            // our 200 carries the offer, the answer arrives in the ACK
            media.create_offer().await
        } else {
            media.create_answer(request.body.clone()).await
        }
    };

    let sdp = match sdp {
        Ok(sdp) => sdp,
        Err(e) => {
            let _ = tsx
                .reply(rsip::StatusCode::NotAcceptableHere, vec![], None)
                .await;
            session.reinvite_busy.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
    };

    dialog.process_timer_request(&request.headers);

    let mut hdrs = vec![
        session.contact_header(),
        rsip::Header::ContentType(headers::CONTENT_TYPE_SDP.to_string().into()),
    ];
    hdrs.extend(timer_response_headers(&dialog));
    hdrs.extend(options.extra_headers);

    let cseq = request.cseq_header().and_then(|c| c.seq()).ok();

    tsx.reply(rsip::StatusCode::OK, hdrs, Some(sdp)).await?;
    session.arm_2xx_retransmission(tsx.clone(), cseq);

    Ok(())
}

/// Apply an SDP answer that rode on the ACK to a bodyless re-INVITE.
pub(crate) async fn apply_ack_answer(session: &SessionInner, ack: rsip::Request) {
    if ack.body.is_empty() {
        return;
    }

    let result = {
        let mut media = session.media.lock().await;
        match media.as_mut() {
            Some(media) => media.apply_answer(ack.body).await,
            None => Ok(()),
        }
    };

    if let Err(e) = result {
        warn!(error = %e, "SDP answer in ACK rejected, hanging up");
        session.terminate_with_bad_media().await;
    }
}

/// Incoming UPDATE, already past the dialog gatekeeper.
pub(crate) async fn handle_update(session: &Arc<SessionInner>, tsx: ServerTransaction) {
    let Ok(dialog) = session.require_dialog() else {
        let _ = tsx
            .reply(rsip::StatusCode::CallTransactionDoesNotExist, vec![], None)
            .await;
        return;
    };

    let request = tsx.request().clone();

    if request.body.is_empty() {
        // plain session-timer refresh, accepted on the spot
        debug!(call_id = %session.key.call_id, "UPDATE refresh accepted");
        dialog.process_timer_request(&request.headers);

        let mut hdrs = vec![session.contact_header()];
        hdrs.extend(timer_response_headers(&dialog));

        let _ = tsx.reply(rsip::StatusCode::OK, hdrs, None).await;
        return;
    }

    let sdp = headers::content_type(&request.headers)
        .map(|ct| ct.contains(headers::CONTENT_TYPE_SDP))
        .unwrap_or(false);

    if !sdp {
        let _ = tsx
            .reply(rsip::StatusCode::UnsupportedMediaType, vec![], None)
            .await;
        return;
    }

    session.emit(SessionEvent::Update(UpdateResponder {
        session: Arc::downgrade(session),
        tsx,
        handled: false,
    }));
}

/// Outgoing re-INVITE on the confirmed dialog.
pub(crate) async fn send_reinvite(session: &Arc<SessionInner>) -> Result<()> {
    {
        let state = session.state();
        if state != SessionState::Confirmed {
            return Err(Error::invalid_state("re-INVITE", state.name()));
        }
    }

    if session.reinvite_busy.swap(true, Ordering::SeqCst) {
        return Err(Error::RequestPending(rsip::Method::Invite));
    }

    let result = do_send_reinvite(session).await;
    session.reinvite_busy.store(false, Ordering::SeqCst);
    result
}

async fn do_send_reinvite(session: &Arc<SessionInner>) -> Result<()> {
    let dialog = session.require_dialog()?;

    let offer = {
        let mut media = session.media.lock().await;
        let media = media
            .as_mut()
            .ok_or_else(|| Error::invalid_state("re-INVITE", "no media"))?;
        media.create_offer().await?
    };

    let hdrs = vec![
        session.contact_header(),
        rsip::Header::ContentType(headers::CONTENT_TYPE_SDP.to_string().into()),
    ];

    let request = dialog.make_request(rsip::Method::Invite, None, hdrs, Some(offer));
    let target = dialog.next_hop();

    let mut tsx = ClientTransaction::send(session.ua.clone(), request, target).await?;

    let response = tsx.receive_final().await?;
    let code = status_code_num(&response.status_code);

    if !(200..300).contains(&code) {
        return Err(Error::PeerRejected(code));
    }

    let cseq = response.cseq_header().and_then(|c| c.seq()).ok();
    let ack = dialog.make_request(rsip::Method::Ack, cseq, vec![], None);
    let ack_target = dialog.next_hop();

    if let Err(e) = session.ua.transport.send(&ack_target, ack.into()).await {
        warn!(error = %e, "failed to ACK re-INVITE response");
    }

    dialog.process_timer_response(&response.headers);

    let applied = {
        let mut media = session.media.lock().await;
        match media.as_mut() {
            Some(media) => media.apply_answer(response.body.clone()).await,
            None => Ok(()),
        }
    };

    if let Err(e) = applied {
        warn!(error = %e, "re-INVITE answer rejected, hanging up");
        session.terminate_with_bad_media().await;
        return Err(e.into());
    }

    Ok(())
}
