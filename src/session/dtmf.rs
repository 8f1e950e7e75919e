//! DTMF tones over INFO requests with `application/dtmf-relay` bodies.
//!
//! Tones queue up behind one drain task per session; new tones append to
//! the in-flight queue, and the first failed tone abandons the rest.

use super::{SessionEvent, SessionInner, SessionState};
use crate::events::Originator;
use crate::headers::{self, CONTENT_TYPE_DTMF};
use crate::transaction::{ClientTransaction, ServerTransaction};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_DURATION: u32 = 100;
pub const MIN_DURATION: u32 = 70;
pub const MAX_DURATION: u32 = 6000;
pub const DEFAULT_INTER_TONE_GAP: u32 = 500;
pub const MIN_INTER_TONE_GAP: u32 = 50;

/// A `,` in the tone string pauses this long.
const COMMA_PAUSE: Duration = Duration::from_millis(2000);

/// Recognized fields for [`Session::send_dtmf`](crate::Session::send_dtmf).
#[derive(Default)]
pub struct DtmfOptions {
    pub duration: Option<u32>,
    pub inter_tone_gap: Option<u32>,
}

struct QueuedTone {
    tone: char,
    duration: u32,
    gap: u32,
}

#[derive(Default)]
pub(crate) struct DtmfQueue {
    queue: VecDeque<QueuedTone>,
    sending: bool,
}

impl DtmfQueue {
    pub(crate) fn abandon(&mut self) {
        self.queue.clear();
        self.sending = false;
    }
}

pub(crate) fn clamp_duration(duration: Option<u32>) -> u32 {
    duration
        .unwrap_or(DEFAULT_DURATION)
        .clamp(MIN_DURATION, MAX_DURATION)
}

pub(crate) fn clamp_gap(gap: Option<u32>) -> u32 {
    gap.unwrap_or(DEFAULT_INTER_TONE_GAP).max(MIN_INTER_TONE_GAP)
}

pub(crate) fn send_dtmf(
    session: &Arc<SessionInner>,
    tones: &str,
    options: DtmfOptions,
) -> Result<()> {
    {
        let state = session.state();
        if !matches!(
            state,
            SessionState::Confirmed | SessionState::WaitingForAck
        ) {
            return Err(Error::invalid_state("DTMF", state.name()));
        }
    }

    session.check_peer_allows(rsip::Method::Info)?;

    let tones = tones.to_ascii_uppercase();
    if tones.is_empty() || !tones.chars().all(|c| "0123456789ABCD#*,".contains(c)) {
        return Err(Error::InvalidTones);
    }

    let duration = clamp_duration(options.duration);
    let gap = clamp_gap(options.inter_tone_gap);

    let start = {
        let mut queue = session.dtmf.lock();

        for tone in tones.chars() {
            queue.queue.push_back(QueuedTone {
                tone,
                duration,
                gap,
            });
        }

        if queue.sending {
            false
        } else {
            queue.sending = true;
            true
        }
    };

    if start {
        let session = session.clone();
        tokio::spawn(async move {
            drain(session).await;
        });
    }

    Ok(())
}

async fn drain(session: Arc<SessionInner>) {
    loop {
        let next = {
            let mut queue = session.dtmf.lock();
            match queue.queue.pop_front() {
                Some(tone) => tone,
                None => {
                    queue.sending = false;
                    return;
                }
            }
        };

        if next.tone == ',' {
            tokio::time::sleep(COMMA_PAUSE).await;
            continue;
        }

        if !matches!(
            session.state(),
            SessionState::Confirmed | SessionState::WaitingForAck
        ) {
            session.dtmf.lock().abandon();
            return;
        }

        let Ok(dialog) = session.require_dialog() else {
            session.dtmf.lock().abandon();
            return;
        };

        let body = format!("Signal={}\r\nDuration={}\r\n", next.tone, next.duration).into_bytes();
        let request = dialog.make_request(
            rsip::Method::Info,
            None,
            vec![rsip::Header::ContentType(
                CONTENT_TYPE_DTMF.to_string().into(),
            )],
            Some(body),
        );
        let target = dialog.next_hop();

        let sent = match ClientTransaction::send(session.ua.clone(), request, target).await {
            Ok(mut tsx) => match tsx.receive_final().await {
                Ok(response) => headers::status_code_num(&response.status_code) < 300,
                Err(_) => false,
            },
            Err(_) => false,
        };

        if !sent {
            warn!(call_id = %session.key.call_id, tone = %next.tone, "DTMF tone failed, dropping queue");
            session.dtmf.lock().abandon();
            return;
        }

        session.emit(SessionEvent::Dtmf {
            originator: Originator::Local,
            tone: next.tone,
            duration: next.duration,
        });

        tokio::time::sleep(Duration::from_millis(u64::from(next.gap))).await;
    }
}

fn parse_dtmf_body(body: &[u8]) -> Option<(char, u32)> {
    let text = std::str::from_utf8(body).ok()?;

    let mut tone = None;
    let mut duration = DEFAULT_DURATION;

    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            match key.trim().to_ascii_lowercase().as_str() {
                "signal" => {
                    let value = value.trim().to_ascii_uppercase();
                    let c = value.chars().next()?;
                    if value.len() == 1 && "0123456789ABCD#*".contains(c) {
                        tone = Some(c);
                    }
                }
                "duration" => {
                    if let Ok(value) = value.trim().parse() {
                        duration = value;
                    }
                }
                _ => {}
            }
        }
    }

    tone.map(|t| (t, duration))
}

/// Incoming in-dialog INFO.
pub(crate) async fn handle_info(session: &Arc<SessionInner>, tsx: ServerTransaction) {
    let request = tsx.request();

    match headers::content_type(&request.headers) {
        Some(ct) if ct.contains(CONTENT_TYPE_DTMF) => match parse_dtmf_body(&request.body) {
            Some((tone, duration)) => {
                let _ = tsx.reply(rsip::StatusCode::OK, vec![], None).await;
                session.emit(SessionEvent::Dtmf {
                    originator: Originator::Remote,
                    tone,
                    duration,
                });
            }
            None => {
                let _ = tsx.reply(rsip::StatusCode::BadRequest, vec![], None).await;
            }
        },
        None if request.body.is_empty() => {
            let _ = tsx.reply(rsip::StatusCode::OK, vec![], None).await;
        }
        _ => {
            let _ = tsx
                .reply(rsip::StatusCode::UnsupportedMediaType, vec![], None)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_clamping() {
        assert_eq!(clamp_duration(None), DEFAULT_DURATION);
        assert_eq!(clamp_duration(Some(10)), MIN_DURATION);
        assert_eq!(clamp_duration(Some(60_000)), MAX_DURATION);
        assert_eq!(clamp_duration(Some(160)), 160);
    }

    #[test]
    fn gap_clamping() {
        assert_eq!(clamp_gap(None), DEFAULT_INTER_TONE_GAP);
        assert_eq!(clamp_gap(Some(10)), MIN_INTER_TONE_GAP);
        assert_eq!(clamp_gap(Some(900)), 900);
    }

    #[test]
    fn dtmf_body_parsing() {
        assert_eq!(parse_dtmf_body(b"Signal=5\r\nDuration=160\r\n"), Some(('5', 160)));
        assert_eq!(parse_dtmf_body(b"Signal=#\r\n"), Some(('#', DEFAULT_DURATION)));
        assert_eq!(parse_dtmf_body(b"Signal=x\r\n"), None);
        assert_eq!(parse_dtmf_body(b"Duration=100\r\n"), None);
    }
}
