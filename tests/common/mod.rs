//! Shared fixtures: a recording transport and message builders.

use async_trait::async_trait;
use parking_lot::Mutex;
use rsip::headers::*;
use rsip::prelude::{HeadersExt, UntypedHeader};
use sipua::{MediaError, MediaHandler, SipTarget, Transport, UaEvents, UserAgent};
use std::io;
use std::sync::Arc;

pub struct MockTransport {
    via: rsip::HostWithPort,
    sent: Mutex<Vec<(SipTarget, rsip::SipMessage)>>,
}

#[async_trait]
impl Transport for MockTransport {
    fn via_addr(&self) -> rsip::HostWithPort {
        self.via.clone()
    }

    async fn send(&self, target: &SipTarget, msg: rsip::SipMessage) -> io::Result<()> {
        self.sent.lock().push((target.clone(), msg));
        Ok(())
    }
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let uri = rsip::Uri::try_from("sip:192.0.2.1:5060").unwrap();
        Arc::new(Self {
            via: uri.host_with_port,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn requests(&self, method: rsip::Method) -> Vec<rsip::Request> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(_, msg)| match msg {
                rsip::SipMessage::Request(r) if r.method == method => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_request(&self, method: rsip::Method) -> rsip::Request {
        self.requests(method)
            .pop()
            .unwrap_or_else(|| panic!("no {method} request on the wire"))
    }

    pub fn responses(&self, status: u16) -> Vec<rsip::Response> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(_, msg)| match msg {
                rsip::SipMessage::Response(r) if r.status_code.code() == status => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_response(&self, status: u16) -> rsip::Response {
        self.responses(status)
            .pop()
            .unwrap_or_else(|| panic!("no {status} response on the wire"))
    }
}

pub fn build_ua(transport: Arc<MockTransport>) -> (UserAgent, UaEvents) {
    UserAgent::builder()
        .transport(transport)
        .identity(rsip::Uri::try_from("sip:alice@example.com").unwrap())
        .contact(rsip::Uri::try_from("sip:alice@192.0.2.1:5060").unwrap())
        .build()
        .unwrap()
}

pub fn peer_source() -> SipTarget {
    SipTarget::from_uri(&rsip::Uri::try_from("sip:198.51.100.2:5060").unwrap())
}

/// Let spawned tasks make progress without advancing the paused clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub fn from_tag(request: &rsip::Request) -> String {
    request
        .from_header()
        .unwrap()
        .tag()
        .unwrap()
        .unwrap()
        .value()
        .to_string()
}

pub fn call_id(request: &rsip::Request) -> String {
    request.call_id_header().unwrap().value().to_string()
}

pub fn cseq_of(request: &rsip::Request) -> u32 {
    request.cseq_header().unwrap().seq().unwrap()
}

/// Response to a request we sent: Via/From/CSeq/Call-ID echoed, To
/// optionally tagged.
pub fn response_to(
    request: &rsip::Request,
    status: u16,
    to_tag: Option<&str>,
    extra_headers: Vec<rsip::Header>,
    body: &[u8],
) -> rsip::SipMessage {
    let mut headers: Vec<rsip::Header> = Vec::new();

    for header in request.headers.iter() {
        match header {
            rsip::Header::Via(_)
            | rsip::Header::From(_)
            | rsip::Header::CSeq(_)
            | rsip::Header::CallId(_) => headers.push(header.clone()),
            rsip::Header::To(to) => {
                let value = match to_tag {
                    Some(tag) => format!("{};tag={}", to.value(), tag),
                    None => to.value().to_string(),
                };
                headers.push(rsip::Header::To(value.into()));
            }
            _ => {}
        }
    }

    headers.extend(extra_headers);
    headers.push(rsip::Header::ContentLength((body.len() as u32).into()));

    rsip::SipMessage::Response(rsip::Response {
        status_code: rsip::StatusCode::try_from(status).unwrap(),
        headers: headers.into(),
        version: rsip::Version::V2,
        body: body.to_vec(),
    })
}

pub fn contact_header(uri: &str) -> rsip::Header {
    Contact::new(format!("<{uri}>")).into()
}

/// A fresh incoming INVITE from `bob`.
pub fn incoming_invite(call_id: &str, from_tag: &str, branch: &str) -> rsip::SipMessage {
    rsip::SipMessage::Request(rsip::Request {
        method: rsip::Method::Invite,
        uri: rsip::Uri::try_from("sip:alice@example.com").unwrap(),
        headers: vec![
            Via::new(format!("SIP/2.0/UDP 198.51.100.2:5060;branch={branch}")).into(),
            From::new(format!("Bob <sip:bob@example.net>;tag={from_tag}")).into(),
            To::new("Alice <sip:alice@example.com>").into(),
            CallId::new(call_id).into(),
            CSeq::new("1 INVITE").into(),
            Contact::new("<sip:bob@198.51.100.2:5060>").into(),
            MaxForwards::new("70").into(),
            ContentType::new("application/sdp").into(),
            ContentLength::new("16").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: b"v=0 remote offer".to_vec(),
    })
}

/// An in-dialog request from the peer on an established UAS dialog.
pub fn in_dialog_request(
    method: rsip::Method,
    call_id: &str,
    peer_tag: &str,
    our_tag: &str,
    cseq: u32,
    branch: &str,
    extra_headers: Vec<rsip::Header>,
    body: &[u8],
) -> rsip::SipMessage {
    let mut headers: Vec<rsip::Header> = vec![
        Via::new(format!("SIP/2.0/UDP 198.51.100.2:5060;branch={branch}")).into(),
        From::new(format!("Bob <sip:bob@example.net>;tag={peer_tag}")).into(),
        To::new(format!("Alice <sip:alice@example.com>;tag={our_tag}")).into(),
        CallId::new(call_id).into(),
        CSeq::new(format!("{cseq} {}", method)).into(),
        Contact::new("<sip:bob@198.51.100.2:5060>").into(),
        MaxForwards::new("70").into(),
    ];
    headers.extend(extra_headers);
    headers.push(ContentLength::new(body.len().to_string()).into());

    rsip::SipMessage::Request(rsip::Request {
        method,
        uri: rsip::Uri::try_from("sip:alice@192.0.2.1:5060").unwrap(),
        headers: headers.into(),
        version: rsip::Version::V2,
        body: body.to_vec(),
    })
}

/// Drive an incoming INVITE all the way to Confirmed and return the
/// session, its events and the dialog coordinates.
pub async fn confirm_incoming_call(
    transport: &MockTransport,
    ua: &UserAgent,
    ua_events: &mut UaEvents,
    call_id: &str,
) -> (sipua::Session, sipua::SessionEvents, String) {
    confirm_incoming_call_with(transport, ua, ua_events, call_id, vec![]).await
}

pub async fn confirm_incoming_call_with(
    transport: &MockTransport,
    ua: &UserAgent,
    ua_events: &mut UaEvents,
    call_id: &str,
    invite_extra: Vec<rsip::Header>,
) -> (sipua::Session, sipua::SessionEvents, String) {
    let branch = format!("z9hG4bK{call_id}");

    let invite = match incoming_invite(call_id, "bob-tag", &branch) {
        rsip::SipMessage::Request(mut invite) => {
            for header in invite_extra {
                invite.headers.push(header);
            }
            rsip::SipMessage::Request(invite)
        }
        msg => msg,
    };

    ua.receive(invite, peer_source()).await;
    settle().await;

    let Some(sipua::UaEvent::NewSession { session, mut events }) = ua_events.try_recv() else {
        panic!("no NewSession event");
    };

    let ringing = transport.responses(180);
    let our_tag = ringing
        .last()
        .unwrap()
        .to_header()
        .unwrap()
        .tag()
        .unwrap()
        .unwrap()
        .value()
        .to_string();

    session.answer(fake_media(), Default::default()).await.unwrap();
    settle().await;

    ua.receive(
        in_dialog_request(
            rsip::Method::Ack,
            call_id,
            "bob-tag",
            &our_tag,
            1,
            &format!("{branch}ack"),
            vec![],
            b"",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    assert!(matches!(
        events.try_recv(),
        Some(sipua::SessionEvent::Started { .. })
    ));
    assert!(session.is_established());

    (session, events, our_tag)
}

pub struct FakeMedia;

#[async_trait]
impl MediaHandler for FakeMedia {
    async fn create_offer(&mut self) -> Result<Vec<u8>, MediaError> {
        Ok(b"v=0 local offer".to_vec())
    }

    async fn create_answer(&mut self, _remote_offer: Vec<u8>) -> Result<Vec<u8>, MediaError> {
        Ok(b"v=0 local answer".to_vec())
    }

    async fn apply_answer(&mut self, _remote_answer: Vec<u8>) -> Result<(), MediaError> {
        Ok(())
    }

    fn close(&mut self) {}
}

pub fn fake_media() -> Box<dyn MediaHandler> {
    Box::new(FakeMedia)
}
