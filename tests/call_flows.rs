//! End-to-end INVITE session scenarios over a recording transport.

mod common;

use common::*;
use rsip::prelude::HeadersExt;
use rsip::headers::UntypedHeader;
use sipua::{
    Cause, DialogId, Originator, SessionEvent, SessionState, TerminateOptions, UaEvent,
};
use std::time::Duration;

fn to_tag_of(msg: &rsip::Response) -> String {
    msg.to_header()
        .unwrap()
        .tag()
        .unwrap()
        .expect("response To has no tag")
        .value()
        .to_string()
}

#[tokio::test(start_paused = true)]
async fn basic_outbound_call() {
    let transport = MockTransport::new();
    let (ua, _ua_events) = build_ua(transport.clone());

    let (session, mut events) = ua.call("sip:bob@example.net", fake_media(), Default::default()).unwrap();
    settle().await;

    let invite = transport.last_request(rsip::Method::Invite);
    assert_eq!(invite.body, b"v=0 local offer");
    assert_eq!(session.state(), SessionState::Calling);

    ua.receive(response_to(&invite, 100, None, vec![], b""), peer_source())
        .await;
    settle().await;
    assert_eq!(session.state(), SessionState::Calling);
    assert!(events.try_recv().is_none());

    ua.receive(
        response_to(
            &invite,
            180,
            Some("t1"),
            vec![contact_header("sip:bob@198.51.100.2:5060")],
            b"",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    assert_eq!(session.state(), SessionState::Early);
    assert!(matches!(
        events.try_recv(),
        Some(SessionEvent::Progress {
            originator: Originator::Remote,
            ..
        })
    ));
    // the 180 formed an early dialog
    assert_eq!(ua.dialogs().len(), 1);

    ua.receive(
        response_to(
            &invite,
            200,
            Some("t1"),
            vec![contact_header("sip:bob@198.51.100.2:5060")],
            b"v=0 remote answer",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    assert_eq!(session.state(), SessionState::Confirmed);
    assert!(matches!(
        events.try_recv(),
        Some(SessionEvent::Started {
            response: Some(_),
            ..
        })
    ));

    let ack = transport.last_request(rsip::Method::Ack);
    assert_eq!(cseq_of(&ack), cseq_of(&invite));

    let expected = DialogId::new(call_id(&invite), from_tag(&invite), "t1");
    assert_eq!(session.dialog_id(), Some(expected));
}

#[tokio::test(start_paused = true)]
async fn forked_2xx_is_absorbed() {
    let transport = MockTransport::new();
    let (ua, _ua_events) = build_ua(transport.clone());

    let (session, mut events) = ua.call("sip:bob@example.net", fake_media(), Default::default()).unwrap();
    settle().await;
    let invite = transport.last_request(rsip::Method::Invite);
    let contact = vec![contact_header("sip:bob@198.51.100.2:5060")];

    ua.receive(
        response_to(&invite, 200, Some("t1"), contact.clone(), b"v=0 a1"),
        peer_source(),
    )
    .await;
    settle().await;
    assert!(matches!(events.try_recv(), Some(SessionEvent::Started { .. })));

    let acks_before = transport.requests(rsip::Method::Ack).len();
    assert_eq!(acks_before, 1);

    // a second 2xx from another branch of the fork
    ua.receive(
        response_to(&invite, 200, Some("t2"), contact.clone(), b"v=0 a2"),
        peer_source(),
    )
    .await;
    settle().await;

    // the stray dialog was acknowledged and immediately released
    let acks: Vec<_> = transport.requests(rsip::Method::Ack);
    assert_eq!(acks.len(), 2);
    let stray_ack = acks.last().unwrap();
    assert_eq!(
        stray_ack.to_header().unwrap().tag().unwrap().unwrap().value(),
        "t2"
    );

    let bye = transport.last_request(rsip::Method::Bye);
    assert_eq!(bye.to_header().unwrap().tag().unwrap().unwrap().value(), "t2");

    // the call itself is untouched, and started only once
    assert_eq!(session.state(), SessionState::Confirmed);
    assert!(events.try_recv().is_none());

    // a retransmitted 2xx for the confirmed dialog repeats the ACK only
    ua.receive(
        response_to(&invite, 200, Some("t1"), contact, b"v=0 a1"),
        peer_source(),
    )
    .await;
    settle().await;

    let acks = transport.requests(rsip::Method::Ack);
    assert_eq!(acks.len(), 3);
    assert_eq!(
        acks.last().unwrap().to_header().unwrap().tag().unwrap().unwrap().value(),
        "t1"
    );
    assert_eq!(transport.requests(rsip::Method::Bye).len(), 1);
    assert!(events.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn cancel_before_any_provisional() {
    let transport = MockTransport::new();
    let (ua, _ua_events) = build_ua(transport.clone());

    let (session, mut events) = ua.call("sip:bob@example.net", fake_media(), Default::default()).unwrap();
    settle().await;
    let invite = transport.last_request(rsip::Method::Invite);

    session
        .terminate(TerminateOptions {
            status_code: Some(486),
            ..Default::default()
        })
        .await
        .unwrap();
    settle().await;

    // CANCEL waits for the first provisional
    assert!(transport.requests(rsip::Method::Cancel).is_empty());
    assert_eq!(session.state(), SessionState::Canceled);

    ua.receive(response_to(&invite, 100, None, vec![], b""), peer_source())
        .await;
    settle().await;

    let cancel = transport.last_request(rsip::Method::Cancel);
    assert_eq!(cseq_of(&cancel), cseq_of(&invite));
    assert!(cancel.headers.iter().any(|h| matches!(
        h,
        rsip::Header::Other(name, value) if name == "Reason" && value.contains("cause=486")
    )));

    ua.receive(response_to(&invite, 487, Some("t1"), vec![], b""), peer_source())
        .await;
    settle().await;

    assert_eq!(session.state(), SessionState::Terminated);
    assert!(matches!(
        events.try_recv(),
        Some(SessionEvent::Failed {
            originator: Originator::Local,
            cause: Cause::Canceled,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn cancel_racing_2xx_is_absorbed() {
    let transport = MockTransport::new();
    let (ua, _ua_events) = build_ua(transport.clone());

    let (session, mut events) = ua.call("sip:bob@example.net", fake_media(), Default::default()).unwrap();
    settle().await;
    let invite = transport.last_request(rsip::Method::Invite);

    ua.receive(response_to(&invite, 100, None, vec![], b""), peer_source())
        .await;
    settle().await;

    session.terminate(Default::default()).await.unwrap();
    settle().await;
    assert_eq!(transport.requests(rsip::Method::Cancel).len(), 1);

    // the 200 beat the CANCEL: dialog is accepted, then dropped
    ua.receive(
        response_to(
            &invite,
            200,
            Some("t1"),
            vec![contact_header("sip:bob@198.51.100.2:5060")],
            b"v=0 answer",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    assert_eq!(transport.requests(rsip::Method::Ack).len(), 1);
    assert_eq!(transport.requests(rsip::Method::Bye).len(), 1);
    assert_eq!(session.state(), SessionState::Terminated);

    assert!(matches!(
        events.try_recv(),
        Some(SessionEvent::Failed {
            originator: Originator::Local,
            cause: Cause::Canceled,
            ..
        })
    ));
    // never started
    assert!(events.try_recv().is_none());
}

/// Establish an incoming call and return everything a test needs.
async fn established_uas(
    transport: &MockTransport,
    ua: &sipua::UserAgent,
    ua_events: &mut sipua::UaEvents,
) -> (sipua::Session, sipua::SessionEvents, String, String) {
    ua.receive(incoming_invite("call-1", "bob-tag", "z9hG4bKb1"), peer_source())
        .await;
    settle().await;

    assert_eq!(transport.responses(100).len(), 1);
    assert_eq!(transport.responses(180).len(), 1);

    let Some(UaEvent::NewSession { session, events }) = ua_events.try_recv() else {
        panic!("no NewSession event");
    };
    assert_eq!(session.state(), SessionState::WaitingForAnswer);

    let our_tag = to_tag_of(&transport.last_response(180));

    session.answer(fake_media(), Default::default()).await.unwrap();
    settle().await;

    let ok = transport.last_response(200);
    assert_eq!(ok.body, b"v=0 local answer");
    assert_eq!(session.state(), SessionState::WaitingForAck);

    (session, events, our_tag, "call-1".to_string())
}

#[tokio::test(start_paused = true)]
async fn incoming_call_answer_and_ack() {
    let transport = MockTransport::new();
    let (ua, mut ua_events) = build_ua(transport.clone());

    let (session, mut events, our_tag, call_id) =
        established_uas(&transport, &ua, &mut ua_events).await;

    ua.receive(
        in_dialog_request(
            rsip::Method::Ack,
            &call_id,
            "bob-tag",
            &our_tag,
            1,
            "z9hG4bKack1",
            vec![],
            b"",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    assert_eq!(session.state(), SessionState::Confirmed);
    assert!(matches!(
        events.try_recv(),
        Some(SessionEvent::Started { response: None, .. })
    ));

    // ACK stopped the 2xx retransmissions
    let before = transport.responses(200).len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.responses(200).len(), before);
}

#[tokio::test(start_paused = true)]
async fn lost_ack_retransmits_then_hangs_up() {
    let transport = MockTransport::new();
    let (ua, mut ua_events) = build_ua(transport.clone());

    let (session, mut events, _our_tag, _call_id) =
        established_uas(&transport, &ua, &mut ua_events).await;

    assert_eq!(transport.responses(200).len(), 1);

    // T1 and T1+2*T1 bring two retransmissions
    tokio::time::sleep(Duration::from_millis(520)).await;
    settle().await;
    assert_eq!(transport.responses(200).len(), 2);

    tokio::time::sleep(Duration::from_millis(1020)).await;
    settle().await;
    assert_eq!(transport.responses(200).len(), 3);

    // no ACK until the wait gives up
    tokio::time::sleep(Duration::from_secs(40)).await;
    settle().await;

    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(transport.requests(rsip::Method::Bye).len(), 1);

    let saw_no_ack = std::iter::from_fn(|| events.try_recv()).any(|event| {
        matches!(
            event,
            SessionEvent::Ended {
                originator: Originator::Remote,
                cause: Cause::NoAck,
            }
        )
    });
    assert!(saw_no_ack);

    // retransmissions ceased with the session
    let count = transport.responses(200).len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.responses(200).len(), count);
}

#[tokio::test(start_paused = true)]
async fn cancel_of_unanswered_invite() {
    let transport = MockTransport::new();
    let (ua, mut ua_events) = build_ua(transport.clone());

    ua.receive(incoming_invite("call-c", "bob-tag", "z9hG4bKc1"), peer_source())
        .await;
    settle().await;

    let Some(UaEvent::NewSession { session, mut events }) = ua_events.try_recv() else {
        panic!("no NewSession event");
    };

    let mut cancel = rsip::Request {
        method: rsip::Method::Cancel,
        uri: rsip::Uri::try_from("sip:alice@example.com").unwrap(),
        headers: rsip::Headers::default(),
        version: rsip::Version::V2,
        body: vec![],
    };
    // CANCEL mirrors the INVITE but for its method
    if let rsip::SipMessage::Request(invite) = incoming_invite("call-c", "bob-tag", "z9hG4bKc1") {
        cancel.headers = invite
            .headers
            .iter()
            .filter(|h| {
                !matches!(
                    h,
                    rsip::Header::ContentType(_)
                        | rsip::Header::ContentLength(_)
                        | rsip::Header::CSeq(_)
                )
            })
            .cloned()
            .collect::<Vec<_>>()
            .into();
        cancel
            .headers
            .push(rsip::headers::CSeq::new("1 CANCEL").into());
    }

    ua.receive(rsip::SipMessage::Request(cancel), peer_source())
        .await;
    settle().await;

    assert_eq!(transport.responses(487).len(), 1);
    assert!(!transport.responses(200).is_empty());
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(matches!(
        events.try_recv(),
        Some(SessionEvent::Failed {
            originator: Originator::Remote,
            cause: Cause::Canceled,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn terminate_is_idempotent() {
    let transport = MockTransport::new();
    let (ua, mut ua_events) = build_ua(transport.clone());

    let (session, mut events, our_tag, call_id) =
        established_uas(&transport, &ua, &mut ua_events).await;

    ua.receive(
        in_dialog_request(
            rsip::Method::Ack,
            &call_id,
            "bob-tag",
            &our_tag,
            1,
            "z9hG4bKack2",
            vec![],
            b"",
        ),
        peer_source(),
    )
    .await;
    settle().await;
    assert!(matches!(events.try_recv(), Some(SessionEvent::Started { .. })));

    session.terminate(Default::default()).await.unwrap();
    session.terminate(Default::default()).await.unwrap();
    settle().await;

    assert_eq!(transport.requests(rsip::Method::Bye).len(), 1);
    assert!(matches!(
        events.try_recv(),
        Some(SessionEvent::Ended {
            originator: Originator::Local,
            cause: Cause::Bye,
        })
    ));
    assert!(events.try_recv().is_none());

    // all dialogs are gone with the session
    assert_eq!(ua.dialogs().len(), 0);
    assert_eq!(ua.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_cseq_gets_500() {
    let transport = MockTransport::new();
    let (ua, mut ua_events) = build_ua(transport.clone());

    let (_session, _events, our_tag, call_id) =
        established_uas(&transport, &ua, &mut ua_events).await;

    ua.receive(
        in_dialog_request(
            rsip::Method::Info,
            &call_id,
            "bob-tag",
            &our_tag,
            0,
            "z9hG4bKstale",
            vec![],
            b"",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    assert_eq!(transport.responses(500).len(), 1);
}
