//! REFER subscription scenarios, both directions.

mod common;

use common::*;
use rsip::headers::*;
use rsip::prelude::{HeadersExt, UntypedHeader};
use sipua::{Cause, Originator, ReferEvent, ReferProgress, SessionEvent, UaEvent};
use std::time::Duration;

/// NOTIFY from the peer carrying the refer subscription.
#[allow(clippy::too_many_arguments)]
fn refer_notify(
    refer: &rsip::Request,
    peer_tag: &str,
    cseq: u32,
    branch: &str,
    subscription_state: &str,
    frag: &str,
) -> rsip::SipMessage {
    let our_tag = from_tag(refer);
    let cid = call_id(refer);
    let body = frag.as_bytes().to_vec();

    rsip::SipMessage::Request(rsip::Request {
        method: rsip::Method::Notify,
        uri: rsip::Uri::try_from("sip:alice@192.0.2.1:5060").unwrap(),
        headers: vec![
            Via::new(format!("SIP/2.0/UDP 198.51.100.2:5060;branch={branch}")).into(),
            From::new(format!("Bob <sip:bob@example.net>;tag={peer_tag}")).into(),
            To::new(format!("Alice <sip:alice@example.com>;tag={our_tag}")).into(),
            CallId::new(cid).into(),
            CSeq::new(format!("{cseq} NOTIFY")).into(),
            Contact::new("<sip:bob@198.51.100.2:5060>").into(),
            rsip::Header::Other("Event".into(), "refer".into()),
            rsip::Header::Other("Subscription-State".into(), subscription_state.into()),
            ContentType::new("message/sipfrag").into(),
            ContentLength::new(body.len().to_string()).into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body,
    })
}

fn incoming_refer(call_id: &str, from_tag: &str, branch: &str, refer_to: &str) -> rsip::SipMessage {
    rsip::SipMessage::Request(rsip::Request {
        method: rsip::Method::Refer,
        uri: rsip::Uri::try_from("sip:alice@example.com").unwrap(),
        headers: vec![
            Via::new(format!("SIP/2.0/UDP 198.51.100.2:5060;branch={branch}")).into(),
            From::new(format!("Bob <sip:bob@example.net>;tag={from_tag}")).into(),
            To::new("Alice <sip:alice@example.com>").into(),
            CallId::new(call_id).into(),
            CSeq::new("1 REFER").into(),
            Contact::new("<sip:bob@198.51.100.2:5060>").into(),
            MaxForwards::new("70").into(),
            rsip::Header::Other("Refer-To".into(), format!("<{refer_to}>")),
            ContentLength::new("0").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    })
}

#[tokio::test(start_paused = true)]
async fn outgoing_refer_with_notifications() {
    let transport = MockTransport::new();
    let (ua, _ua_events) = build_ua(transport.clone());

    let (_refer, mut events) = ua
        .refer(
            "sip:bob@example.net",
            "sip:carol@example.org",
            Default::default(),
        )
        .await
        .unwrap();
    settle().await;

    let refer_request = transport.last_request(rsip::Method::Refer);
    assert!(refer_request.headers.iter().any(|h| matches!(
        h,
        rsip::Header::Other(name, value)
            if name == "Refer-To" && value.contains("sip:carol@example.org")
    )));

    ua.receive(
        response_to(&refer_request, 202, Some("rt1"), vec![], b""),
        peer_source(),
    )
    .await;
    settle().await;

    assert!(matches!(events.try_recv(), Some(ReferEvent::Accepted { .. })));

    // first NOTIFY forms the dialog and reports progress
    ua.receive(
        refer_notify(
            &refer_request,
            "rt1",
            1,
            "z9hG4bKn1",
            "active;expires=180",
            "SIP/2.0 100 Trying\r\n",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    assert_eq!(transport.responses(200).len(), 1);
    assert_eq!(ua.dialogs().len(), 1);

    let Some(ReferEvent::Notify {
        progress,
        frag,
        final_notify,
    }) = events.try_recv()
    else {
        panic!("no notify event");
    };
    assert_eq!(progress, ReferProgress::Progress);
    assert_eq!(frag.code, 100);
    assert!(!final_notify);

    // the final NOTIFY ends the subscription
    ua.receive(
        refer_notify(
            &refer_request,
            "rt1",
            2,
            "z9hG4bKn2",
            "terminated;reason=noresource",
            "SIP/2.0 200 OK\r\n",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    let Some(ReferEvent::Notify {
        progress,
        frag,
        final_notify,
    }) = events.try_recv()
    else {
        panic!("no final notify event");
    };
    assert_eq!(progress, ReferProgress::Started);
    assert_eq!(frag.code, 200);
    assert!(final_notify);

    // exactly one accepted, two notifies, nothing else
    assert!(events.try_recv().is_none());
    assert_eq!(ua.dialogs().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn refer_rejection_fails_the_subscription() {
    let transport = MockTransport::new();
    let (ua, _ua_events) = build_ua(transport.clone());

    let (_refer, mut events) = ua
        .refer(
            "sip:bob@example.net",
            "sip:carol@example.org",
            Default::default(),
        )
        .await
        .unwrap();
    settle().await;

    let refer_request = transport.last_request(rsip::Method::Refer);
    ua.receive(
        response_to(&refer_request, 603, Some("rt1"), vec![], b""),
        peer_source(),
    )
    .await;
    settle().await;

    assert!(matches!(
        events.try_recv(),
        Some(ReferEvent::Failed {
            originator: Originator::Remote,
            cause: Cause::Rejected,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn missing_notify_synthesizes_a_final_one() {
    let transport = MockTransport::new();
    let (ua, _ua_events) = build_ua(transport.clone());

    let (_refer, mut events) = ua
        .refer(
            "sip:bob@example.net",
            "sip:carol@example.org",
            Default::default(),
        )
        .await
        .unwrap();
    settle().await;

    let refer_request = transport.last_request(rsip::Method::Refer);
    ua.receive(
        response_to(&refer_request, 202, Some("rt1"), vec![], b""),
        peer_source(),
    )
    .await;
    settle().await;
    assert!(matches!(events.try_recv(), Some(ReferEvent::Accepted { .. })));

    // no NOTIFY ever arrives
    tokio::time::sleep(Duration::from_secs(33)).await;
    settle().await;

    let Some(ReferEvent::Notify {
        frag, final_notify, ..
    }) = events.try_recv()
    else {
        panic!("no synthesized notify");
    };
    assert_eq!(frag.code, 100);
    assert!(final_notify);
}

#[tokio::test(start_paused = true)]
async fn invalid_refer_targets_are_typed_errors() {
    let transport = MockTransport::new();
    let (ua, _ua_events) = build_ua(transport.clone());

    assert!(ua
        .refer("not a uri", "sip:carol@example.org", Default::default())
        .await
        .is_err());
    assert!(ua
        .refer("sip:bob@example.net", "definitely not", Default::default())
        .await
        .is_err());
    assert_eq!(transport.sent_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn incoming_refer_accepts_and_notifies() {
    let transport = MockTransport::new();
    let (ua, mut ua_events) = build_ua(transport.clone());

    ua.receive(
        incoming_refer("ref-1", "bob-tag", "z9hG4bKr1", "sip:carol@example.org"),
        peer_source(),
    )
    .await;
    settle().await;

    let Some(UaEvent::NewRefer { refer }) = ua_events.try_recv() else {
        panic!("no NewRefer event");
    };

    assert_eq!(transport.responses(202).len(), 1);

    // the initial NOTIFY tells the referrer nothing happened yet
    let notify = transport.last_request(rsip::Method::Notify);
    assert!(String::from_utf8(notify.body.clone())
        .unwrap()
        .contains("SIP/2.0 100 Trying"));
    assert!(notify.headers.iter().any(|h| matches!(
        h,
        rsip::Header::Other(name, value)
            if name == "Subscription-State" && value.starts_with("active;expires=")
    )));

    assert_eq!(
        refer.refer_to().unwrap().uri,
        rsip::Uri::try_from("sip:carol@example.org").unwrap()
    );

    // manual progress report
    refer
        .notify(sipua::NotifyOptions {
            status_code: Some(180),
            reason_phrase: Some("Ringing".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    settle().await;

    let notify = transport.last_request(rsip::Method::Notify);
    assert!(String::from_utf8(notify.body.clone())
        .unwrap()
        .contains("SIP/2.0 180 Ringing"));

    // final report terminates the subscription
    refer
        .notify(sipua::NotifyOptions {
            status_code: Some(200),
            reason_phrase: Some("OK".into()),
            final_notify: true,
            ..Default::default()
        })
        .await
        .unwrap();
    settle().await;

    let notify = transport.last_request(rsip::Method::Notify);
    assert!(notify.headers.iter().any(|h| matches!(
        h,
        rsip::Header::Other(name, value)
            if name == "Subscription-State" && value.contains("terminated;reason=noresource")
    )));

    // once terminated, further notifies are silently ignored
    let count = transport.requests(rsip::Method::Notify).len();
    refer
        .notify(sipua::NotifyOptions {
            status_code: Some(180),
            ..Default::default()
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(transport.requests(rsip::Method::Notify).len(), count);
}

#[tokio::test(start_paused = true)]
async fn refer_without_target_is_rejected() {
    let transport = MockTransport::new();
    let (ua, mut ua_events) = build_ua(transport.clone());

    let msg = match incoming_refer("ref-bad", "bob-tag", "z9hG4bKrb", "sip:x@example.org") {
        rsip::SipMessage::Request(mut request) => {
            let headers: Vec<rsip::Header> = request
                .headers
                .iter()
                .filter(|h| !matches!(h, rsip::Header::Other(name, _) if name == "Refer-To"))
                .cloned()
                .collect();
            request.headers = headers.into();
            rsip::SipMessage::Request(request)
        }
        msg => msg,
    };

    ua.receive(msg, peer_source()).await;
    settle().await;

    assert_eq!(transport.responses(400).len(), 1);
    assert!(ua_events.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn subscribe_with_expires_zero_closes() {
    let transport = MockTransport::new();
    let (ua, mut ua_events) = build_ua(transport.clone());

    ua.receive(
        incoming_refer("ref-sub", "bob-tag", "z9hG4bKrs", "sip:carol@example.org"),
        peer_source(),
    )
    .await;
    settle().await;

    let Some(UaEvent::NewRefer { refer: _refer }) = ua_events.try_recv() else {
        panic!("no NewRefer event");
    };

    let our_tag = transport
        .last_response(202)
        .to_header()
        .unwrap()
        .tag()
        .unwrap()
        .unwrap()
        .value()
        .to_string();

    let notifies_before = transport.requests(rsip::Method::Notify).len();

    ua.receive(
        in_dialog_request(
            rsip::Method::Subscribe,
            "ref-sub",
            "bob-tag",
            &our_tag,
            2,
            "z9hG4bKsub1",
            vec![
                rsip::Header::Other("Event".into(), "refer".into()),
                rsip::Header::Expires(Expires::new("0")),
            ],
            b"",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    // 200 to the SUBSCRIBE, then a terminating NOTIFY
    assert!(!transport.responses(200).is_empty());
    let notifies = transport.requests(rsip::Method::Notify);
    assert_eq!(notifies.len(), notifies_before + 1);
    assert!(notifies.last().unwrap().headers.iter().any(|h| matches!(
        h,
        rsip::Header::Other(name, value)
            if name == "Subscription-State" && value.contains("terminated")
    )));

    assert_eq!(ua.dialogs().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn refer_call_bridges_progress_to_notifies() {
    let transport = MockTransport::new();
    let (ua, mut ua_events) = build_ua(transport.clone());

    ua.receive(
        incoming_refer("ref-call", "bob-tag", "z9hG4bKrc", "sip:carol@example.org"),
        peer_source(),
    )
    .await;
    settle().await;

    let Some(UaEvent::NewRefer { refer }) = ua_events.try_recv() else {
        panic!("no NewRefer event");
    };

    let (_session, mut call_events) = refer
        .call(fake_media(), Default::default())
        .await
        .unwrap();
    settle().await;

    let invite = transport.last_request(rsip::Method::Invite);
    assert_eq!(
        invite.uri,
        rsip::Uri::try_from("sip:carol@example.org").unwrap()
    );

    let notifies_before = transport.requests(rsip::Method::Notify).len();

    ua.receive(
        response_to(
            &invite,
            180,
            Some("ct1"),
            vec![contact_header("sip:carol@203.0.113.9:5060")],
            b"",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    let notifies = transport.requests(rsip::Method::Notify);
    assert_eq!(notifies.len(), notifies_before + 1);
    assert!(String::from_utf8(notifies.last().unwrap().body.clone())
        .unwrap()
        .contains("180"));

    ua.receive(
        response_to(
            &invite,
            200,
            Some("ct1"),
            vec![contact_header("sip:carol@203.0.113.9:5060")],
            b"v=0 carol answer",
        ),
        peer_source(),
    )
    .await;
    settle().await;

    // success closes the subscription with a final NOTIFY
    let notifies = transport.requests(rsip::Method::Notify);
    assert_eq!(notifies.len(), notifies_before + 2);
    let last = notifies.last().unwrap();
    assert!(String::from_utf8(last.body.clone()).unwrap().contains("200 OK"));
    assert!(last.headers.iter().any(|h| matches!(
        h,
        rsip::Header::Other(name, value)
            if name == "Subscription-State" && value.contains("terminated")
    )));

    // the bridged call still reports to the application
    let mut saw_started = false;
    while let Some(event) = call_events.try_recv() {
        if matches!(event, SessionEvent::Started { .. }) {
            saw_started = true;
        }
    }
    assert!(saw_started);
}
