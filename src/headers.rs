//! Typed values for the extension headers the message model keeps untyped.
//!
//! `rsip` types the RFC 3261 base set; the session-timer, eventing and
//! transfer headers travel as [`rsip::Header::Other`]. This module gives
//! them small typed representations with `Display` forms matching their
//! ABNF. Only header *values* are interpreted here; message grammar stays
//! in the message model.

use std::fmt;
use std::str::FromStr;

pub const SESSION_EXPIRES: &str = "Session-Expires";
pub const MIN_SE: &str = "Min-SE";
pub const EVENT: &str = "Event";
pub const SUBSCRIPTION_STATE: &str = "Subscription-State";
pub const REFER_TO: &str = "Refer-To";
pub const TARGET_DIALOG: &str = "Target-Dialog";
pub const REASON: &str = "Reason";

pub const CONTENT_TYPE_SDP: &str = "application/sdp";
pub const CONTENT_TYPE_DTMF: &str = "application/dtmf-relay";
pub const CONTENT_TYPE_SIPFRAG: &str = "message/sipfrag";

/// Find the first extension header with the given name.
pub(crate) fn other_header<'a>(headers: &'a rsip::Headers, name: &str) -> Option<&'a str> {
    headers.iter().find_map(|h| match h {
        rsip::Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.as_str()),
        _ => None,
    })
}

/// Count extension headers with the given name.
pub(crate) fn other_header_count(headers: &rsip::Headers, name: &str) -> usize {
    headers
        .iter()
        .filter(|h| matches!(h, rsip::Header::Other(n, _) if n.eq_ignore_ascii_case(name)))
        .count()
}

pub(crate) fn extension(name: &str, value: impl fmt::Display) -> rsip::Header {
    rsip::Header::Other(name.into(), value.to_string())
}

/// Prepend a header; `rsip::Headers` only appends.
pub(crate) fn push_front(headers: &mut rsip::Headers, header: rsip::Header) {
    let mut all: Vec<rsip::Header> = headers.iter().cloned().collect();
    all.insert(0, header);
    *headers = all.into();
}

pub(crate) fn status_code_num(status: &rsip::StatusCode) -> u16 {
    status.code()
}

pub(crate) fn status_from_u16(code: u16) -> crate::Result<rsip::StatusCode> {
    rsip::StatusCode::try_from(code).map_err(|_| crate::Error::InvalidStatusCode(code))
}

/// `Expires` header value, if present and well-formed.
pub(crate) fn expires_value(headers: &rsip::Headers) -> Option<u32> {
    use rsip::prelude::UntypedHeader;

    headers.iter().find_map(|h| match h {
        rsip::Header::Expires(e) => e.value().trim().parse().ok(),
        _ => None,
    })
}

/// Contact URI with everything but the transport param stripped, suitable
/// as a remote target.
pub(crate) fn contact_uri(contact: &rsip::headers::Contact) -> crate::Result<rsip::Uri> {
    use rsip::prelude::ToTypedHeader;

    let mut uri = contact.typed().map_err(crate::Error::Message)?.uri;
    uri.params
        .retain(|p| matches!(p, rsip::Param::Transport(_)));
    Ok(uri)
}

fn parse_method(s: &str) -> Option<rsip::Method> {
    use rsip::Method::*;

    Some(match s.trim().to_ascii_uppercase().as_str() {
        "INVITE" => Invite,
        "ACK" => Ack,
        "BYE" => Bye,
        "CANCEL" => Cancel,
        "UPDATE" => Update,
        "INFO" => Info,
        "MESSAGE" => Message,
        "REFER" => Refer,
        "NOTIFY" => Notify,
        "SUBSCRIBE" => Subscribe,
        "OPTIONS" => Options,
        "REGISTER" => Register,
        _ => return None,
    })
}

/// Methods listed in the `Allow` header, if one is present.
pub(crate) fn allow_methods(headers: &rsip::Headers) -> Option<Vec<rsip::Method>> {
    use rsip::prelude::UntypedHeader;

    let allow = headers.iter().find_map(|h| match h {
        rsip::Header::Allow(a) => Some(a.value().to_string()),
        _ => None,
    })?;

    Some(allow.split(',').filter_map(parse_method).collect())
}

/// First `Content-Type` value, lowercased, if any.
pub(crate) fn content_type(headers: &rsip::Headers) -> Option<String> {
    use rsip::prelude::UntypedHeader;

    headers.iter().find_map(|h| match h {
        rsip::Header::ContentType(ct) => Some(ct.value().trim().to_ascii_lowercase()),
        _ => None,
    })
}

/// Split a header value into its leading token and `;key=value` params.
fn split_params(value: &str) -> (&str, Vec<(&str, Option<&str>)>) {
    let mut parts = value.split(';');
    let head = parts.next().unwrap_or("").trim();

    let params = parts
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim().trim_matches('"'))),
            None => (p.trim(), None),
        })
        .collect();

    (head, params)
}

fn param<'a>(params: &[(&'a str, Option<&'a str>)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .and_then(|(_, v)| *v)
}

/// `refresher` parameter of `Session-Expires` (RFC 4028).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresher {
    Unspecified,
    Uac,
    Uas,
}

/// `Session-Expires` header (RFC 4028 §4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExpires {
    pub interval: u32,
    pub refresher: Refresher,
}

impl SessionExpires {
    pub fn from_headers(headers: &rsip::Headers) -> Option<Self> {
        // `x` is the compact form
        let value = other_header(headers, SESSION_EXPIRES).or_else(|| other_header(headers, "x"))?;
        value.parse().ok()
    }
}

impl FromStr for SessionExpires {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let (head, params) = split_params(s);
        let interval = head.parse().map_err(|_| ())?;

        let refresher = match param(&params, "refresher") {
            Some(r) if r.eq_ignore_ascii_case("uac") => Refresher::Uac,
            Some(r) if r.eq_ignore_ascii_case("uas") => Refresher::Uas,
            Some(_) => return Err(()),
            None => Refresher::Unspecified,
        };

        Ok(Self {
            interval,
            refresher,
        })
    }
}

impl fmt::Display for SessionExpires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.interval)?;
        match self.refresher {
            Refresher::Unspecified => Ok(()),
            Refresher::Uac => f.write_str(";refresher=uac"),
            Refresher::Uas => f.write_str(";refresher=uas"),
        }
    }
}

/// `Min-SE` header (RFC 4028 §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinSe(pub u32);

impl MinSe {
    pub fn from_headers(headers: &rsip::Headers) -> Option<Self> {
        other_header(headers, MIN_SE)?
            .split(';')
            .next()?
            .trim()
            .parse()
            .ok()
            .map(MinSe)
    }
}

impl fmt::Display for MinSe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `Event` header (RFC 6665 §8.2.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub package: String,
    pub id: Option<String>,
}

impl Event {
    pub fn refer(id: Option<String>) -> Self {
        Self {
            package: "refer".into(),
            id,
        }
    }

    pub fn from_headers(headers: &rsip::Headers) -> Option<Self> {
        // `o` is the compact form
        let value = other_header(headers, EVENT).or_else(|| other_header(headers, "o"))?;
        let (head, params) = split_params(value);

        Some(Self {
            package: head.to_ascii_lowercase(),
            id: param(&params, "id").map(str::to_owned),
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.package)?;
        if let Some(id) = &self.id {
            write!(f, ";id={id}")?;
        }
        Ok(())
    }
}

/// substate-value of `Subscription-State` (RFC 6665 §8.2.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Pending,
    Active,
    Terminated,
}

impl fmt::Display for SubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubState::Pending => f.write_str("pending"),
            SubState::Active => f.write_str("active"),
            SubState::Terminated => f.write_str("terminated"),
        }
    }
}

/// `Subscription-State` header (RFC 6665 §8.2.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub state: SubState,
    pub expires: Option<u32>,
    pub reason: Option<String>,
}

impl SubscriptionState {
    pub fn active(expires: u32) -> Self {
        Self {
            state: SubState::Active,
            expires: Some(expires),
            reason: None,
        }
    }

    pub fn terminated(reason: &str) -> Self {
        Self {
            state: SubState::Terminated,
            expires: None,
            reason: Some(reason.into()),
        }
    }

    pub fn from_headers(headers: &rsip::Headers) -> Option<Self> {
        other_header(headers, SUBSCRIPTION_STATE)?.parse().ok()
    }
}

impl FromStr for SubscriptionState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let (head, params) = split_params(s);

        let state = match head.to_ascii_lowercase().as_str() {
            "pending" => SubState::Pending,
            "active" => SubState::Active,
            "terminated" => SubState::Terminated,
            _ => return Err(()),
        };

        Ok(Self {
            state,
            expires: param(&params, "expires").and_then(|e| e.parse().ok()),
            reason: param(&params, "reason").map(str::to_owned),
        })
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if let Some(expires) = self.expires {
            write!(f, ";expires={expires}")?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ";reason={reason}")?;
        }
        Ok(())
    }
}

/// `Refer-To` header (RFC 3515 §2.1), reduced to its URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferTo {
    pub uri: rsip::Uri,
}

impl ReferTo {
    pub fn from_headers(headers: &rsip::Headers) -> Option<crate::Result<Self>> {
        // `r` is the compact form
        let value = other_header(headers, REFER_TO).or_else(|| other_header(headers, "r"))?;
        Some(Self::parse(value))
    }

    pub fn parse(value: &str) -> crate::Result<Self> {
        let raw = match value.split_once('<') {
            Some((_, rest)) => rest.split('>').next().unwrap_or(rest),
            None => value,
        }
        .trim();

        let uri = rsip::Uri::try_from(raw)
            .map_err(|_| crate::Error::InvalidReferTarget(value.to_owned()))?;

        Ok(Self { uri })
    }

    pub fn is_sip(&self) -> bool {
        matches!(
            self.uri.scheme,
            None | Some(rsip::Scheme::Sip) | Some(rsip::Scheme::Sips)
        )
    }
}

impl fmt::Display for ReferTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.uri)
    }
}

/// `Target-Dialog` header (RFC 4538 §7), tags as seen by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl TargetDialog {
    pub fn from_headers(headers: &rsip::Headers) -> Option<Self> {
        other_header(headers, TARGET_DIALOG)?.parse().ok()
    }
}

impl FromStr for TargetDialog {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let (head, params) = split_params(s);
        if head.is_empty() {
            return Err(());
        }

        Ok(Self {
            call_id: head.to_owned(),
            local_tag: param(&params, "local-tag").ok_or(())?.to_owned(),
            remote_tag: param(&params, "remote-tag").ok_or(())?.to_owned(),
        })
    }
}

impl fmt::Display for TargetDialog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};local-tag={};remote-tag={}",
            self.call_id, self.local_tag, self.remote_tag
        )
    }
}

/// `Reason` header (RFC 3326) with protocol fixed to SIP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason {
    pub cause: u16,
    pub text: Option<String>,
}

impl Reason {
    pub fn new(cause: u16, text: impl Into<Option<String>>) -> Self {
        Self {
            cause,
            text: text.into(),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP;cause={}", self.cause)?;
        if let Some(text) = &self.text {
            write!(f, ";text=\"{text}\"")?;
        }
        Ok(())
    }
}

/// A `message/sipfrag` status line (RFC 3420).
///
/// Always held parsed; serialized only when a NOTIFY body is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipFrag {
    pub code: u16,
    pub reason: String,
}

impl SipFrag {
    pub const TRYING: SipFrag = SipFrag {
        code: 100,
        reason: String::new(),
    };

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Status line with the canonical reason phrase for `code`.
    pub fn from_code(code: u16) -> Self {
        let reason = match code {
            100 => "Trying",
            180 => "Ringing",
            183 => "Session Progress",
            200 => "OK",
            202 => "Accepted",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            408 => "Request Timeout",
            480 => "Temporarily Unavailable",
            486 => "Busy Here",
            487 => "Request Terminated",
            488 => "Not Acceptable Here",
            500 => "Server Internal Error",
            503 => "Service Unavailable",
            600 => "Busy Everywhere",
            603 => "Decline",
            _ => "",
        };

        Self {
            code,
            reason: reason.to_owned(),
        }
    }

    /// Parse the first line of a sipfrag body.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(body).ok()?;
        let line = text.lines().next()?.trim();

        let rest = line.strip_prefix("SIP/2.0 ")?;
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, reason),
            None => (rest, ""),
        };

        let code: u16 = code.parse().ok()?;
        if !(100..700).contains(&code) {
            return None;
        }

        Some(Self {
            code,
            reason: reason.trim().to_owned(),
        })
    }
}

impl fmt::Display for SipFrag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = if self.reason.is_empty() && self.code == 100 {
            "Trying"
        } else {
            &self.reason
        };
        write!(f, "SIP/2.0 {} {}\r\n", self.code, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_expires_roundtrip() {
        let se: SessionExpires = "1800;refresher=uas".parse().unwrap();
        assert_eq!(se.interval, 1800);
        assert_eq!(se.refresher, Refresher::Uas);
        assert_eq!(se.to_string(), "1800;refresher=uas");

        let se: SessionExpires = "90".parse().unwrap();
        assert_eq!(se.refresher, Refresher::Unspecified);
        assert_eq!(se.to_string(), "90");
    }

    #[test]
    fn subscription_state_parse() {
        let ss: SubscriptionState = "active;expires=180".parse().unwrap();
        assert_eq!(ss.state, SubState::Active);
        assert_eq!(ss.expires, Some(180));

        let ss: SubscriptionState = "terminated;reason=noresource".parse().unwrap();
        assert_eq!(ss.state, SubState::Terminated);
        assert_eq!(ss.reason.as_deref(), Some("noresource"));
        assert_eq!(ss.to_string(), "terminated;reason=noresource");
    }

    #[test]
    fn event_with_id() {
        let mut headers = rsip::Headers::default();
        headers.push(rsip::Header::Other("Event".into(), "refer;id=42".into()));

        let event = Event::from_headers(&headers).unwrap();
        assert_eq!(event.package, "refer");
        assert_eq!(event.id.as_deref(), Some("42"));
        assert_eq!(event.to_string(), "refer;id=42");
    }

    #[test]
    fn refer_to_name_addr() {
        let refer_to = ReferTo::parse("\"Bob\" <sip:bob@example.com>;early-only").unwrap();
        assert!(refer_to.is_sip());
        assert_eq!(refer_to.to_string(), "<sip:bob@example.com>");

        assert!(ReferTo::parse("not a uri at all <>").is_err());
    }

    #[test]
    fn target_dialog_roundtrip() {
        let td: TargetDialog = "abc@host;local-tag=l;remote-tag=r".parse().unwrap();
        assert_eq!(td.call_id, "abc@host");
        assert_eq!(td.local_tag, "l");
        assert_eq!(td.remote_tag, "r");
        assert_eq!(td.to_string(), "abc@host;local-tag=l;remote-tag=r");

        assert!("abc@host;local-tag=l".parse::<TargetDialog>().is_err());
    }

    #[test]
    fn reason_display() {
        let reason = Reason::new(408, Some("Session Timer".to_owned()));
        assert_eq!(reason.to_string(), "SIP;cause=408;text=\"Session Timer\"");
    }

    #[test]
    fn sipfrag_parse_and_print() {
        let frag = SipFrag::parse(b"SIP/2.0 180 Ringing\r\n").unwrap();
        assert_eq!(frag.code, 180);
        assert_eq!(frag.reason, "Ringing");
        assert_eq!(frag.to_string(), "SIP/2.0 180 Ringing\r\n");

        let frag = SipFrag::parse(b"SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP h\r\n").unwrap();
        assert_eq!(frag.code, 200);

        assert!(SipFrag::parse(b"HTTP/1.1 200 OK").is_none());
        assert!(SipFrag::parse(b"SIP/2.0 999 Nope").is_none());
    }
}
