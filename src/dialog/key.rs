use rsip::prelude::{HeadersExt, UntypedHeader};
use std::fmt;

/// Identifies a dialog by Call-ID plus the two tags, normalized to this
/// side's view. Immutable once both tags are known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Dialog an incoming request belongs to: our tag is in To, the
    /// peer's in From. `None` when either tag is missing.
    pub(crate) fn from_incoming(request: &rsip::Request) -> Option<Self> {
        let call_id = request.call_id_header().ok()?.value().to_string();
        let local_tag = request.to_header().ok()?.tag().ok()??.value().to_string();
        let remote_tag = request.from_header().ok()?.tag().ok()??.value().to_string();

        Some(Self {
            call_id,
            local_tag,
            remote_tag,
        })
    }

    /// Dialog a response establishes for the UAC that sent the request:
    /// our tag is in From, the peer's in To.
    pub(crate) fn from_response(response: &rsip::Response) -> Option<Self> {
        let call_id = response.call_id_header().ok()?.value().to_string();
        let local_tag = response.from_header().ok()?.tag().ok()??.value().to_string();
        let remote_tag = response.to_header().ok()?.tag().ok()??.value().to_string();

        Some(Self {
            call_id,
            local_tag,
            remote_tag,
        })
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}
