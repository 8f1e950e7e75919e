//! Wire seam.
//!
//! The host owns sockets, framing and retransmission on unreliable
//! transports; this crate only decides *what* to send and *where*.

use async_trait::async_trait;
use std::fmt;
use std::io;

/// Resolved destination for an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipTarget {
    pub transport: Option<rsip::Transport>,
    pub addr: rsip::HostWithPort,
}

impl SipTarget {
    /// Derive the target from a request URI (or the first Route entry,
    /// which the caller picks before calling this).
    pub fn from_uri(uri: &rsip::Uri) -> Self {
        let transport = uri.params.iter().find_map(|p| match p {
            rsip::Param::Transport(t) => Some(t.clone()),
            _ => None,
        });

        Self {
            transport,
            addr: uri.host_with_port.clone(),
        }
    }

    pub fn transport_or_default(&self) -> rsip::Transport {
        self.transport.clone().unwrap_or(rsip::Transport::Udp)
    }
}

impl fmt::Display for SipTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport_or_default(), self.addr)
    }
}

/// Message sink provided by the host.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Host and port to advertise in Via headers.
    fn via_addr(&self) -> rsip::HostWithPort;

    async fn send(&self, target: &SipTarget, msg: rsip::SipMessage) -> io::Result<()>;
}
