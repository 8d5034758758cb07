#![forbid(unsafe_code)]

//! Peer transport binding: the {local, remote} address pair a peer is
//! reachable on. Installed atomically with the peer and replaced as a whole
//! when the peer roams, so readers never observe a torn pair.

use std::net::SocketAddr;

use veil_crypto::TAG_LEN;

use crate::errors::{Error, Result};
use crate::proto::DATA_V1_HEADER_LEN;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

/// Active address pair for a peer. Both addresses carry the same family;
/// an IPv6 remote keeps its scope id inside the `SocketAddrV6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bind {
    local: SocketAddr,
    remote: SocketAddr,
}

impl Bind {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        if local.is_ipv4() != remote.is_ipv4() {
            return Err(Error::malformed(
                "binding address families disagree",
            ));
        }
        Ok(Self { local, remote })
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Whether an inbound datagram's source is this peer. Compares address
    /// and port; an IPv6 scope id is a local routing attribute and takes no
    /// part in the match.
    pub fn matches_source(&self, src: &SocketAddr) -> bool {
        self.remote.ip() == src.ip() && self.remote.port() == src.port()
    }

    /// Minimum encapsulation headroom a transmit buffer must reserve:
    /// outer IP and UDP headers, the data-channel header, the auth tag, and
    /// whatever link-layer overhead the caller budgets.
    pub fn encap_overhead(&self, link_overhead: usize) -> usize {
        let ip = if self.remote.is_ipv4() {
            IPV4_HEADER_LEN
        } else {
            IPV6_HEADER_LEN
        };
        ip + UDP_HEADER_LEN + DATA_V1_HEADER_LEN + TAG_LEN + link_overhead
    }
}
