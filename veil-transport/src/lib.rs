#![forbid(unsafe_code)]

//! Veil UDP transport adapter.
//!
//! * One socket per tunnel, built with `socket2` so address reuse can be set
//!   before binding.
//! * An RX task hands every datagram to the engine's encap-receive entry;
//!   the outer IP/UDP headers are already gone by the time the host stack
//!   delivers the payload.
//! * Sends never block the datapath: `try_send_to` either queues the
//!   datagram with the host stack or the packet is dropped and counted,
//!   the same contract the engine's pipelines rely on everywhere else.
//!
//! Routing is the host's job. The destination comes from the peer binding;
//! an IPv6 scope id rides inside the `SocketAddrV6` so the stack can pick
//! the right interface for link-local peers. A host-unreachable or
//! network-unreachable send surfaces as the engine's no-route error.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use veil_core::PacketBuf;
use veil_datapath::{Bind, Engine, Error, OutboundTransport};

/// UDP socket wrapper shared by the RX task and the engine's TX pipeline.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind on `addr` with address reuse when possible.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Arc<Self>> {
        let domain = Domain::for_address(addr);
        let socket = socket2::Socket::new(domain, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        let std_sock: std::net::UdpSocket = socket.into();
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;
        info!(local = %socket.local_addr()?, "udp transport bound");
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the encap-receive loop feeding `engine`. Runs until the socket
    /// errors fatally or the handle is aborted.
    pub fn spawn_recv(&self, engine: Arc<Engine>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let max_datagram = engine.config().max_datagram;
        tokio::spawn(async move {
            let mut buf = vec![0u8; max_datagram];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        engine.udp_encap_recv(src, buf[..len].to_vec());
                    }
                    Err(e) => {
                        error!(error = %e, "udp recv error");
                        return;
                    }
                }
            }
        })
    }
}

impl OutboundTransport for UdpTransport {
    fn send(&self, bind: &Bind, buf: PacketBuf) -> veil_datapath::Result<()> {
        match self.socket.try_send_to(buf.as_slice(), bind.remote()) {
            Ok(sent) => {
                if sent != buf.len() {
                    debug!(sent, len = buf.len(), "short udp send");
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::QueueFull),
            Err(e) => Err(Error::NoRoute(e.to_string())),
        }
    }
}
