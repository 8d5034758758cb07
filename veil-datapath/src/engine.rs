#![forbid(unsafe_code)]

//! The datapath engine: one instance per tunnel.
//!
//! Two pipelines meet here. TX takes plaintext IP packets from the virtual
//! interface, seals them under the peer's primary crypto context and emits
//! them through the transport. RX takes encapsulated datagrams from the
//! transport, opens them under the context their key id selects and injects
//! the plaintext into the virtual interface. Packets that are not
//! data-channel traffic from the bound peer are forwarded verbatim to the
//! control plane.
//!
//! Both crypto stages may complete inline or on an offload worker; either
//! way the same post-stage handler runs, owning the buffer and the `Arc`
//! references acquired before submission. Errors inside the pipelines free
//! the buffer and bump a counter; only the TX entry reports one to its
//! caller.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tracing::{debug, info, warn};

use veil_core::{EngineConfig, PacketBuf};
use veil_crypto::{CryptoContext, CryptoOp, KeyDescriptor, OffloadPool};

use crate::bind::Bind;
use crate::control::{ControlChannel, ControlEvent};
use crate::errors::{Error, Result};
use crate::peer::Peer;
use crate::proto::{self, IpProto};
use crate::stats::{EngineStats, StatsSnapshot};

/// Link-layer overhead budgeted into TX headroom.
const LINK_LAYER_OVERHEAD: usize = 14;

/// Plaintext packet annotated for the virtual interface's receive path.
pub struct TunPacket {
    pub proto: IpProto,
    /// Integrity was verified on the tunnel layer; the receiving stack can
    /// skip checksum validation.
    pub trusted: bool,
    pub buf: PacketBuf,
}

/// Virtual-interface receive entry.
pub trait TunSink: Send + Sync + 'static {
    fn inject(&self, packet: TunPacket);
}

/// Outbound UDP transport. `send` must not block; a full socket queue is a
/// [`Error::QueueFull`] drop.
pub trait OutboundTransport: Send + Sync + 'static {
    fn send(&self, bind: &Bind, buf: PacketBuf) -> Result<()>;
}

/// Per-tunnel engine handle.
pub struct Engine {
    config: EngineConfig,
    tun: Arc<dyn TunSink>,
    transport: Arc<dyn OutboundTransport>,
    control: ControlChannel,
    offload: OffloadPool,
    /// The single current peer. Readers clone the `Arc` under the read
    /// guard; a peer observed there stays alive for as long as the clone
    /// does, and teardown completes when the last pipeline reference drops.
    peer: RwLock<Option<Arc<Peer>>>,
    stats: EngineStats,
}

impl Engine {
    /// Build an engine. With `config.crypto_workers > 0` this spawns the
    /// offload workers and must run inside a tokio runtime.
    pub fn new(
        config: EngineConfig,
        tun: Arc<dyn TunSink>,
        transport: Arc<dyn OutboundTransport>,
        control: ControlChannel,
    ) -> Arc<Self> {
        let offload = OffloadPool::new(config.crypto_workers);
        Arc::new(Self {
            config,
            tun,
            transport,
            control,
            offload,
            peer: RwLock::new(None),
            stats: EngineStats::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn control(&self) -> &ControlChannel {
        &self.control
    }

    /// Install a peer with its initial binding, replacing any previous one.
    pub fn install_peer(self: &Arc<Self>, bind: Bind) -> Arc<Peer> {
        let peer = Peer::new(Arc::downgrade(self), bind);
        let old = self
            .peer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&peer));
        if old.is_some() {
            info!(remote = %bind.remote(), "peer replaced");
        } else {
            info!(remote = %bind.remote(), "peer installed");
        }
        peer
    }

    /// Drop the current peer. Pending crypto completions still hold their
    /// references and drain before the peer is truly gone.
    pub fn remove_peer(&self) -> Option<Arc<Peer>> {
        let old = self
            .peer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if old.is_some() {
            info!("peer removed");
        }
        old
    }

    /// Current peer under the lock-free-read discipline: the returned clone
    /// is the read-side guard.
    pub fn peer(&self) -> Option<Arc<Peer>> {
        self.peer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build a crypto context from control-plane key material and install it
    /// on the current peer.
    pub fn install_key(&self, desc: KeyDescriptor, make_primary: bool) -> Result<()> {
        let peer = self.peer().ok_or(Error::NoPeer)?;
        let ctx = CryptoContext::new(desc, self.config.replay_expire())
            .map_err(Error::from)?;
        peer.install_context(Arc::new(ctx), make_primary);
        Ok(())
    }

    // ---- RX pipeline -----------------------------------------------------

    /// UDP encap-receive entry, invoked by the transport for every inbound
    /// datagram (outer headers already stripped by the host stack).
    pub fn udp_encap_recv(self: &Arc<Self>, src: SocketAddr, datagram: Vec<u8>) {
        if datagram.len() > self.config.max_datagram {
            self.drop_with(Error::malformed("datagram exceeds maximum size"), "rx");
            return;
        }
        let mut buf = PacketBuf::from_vec(datagram);
        buf.meta_mut().rx_size = buf.len();

        let Some(first) = proto::first_byte(buf.as_slice()) else {
            self.drop_with(Error::malformed("empty datagram"), "rx");
            return;
        };
        let op = proto::opcode(first);
        let key_id = proto::key_id(first);

        // data-channel records from the bound peer are handled inline;
        // everything else belongs to the control plane
        let peer = match self.peer() {
            Some(p) if p.matches_source(&src) => p,
            _ => return self.forward_to_control(buf),
        };
        if !proto::is_data(op) {
            return self.forward_to_control(buf);
        }

        let ctx = match peer.context_for(key_id) {
            Ok(ctx) => ctx,
            Err(e) => return self.drop_with(e, "rx"),
        };

        let engine = Arc::clone(self);
        self.offload.submit(
            ctx,
            buf,
            CryptoOp::Decrypt {
                aad_len: proto::data_header_len(op),
            },
            Box::new(move |buf, res| engine.post_decrypt(peer, buf, res)),
        );
    }

    /// Post-decrypt handler, inline or on an offload worker.
    fn post_decrypt(&self, peer: Arc<Peer>, buf: PacketBuf, res: veil_crypto::Result<()>) {
        if let Err(e) = res {
            return self.drop_with(e.into(), "decrypt");
        }

        // authenticated traffic from the peer, whatever its payload
        peer.update_keepalive_rx();
        peer.note_rx_bytes(buf.meta().rx_size);

        if proto::is_keepalive(buf.as_slice()) {
            self.stats.note_keepalive_rx();
            debug!("keepalive received");
            return;
        }

        match proto::ip_header_probe(buf.as_slice()) {
            Ok(ip) => {
                self.stats.note_rx(buf.meta().rx_size);
                self.tun.inject(TunPacket {
                    proto: ip,
                    trusted: true,
                    buf,
                });
            }
            Err(e) => self.drop_with(e, "rx probe"),
        }
    }

    /// Hand a packet to the control plane verbatim.
    fn forward_to_control(&self, buf: PacketBuf) {
        match self.control.send_packet(Bytes::from(buf.into_vec())) {
            Ok(()) => self.stats.note_control_forwarded(),
            Err(e) => self.drop_with(e, "control forward"),
        }
    }

    // ---- TX pipeline -----------------------------------------------------

    /// Virtual-interface transmit hook: plaintext IP packets only.
    pub fn tun_xmit(self: &Arc<Self>, packet: Vec<u8>) -> Result<()> {
        if let Err(e) = proto::ip_header_probe(&packet) {
            self.stats.note_drop(&e);
            debug!(error = %e, "tx rejected by ip probe");
            return Err(e);
        }
        self.queue_xmit(packet)
    }

    /// Special-message transmit (keepalive, explicit-exit-notify): the
    /// payload is taken as-is, no IP probe.
    pub fn xmit_special(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        self.queue_xmit(payload.to_vec())
    }

    /// Control-plane data injection: a payload the control plane built,
    /// entering the TX pipeline ready for encryption.
    pub fn send_data(self: &Arc<Self>, payload: Vec<u8>) -> Result<()> {
        self.queue_xmit(payload)
    }

    pub fn send_keepalive(self: &Arc<Self>) -> Result<()> {
        self.xmit_special(&proto::KEEPALIVE_MESSAGE)
    }

    fn queue_xmit(self: &Arc<Self>, payload: Vec<u8>) -> Result<()> {
        let res = self.try_queue_xmit(payload);
        if let Err(e) = &res {
            self.stats.note_drop(e);
            debug!(error = %e, "tx drop");
        }
        res
    }

    fn try_queue_xmit(self: &Arc<Self>, payload: Vec<u8>) -> Result<()> {
        let peer = self.peer().ok_or(Error::NoPeer)?;
        let bind = peer.bind().ok_or(Error::NoBinding)?;

        // budget the full encapsulation overhead up front so the encrypt
        // stage prepends without reallocating
        let headroom = bind.encap_overhead(LINK_LAYER_OVERHEAD);
        let buf = PacketBuf::with_headroom(headroom, &payload);

        let ctx = peer.primary_context()?;
        let key_id = ctx.key_id();
        let engine = Arc::clone(self);
        self.offload.submit(
            ctx,
            buf,
            CryptoOp::Encrypt {
                opcode: proto::OP_DATA_V1,
            },
            Box::new(move |buf, res| engine.post_encrypt(peer, key_id, buf, res)),
        );
        Ok(())
    }

    /// Post-encrypt handler, inline or on an offload worker.
    fn post_encrypt(
        &self,
        peer: Arc<Peer>,
        key_id: u8,
        buf: PacketBuf,
        res: veil_crypto::Result<()>,
    ) {
        match res {
            Err(veil_crypto::Error::RekeyNeeded) => {
                self.stats.note_drop(&Error::RekeyNeeded);
                if peer.flag_rekey(key_id) {
                    self.stats.note_rekey_event();
                    warn!(key_id, "transmit packet ids exhausted, rekey requested");
                    self.control
                        .send_event(ControlEvent::RekeyRequired { key_id });
                }
            }
            Err(e) => self.drop_with(e.into(), "encrypt"),
            Ok(()) => {
                peer.update_keepalive_tx();
                let wire_len = buf.len();
                let Some(bind) = peer.bind() else {
                    return self.drop_with(Error::NoBinding, "tx");
                };
                match self.transport.send(&bind, buf) {
                    Ok(()) => {
                        peer.note_tx_bytes(wire_len);
                        self.stats.note_tx(wire_len);
                    }
                    Err(e) => self.drop_with(e, "udp send"),
                }
            }
        }
    }

    fn drop_with(&self, err: Error, stage: &'static str) {
        self.stats.note_drop(&err);
        debug!(error = %err, stage, "packet dropped");
    }
}
