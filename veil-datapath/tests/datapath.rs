//! End-to-end pipeline tests over an in-memory link.
//!
//! Two engines are wired back to back: everything engine A's transport
//! emits is delivered to engine B's encap-receive entry with A's address as
//! the source, and vice versa. With zero crypto workers every pipeline
//! stage completes inline, so state can be asserted immediately after each
//! call; a separate test runs the same roundtrip through offload workers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use veil_core::{EngineConfig, PacketBuf};
use veil_crypto::aead::nonce_for;
use veil_crypto::{AeadAlgorithm, AeadKey, CryptoContext, DataCipher, KeyDescriptor};
use veil_datapath::proto::{self, OP_CONTROL_V1, OP_DATA_V1, OP_DATA_V2};
use veil_datapath::{
    control_channel, Bind, ControlEvent, ControlReceiver, Engine, Error, IpProto,
    OutboundTransport, TunPacket, TunSink,
};

/// Collects injected plaintext packets and hands them out over a channel so
/// both inline and deferred completions can be awaited.
struct TestTun {
    tx: std::sync::mpsc::Sender<(IpProto, bool, Vec<u8>)>,
}

impl TunSink for TestTun {
    fn inject(&self, packet: TunPacket) {
        let _ = self
            .tx
            .send((packet.proto, packet.trusted, packet.buf.into_vec()));
    }
}

/// In-memory link: records every datagram and optionally delivers it to the
/// remote engine as if it had arrived from `src`.
struct TestLink {
    src: SocketAddr,
    remote: Mutex<Option<Arc<Engine>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl TestLink {
    fn new(src: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            src,
            remote: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn connect(&self, engine: &Arc<Engine>) {
        *self.remote.lock().unwrap() = Some(Arc::clone(engine));
    }

    /// Stop delivering; sends are captured only.
    fn connect_none(&self) {
        *self.remote.lock().unwrap() = None;
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

impl OutboundTransport for TestLink {
    fn send(&self, _bind: &Bind, buf: PacketBuf) -> veil_datapath::Result<()> {
        let wire = buf.into_vec();
        self.sent.lock().unwrap().push(wire.clone());
        if let Some(remote) = self.remote.lock().unwrap().clone() {
            remote.udp_encap_recv(self.src, wire);
        }
        Ok(())
    }
}

struct Node {
    engine: Arc<Engine>,
    link: Arc<TestLink>,
    tun: std::sync::mpsc::Receiver<(IpProto, bool, Vec<u8>)>,
    control: ControlReceiver,
}

fn addr(last: u8) -> SocketAddr {
    format!("10.0.0.{last}:1194").parse().unwrap()
}

fn node(config: EngineConfig, local: SocketAddr, remote: SocketAddr) -> Node {
    let (tun_tx, tun_rx) = std::sync::mpsc::channel();
    let (control_tx, control_rx) = control_channel(config.control_queue_depth);
    let link = TestLink::new(local);
    let engine = Engine::new(
        config,
        Arc::new(TestTun { tx: tun_tx }),
        link.clone(),
        control_tx,
    );
    engine.install_peer(Bind::new(local, remote).unwrap());
    Node {
        engine,
        link,
        tun: tun_rx,
        control: control_rx,
    }
}

fn descriptor(key_id: u8, epoch: u32, encrypt: [u8; 32], decrypt: [u8; 32]) -> KeyDescriptor {
    KeyDescriptor {
        key_id,
        epoch,
        algorithm: AeadAlgorithm::ChaCha20Poly1305,
        encrypt_key: AeadKey(encrypt),
        decrypt_key: AeadKey(decrypt),
    }
}

/// Two engines with reciprocal keys installed under `key_id`.
fn tunnel(config: EngineConfig, key_id: u8, epoch: u32) -> (Node, Node) {
    let a = node(config.clone(), addr(1), addr(2));
    let b = node(config, addr(2), addr(1));
    a.link.connect(&b.engine);
    b.link.connect(&a.engine);

    let k_ab = [0xaa; 32];
    let k_ba = [0xbb; 32];
    a.engine
        .install_key(descriptor(key_id, epoch, k_ab, k_ba), true)
        .unwrap();
    b.engine
        .install_key(descriptor(key_id, epoch, k_ba, k_ab), true)
        .unwrap();
    (a, b)
}

/// 84-byte ICMP echo shaped IPv4 packet.
fn ipv4_ping(seq: u8) -> Vec<u8> {
    let mut pkt = vec![0u8; 0x54];
    pkt[0] = 0x45;
    pkt[2] = 0x00;
    pkt[3] = 0x54;
    pkt[8] = 64; // ttl
    pkt[9] = 1; // icmp
    pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
    pkt[16..20].copy_from_slice(&[10, 0, 0, 2]);
    pkt[0x53] = seq;
    pkt
}

#[test]
fn fresh_peer_first_packet_has_id_one() {
    let (a, b) = tunnel(EngineConfig::default(), 3, 1000);
    let ping = ipv4_ping(1);
    a.engine.tun_xmit(ping.clone()).unwrap();

    // exactly one datagram on the wire, opcode/key-id byte then packet id 1
    let sent = a.link.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0][0], (OP_DATA_V1 << 3) | 3);
    assert_eq!(&sent[0][1..5], &1u32.to_be_bytes());

    // the far side accepted and injected the plaintext, marked trusted
    let (ip, trusted, payload) = b.tun.try_recv().unwrap();
    assert_eq!(ip, IpProto::Ipv4);
    assert!(trusted);
    assert_eq!(payload, ping);

    assert_eq!(a.engine.stats().tx_packets, 1);
    assert_eq!(b.engine.stats().rx_packets, 1);
    // RX accounting uses the on-wire size, not the plaintext size
    assert_eq!(b.engine.stats().rx_bytes as usize, sent[0].len());
}

#[test]
fn reordered_delivery_within_window_and_replay() {
    let (a, b) = tunnel(EngineConfig::default(), 0, 1000);

    // capture five records without delivering them
    a.link.connect_none();
    for seq in 1..=5 {
        a.engine.tun_xmit(ipv4_ping(seq)).unwrap();
    }
    let wire = a.link.sent();
    assert_eq!(wire.len(), 5);

    // deliver 1,2,3,5,4: all accepted
    for idx in [0usize, 1, 2, 4, 3] {
        b.engine.udp_encap_recv(addr(1), wire[idx].clone());
    }
    assert_eq!(b.engine.stats().rx_packets, 5);
    assert_eq!(b.tun.try_iter().count(), 5);

    // a second delivery of id 4 is a replay and never reaches the interface
    b.engine.udp_encap_recv(addr(1), wire[3].clone());
    assert_eq!(b.engine.stats().drop_replay, 1);
    assert_eq!(b.tun.try_iter().count(), 0);
}

#[test]
fn unknown_key_id_is_dropped_without_side_effects() {
    let (_a, mut b) = tunnel(EngineConfig::default(), 0, 1);

    // a data record claiming key id 5, which neither side installed
    let mut datagram = vec![proto::opcode_compose(OP_DATA_V1, 5)];
    datagram.extend_from_slice(&7u32.to_be_bytes());
    datagram.extend_from_slice(&[0u8; 32]);
    b.engine.udp_encap_recv(addr(1), datagram);

    assert_eq!(b.engine.stats().drop_no_key, 1);
    assert!(b.tun.try_recv().is_err());
    assert!(b.control.packets.try_recv().is_err());
}

#[test]
fn control_opcodes_are_forwarded_verbatim_not_decrypted() {
    let (_a, mut b) = tunnel(EngineConfig::default(), 0, 1);

    let mut datagram = vec![proto::opcode_compose(OP_CONTROL_V1, 0)];
    datagram.extend_from_slice(b"control payload, opaque to the engine");
    b.engine.udp_encap_recv(addr(1), datagram.clone());

    assert_eq!(b.control.packets.try_recv().unwrap(), datagram.as_slice());
    assert_eq!(b.engine.stats().control_forwarded, 1);
    assert!(b.tun.try_recv().is_err());
}

#[test]
fn data_from_unknown_source_goes_to_control_plane() {
    let (a, mut b) = tunnel(EngineConfig::default(), 0, 1);
    a.link.connect_none();
    a.engine.tun_xmit(ipv4_ping(9)).unwrap();
    let record = a.link.sent().remove(0);

    // same record, wrong source address: control plane's problem
    let stranger: SocketAddr = "192.0.2.7:4000".parse().unwrap();
    b.engine.udp_encap_recv(stranger, record.clone());

    assert_eq!(b.control.packets.try_recv().unwrap(), record.as_slice());
    assert_eq!(b.engine.stats().rx_packets, 0);
    assert!(b.tun.try_recv().is_err());
}

#[test]
fn data_v2_records_with_peer_id_are_accepted() {
    let (_a, b) = tunnel(EngineConfig::default(), 3, 1000);

    // hand-build a V2 record: opcode/key-id, 3-byte peer id, packet id,
    // then the sealed payload with the 8-byte header as associated data
    let ping = ipv4_ping(7);
    let pkt_id = 1u32;
    let mut header = vec![proto::opcode_compose(OP_DATA_V2, 3)];
    header.extend_from_slice(&[0x00, 0x00, 0x2a]); // peer id
    header.extend_from_slice(&pkt_id.to_be_bytes());

    let cipher = DataCipher::new(AeadAlgorithm::ChaCha20Poly1305, &AeadKey([0xaa; 32]));
    let sealed = cipher.seal(nonce_for(1000, pkt_id), &header, &ping).unwrap();

    let mut record = header;
    record.extend_from_slice(&sealed);
    b.engine.udp_encap_recv(addr(1), record);

    let (ip, _, payload) = b.tun.try_recv().unwrap();
    assert_eq!(ip, IpProto::Ipv4);
    assert_eq!(payload, ping);
}

#[test]
fn keepalive_is_consumed_silently() {
    let (a, b) = tunnel(EngineConfig::default(), 1, 1);

    let b_peer = b.engine.peer().unwrap();
    let before = b_peer.last_rx();
    std::thread::sleep(Duration::from_millis(5));

    a.engine.send_keepalive().unwrap();

    // no interface delivery, but the RX keepalive stamp moved
    assert!(b.tun.try_recv().is_err());
    assert_eq!(b.engine.stats().keepalive_rx, 1);
    assert_eq!(b.engine.stats().rx_packets, 0);
    assert!(b_peer.last_rx() > before);
}

#[test]
fn control_plane_payload_rides_the_data_channel() {
    let (a, b) = tunnel(EngineConfig::default(), 0, 1);

    // an explicit-exit-notify style blob: encrypted and delivered, but it is
    // no IP packet, so the far side drops it after decrypt
    a.engine.send_data(b"EXIT_NOTIFY_MAGIC".to_vec()).unwrap();

    assert_eq!(a.engine.stats().tx_packets, 1);
    assert_eq!(b.engine.stats().drop_malformed, 1);
    assert!(b.tun.try_recv().is_err());
}

#[test]
fn tx_without_peer_fails_with_no_link() {
    let (tun_tx, _tun_rx) = std::sync::mpsc::channel();
    let (control_tx, _control_rx) = control_channel(16);
    let link = TestLink::new(addr(1));
    let engine = Engine::new(
        EngineConfig::default(),
        Arc::new(TestTun { tx: tun_tx }),
        link,
        control_tx,
    );

    assert!(matches!(engine.tun_xmit(ipv4_ping(1)), Err(Error::NoPeer)));
    assert_eq!(engine.stats().drop_no_peer, 1);
}

#[test]
fn tx_without_key_is_dropped() {
    let a = node(EngineConfig::default(), addr(1), addr(2));
    assert!(matches!(
        a.engine.tun_xmit(ipv4_ping(1)),
        Err(Error::NoPrimary)
    ));
    assert_eq!(a.engine.stats().drop_no_key, 1);
}

#[test]
fn malformed_plaintext_rejected_at_tx_entry() {
    let (a, _b) = tunnel(EngineConfig::default(), 0, 1);
    assert!(matches!(
        a.engine.tun_xmit(b"not an ip packet".to_vec()),
        Err(Error::Malformed(_))
    ));
    assert_eq!(a.engine.stats().drop_malformed, 1);
    assert!(a.link.sent().is_empty());
}

#[test]
fn exhausted_key_raises_one_rekey_event() {
    let (mut a, _b) = tunnel(EngineConfig::default(), 2, 1);

    // install a context whose transmit sequence is already spent
    let spent = CryptoContext::new(
        descriptor(2, 1, [0xaa; 32], [0xbb; 32]),
        Duration::from_secs(30),
    )
    .unwrap()
    .with_transmit_sequence(u64::from(u32::MAX));
    a.engine
        .peer()
        .unwrap()
        .install_context(Arc::new(spent), true);

    // the entry accepts the packet; the failure happens at the encrypt stage
    a.engine.tun_xmit(ipv4_ping(1)).unwrap();
    a.engine.tun_xmit(ipv4_ping(2)).unwrap();

    assert!(a.link.sent().is_empty());
    assert_eq!(
        a.control.events.try_recv().unwrap(),
        ControlEvent::RekeyRequired { key_id: 2 }
    );
    // only one event despite two failures
    assert!(a.control.events.try_recv().is_err());
    assert_eq!(a.engine.stats().rekey_events, 1);
    assert_eq!(a.engine.stats().drop_crypto, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn roundtrip_with_deferred_crypto_completions() {
    let config = EngineConfig {
        crypto_workers: 2,
        ..EngineConfig::default()
    };
    let (a, b) = tunnel(config, 4, 77);

    let ping = ipv4_ping(3);
    a.engine.tun_xmit(ping.clone()).unwrap();

    // completions run on offload workers; wait for the far interface
    let received = tokio::task::spawn_blocking(move || {
        b.tun.recv_timeout(Duration::from_secs(5))
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(received.0, IpProto::Ipv4);
    assert_eq!(received.2, ping);
}
