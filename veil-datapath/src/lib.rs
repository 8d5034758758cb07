#![forbid(unsafe_code)]

//! Veil datapath engine.
//!
//! The fast path every tunneled packet traverses: plaintext IP datagrams
//! from the virtual interface are sealed into data-channel records and
//! handed to the transport, inbound records are opened, replay-checked and
//! injected back. Anything that is not recognizable data-channel traffic is
//! forwarded verbatim to the control plane.

pub mod bind;
pub mod control;
pub mod engine;
pub mod errors;
pub mod keepalive;
pub mod peer;
pub mod proto;
pub mod stats;

pub use bind::Bind;
pub use control::{control_channel, ControlChannel, ControlEvent, ControlReceiver};
pub use engine::{Engine, OutboundTransport, TunPacket, TunSink};
pub use errors::{Error, Result};
pub use peer::Peer;
pub use proto::IpProto;
pub use stats::{EngineStats, StatsSnapshot};
