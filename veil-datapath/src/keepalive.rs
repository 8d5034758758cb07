#![forbid(unsafe_code)]

//! Keepalive scheduling.
//!
//! The datapath only stamps timestamps; this task turns them into traffic
//! and events. When the peer has transmitted nothing for the configured
//! interval it sends the keepalive message through the special path, and
//! when nothing authenticated has arrived within the timeout it raises a
//! control event so the control plane can tear the peer down.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::control::ControlEvent;
use crate::engine::Engine;

/// Probe period. Fine enough that a keepalive goes out within a second of
/// its deadline with any practical interval.
const TICK: Duration = Duration::from_secs(1);

/// Spawn the keepalive scheduler for an engine. The task follows whatever
/// peer is currently installed and idles while there is none; aborting the
/// handle stops it.
pub fn spawn(engine: Arc<Engine>) -> JoinHandle<()> {
    let interval = engine.config().keepalive_interval();
    let timeout = engine.config().keepalive_timeout();

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut timeout_reported = false;

        loop {
            tick.tick().await;
            let Some(peer) = engine.peer() else {
                timeout_reported = false;
                continue;
            };

            if peer.last_tx().elapsed() >= interval {
                debug!("transmit idle, sending keepalive");
                let _ = engine.send_keepalive();
            }

            if peer.last_rx().elapsed() >= timeout {
                if !timeout_reported {
                    warn!("peer keepalive timeout");
                    engine.control().send_event(ControlEvent::KeepaliveTimeout);
                    timeout_reported = true;
                }
            } else {
                timeout_reported = false;
            }
        }
    })
}
