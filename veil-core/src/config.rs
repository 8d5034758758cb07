#![forbid(unsafe_code)]

//! Engine configuration. Parses a TOML fragment into a strongly-typed
//! structure with defaults for every field; `validate` rejects combinations
//! the datapath cannot honor.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Tunables for one engine instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of crypto offload workers. Zero runs encrypt/decrypt inline on
    /// the submitting task.
    pub crypto_workers: usize,

    /// Seconds after the last accepted packet before replay-window backtracks
    /// at or below the current top id stop being admissible.
    pub replay_expire_secs: u64,

    /// Seconds of transmit silence before a keepalive message is sent.
    pub keepalive_interval_secs: u64,

    /// Seconds of receive silence before the control plane is told the peer
    /// timed out.
    pub keepalive_timeout_secs: u64,

    /// Depth of the engine-to-control-plane packet queue.
    pub control_queue_depth: usize,

    /// Largest encapsulated datagram the RX path will accept.
    pub max_datagram: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            crypto_workers: 0,
            replay_expire_secs: 30,
            keepalive_interval_secs: 10,
            keepalive_timeout_secs: 60,
            control_queue_depth: 128,
            max_datagram: 65535,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replay_expire_secs == 0 {
            return Err(Error::config("replay_expire_secs must be non-zero"));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(Error::config("keepalive_interval_secs must be non-zero"));
        }
        if self.keepalive_timeout_secs <= self.keepalive_interval_secs {
            return Err(Error::config(
                "keepalive_timeout_secs must exceed keepalive_interval_secs",
            ));
        }
        if self.control_queue_depth == 0 {
            return Err(Error::config("control_queue_depth must be non-zero"));
        }
        if self.max_datagram < 576 {
            return Err(Error::config("max_datagram below minimum IP datagram"));
        }
        Ok(())
    }

    pub fn replay_expire(&self) -> Duration {
        Duration::from_secs(self.replay_expire_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.replay_expire(), Duration::from_secs(30));
    }

    #[test]
    fn parses_partial_toml() -> core::result::Result<(), Box<dyn std::error::Error>> {
        let cfg = EngineConfig::from_toml_str("crypto_workers = 4\nkeepalive_interval_secs = 5\n")?;
        assert_eq!(cfg.crypto_workers, 4);
        assert_eq!(cfg.keepalive_interval_secs, 5);
        // untouched fields keep their defaults
        assert_eq!(cfg.keepalive_timeout_secs, 60);
        Ok(())
    }

    #[test]
    fn rejects_timeout_below_interval() {
        let res = EngineConfig::from_toml_str(
            "keepalive_interval_secs = 30\nkeepalive_timeout_secs = 30\n",
        );
        assert!(res.is_err());
    }

    #[test]
    fn rejects_zero_expire() {
        assert!(EngineConfig::from_toml_str("replay_expire_secs = 0\n").is_err());
    }
}
