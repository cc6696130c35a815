//! Process configuration, read from the environment per spec.md §6.
//!
//! Command-line overrides are left to the embedding application: it can
//! build a [`Config`] directly instead of calling [`Config::from_env`]. No
//! argument-parsing crate is pulled in here — CLI entry is explicitly out of
//! scope for this crate.

use crate::backend::Backend;
use crate::error::{Error, Result};
use std::time::Duration;

const DEFAULT_TRACKER_PORT: u16 = 9000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_CONNECT_RETRY: u32 = 5;
const DEFAULT_RING_MINCOUNT: u64 = 32 << 20; // 32 MiB, matches common rabit-style defaults.

#[derive(Debug, Clone)]
pub struct Config {
    pub tracker_uri: String,
    pub tracker_port: u16,
    pub heartbeat_interval: Duration,
    pub restart: bool,
    pub rank_hint: Option<i32>,
    pub pending_nodes: u32,
    pub reduce_ring_mincount: u64,
    pub connect_retry: u32,
    pub backend: Backend,
    pub num_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tracker_uri: String::new(),
            tracker_port: DEFAULT_TRACKER_PORT,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            restart: false,
            rank_hint: None,
            pending_nodes: 0,
            reduce_ring_mincount: DEFAULT_RING_MINCOUNT,
            connect_retry: DEFAULT_CONNECT_RETRY,
            backend: Backend::Tcp,
            num_workers: default_num_workers(),
        }
    }
}

impl Config {
    /// Build a [`Config`] from the `RDC_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();

        if let Some(v) = env_str("RDC_TRACKER_URI") {
            cfg.tracker_uri = v;
        }
        if let Some(v) = env_str("RDC_TRACKER_PORT") {
            cfg.tracker_port = parse_env("RDC_TRACKER_PORT", &v)?;
        }
        if let Some(v) = env_str("RDC_HEARTBEAT_INTERVAL") {
            let ms: u64 = parse_env("RDC_HEARTBEAT_INTERVAL", &v)?;
            cfg.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(v) = env_str("RDC_RESTART") {
            cfg.restart = parse_env::<u8>("RDC_RESTART", &v)? != 0;
        }
        if let Some(v) = env_str("RDC_RANK") {
            cfg.rank_hint = Some(parse_env("RDC_RANK", &v)?);
        }
        if let Some(v) = env_str("RDC_PENDING_NODES") {
            cfg.pending_nodes = parse_env("RDC_PENDING_NODES", &v)?;
        }
        if let Some(v) = env_str("rdc_reduce_ring_mincount") {
            cfg.reduce_ring_mincount = parse_byte_count("rdc_reduce_ring_mincount", &v)?;
        }
        if let Some(v) = env_str("RDC_WORKER_CONNECT_RETRY") {
            cfg.connect_retry = parse_env("RDC_WORKER_CONNECT_RETRY", &v)?;
        }
        if let Some(v) = env_str("RDC_BACKEND") {
            cfg.backend = v.parse().map_err(|_| Error::InvalidEnv {
                key: "RDC_BACKEND",
                value: v,
            })?;
        }
        if let Some(v) = env_str("RDC_NUM_WORKERS") {
            cfg.num_workers = parse_env("RDC_NUM_WORKERS", &v)?;
        }

        Ok(cfg)
    }
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T> {
    value.parse().map_err(|_| Error::InvalidEnv {
        key,
        value: value.to_string(),
    })
}

/// Parses a byte count with an optional `B`/`K`/`M`/`G` suffix (case
/// insensitive), as used by `rdc_reduce_ring_mincount`.
fn parse_byte_count(key: &'static str, value: &str) -> Result<u64> {
    let value = value.trim();
    let invalid = || Error::InvalidEnv {
        key,
        value: value.to_string(),
    };
    if value.is_empty() {
        return Err(invalid());
    }
    let (digits, mult) = match value.chars().last().unwrap().to_ascii_uppercase() {
        'B' => (&value[..value.len() - 1], 1u64),
        'K' => (&value[..value.len() - 1], 1u64 << 10),
        'M' => (&value[..value.len() - 1], 1u64 << 20),
        'G' => (&value[..value.len() - 1], 1u64 << 30),
        _ => (value, 1u64),
    };
    let digits = digits.trim();
    let base: u64 = digits.parse().map_err(|_| invalid())?;
    base.checked_mul(mult).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_count_suffixes() {
        assert_eq!(parse_byte_count("k", "32").unwrap(), 32);
        assert_eq!(parse_byte_count("k", "32B").unwrap(), 32);
        assert_eq!(parse_byte_count("k", "4K").unwrap(), 4 * 1024);
        assert_eq!(parse_byte_count("k", "2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_byte_count("k", "1g").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_byte_count("k", "").is_err());
        assert!(parse_byte_count("k", "xM").is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.tracker_port, 9000);
        assert_eq!(cfg.connect_retry, 5);
        assert!(!cfg.restart);
    }
}
