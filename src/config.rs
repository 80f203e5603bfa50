//! Relay configuration.
//!
//! Values come from, in increasing priority: built-in defaults, an optional
//! JSON file, `RILPROXY_*` environment variables, then command-line flags
//! (applied by the binary).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::framing::MAX_PAYLOAD;
use crate::reactor::DEFAULT_MAX_WATCHES;
use crate::socket::SocketPerms;

/// `SETUP_DATA_CALL` request code.
pub const DEFAULT_DEDUP_TRIGGER: i32 = 27;
/// `DEACTIVATE_DATA_CALL` request code.
pub const DEFAULT_DEDUP_RELEASE: i32 = 41;

/// How the upstream connection is established.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// The reconnect supervisor dials out to the upstream socket.
    #[default]
    Connect,
    /// The upstream peer connects to a socket this relay listens on.
    Listen,
}

/// Configuration for one relay process.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Directory holding every named socket.
    pub socket_dir: PathBuf,
    /// Selects which socket family to proxy.
    pub selector: u32,
    /// Dual-SIM fan-out: serve both client endpoints.
    pub fission: bool,
    /// Largest payload accepted on any connection.
    pub max_record_size: usize,
    /// Buffer records for peers that are not connected yet.
    pub cache_enabled: bool,
    /// Per-cache capacity in bytes (headers included).
    pub cache_capacity: usize,
    /// Upper bound on reactor watches.
    pub max_watches: usize,
    /// Pause between losing upstream and dropping the clients.
    pub settle_delay_ms: u64,
    /// Pause between upstream existence/connect attempts.
    pub retry_delay_ms: u64,
    /// Client accepts required to wake the reconnect supervisor.
    pub reconnect_threshold: u32,
    /// Only dial upstream after a client connected.
    pub wait_for_client: bool,
    /// Connect out to upstream or accept it.
    pub upstream_mode: UpstreamMode,
    /// Permission bits for bound sockets.
    pub socket_mode: u32,
    /// Owner uid for bound sockets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_owner: Option<u32>,
    /// Owner gid for bound sockets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_group: Option<u32>,
    /// Arbitrate the shared activation request between both SIM clients.
    pub dedup_enabled: bool,
    /// Request code that activates the shared resource.
    pub dedup_trigger: i32,
    /// Request codes that release it.
    pub dedup_release: Vec<i32>,
    /// Expose the introspection socket.
    pub debug_socket: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/dev/socket"),
            selector: 0,
            fission: false,
            max_record_size: 8 * 1024,
            cache_enabled: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_watches: DEFAULT_MAX_WATCHES,
            settle_delay_ms: 1000,
            retry_delay_ms: 1000,
            reconnect_threshold: 1,
            wait_for_client: true,
            upstream_mode: UpstreamMode::Connect,
            socket_mode: 0o660,
            socket_owner: None,
            socket_group: None,
            dedup_enabled: false,
            dedup_trigger: DEFAULT_DEDUP_TRIGGER,
            dedup_release: vec![DEFAULT_DEDUP_RELEASE],
            debug_socket: true,
        }
    }
}

impl Config {
    /// Load from `path` (if given), apply env overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("RILPROXY_SOCKET_DIR") {
            self.socket_dir = PathBuf::from(dir);
        }

        if let Ok(selector) = std::env::var("RILPROXY_SELECTOR") {
            if let Ok(n) = selector.parse::<u32>() {
                self.selector = n;
            }
        }

        if let Ok(fission) = std::env::var("RILPROXY_FISSION") {
            self.fission = matches!(fission.as_str(), "1" | "true" | "yes");
        }

        if let Ok(dedup) = std::env::var("RILPROXY_DEDUP") {
            self.dedup_enabled = matches!(dedup.as_str(), "1" | "true" | "yes");
        }

        if let Ok(capacity) = std::env::var("RILPROXY_CACHE_CAPACITY") {
            if let Ok(n) = capacity.parse::<usize>() {
                self.cache_capacity = n;
            }
        }

        if let Ok(delay) = std::env::var("RILPROXY_RETRY_DELAY_MS") {
            if let Ok(ms) = delay.parse::<u64>() {
                self.retry_delay_ms = ms;
            }
        }
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_record_size == 0 || self.max_record_size > MAX_PAYLOAD {
            anyhow::bail!(
                "max_record_size must be between 1 and {MAX_PAYLOAD}, got {}",
                self.max_record_size
            );
        }
        if self.max_watches < 4 {
            anyhow::bail!("max_watches must be at least 4, got {}", self.max_watches);
        }
        if self.reconnect_threshold == 0 {
            anyhow::bail!("reconnect_threshold must be at least 1");
        }
        if self.socket_mode > 0o777 {
            anyhow::bail!("socket_mode {:o} is not a permission mask", self.socket_mode);
        }
        Ok(())
    }

    /// Socket names for the configured selector.
    #[must_use]
    pub fn family(&self) -> SocketFamily {
        SocketFamily::for_selector(self.selector)
    }

    /// Full path of a named socket.
    #[must_use]
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.socket_dir.join(name)
    }

    /// Permissions applied to bound sockets.
    #[must_use]
    pub fn socket_perms(&self) -> SocketPerms {
        SocketPerms {
            mode: self.socket_mode,
            owner: self.socket_owner,
            group: self.socket_group,
        }
    }

    /// Settling delay as a [`Duration`].
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Retry delay as a [`Duration`].
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Socket names making up one proxied family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketFamily {
    /// Upstream (modem control) socket.
    pub upstream: String,
    /// Default client socket; the only one used outside fission mode.
    pub secondary: String,
    /// Second client socket, used in fission mode.
    pub primary: String,
    /// Introspection socket.
    pub debug: String,
}

impl SocketFamily {
    /// Names for selector `n`: family 0 has no suffix, others use the number.
    #[must_use]
    pub fn for_selector(n: u32) -> Self {
        let suffix = if n == 0 { String::new() } else { n.to_string() };
        Self {
            upstream: format!("rild{suffix}"),
            secondary: format!("rilproxy{suffix}"),
            primary: format!("rilproxy{suffix}-fission"),
            debug: format!("rilproxy{suffix}-debug"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.dedup_enabled);
        assert_eq!(config.upstream_mode, UpstreamMode::Connect);
    }

    #[test]
    fn test_family_names() {
        let zero = SocketFamily::for_selector(0);
        assert_eq!(zero.upstream, "rild");
        assert_eq!(zero.secondary, "rilproxy");
        assert_eq!(zero.primary, "rilproxy-fission");
        assert_eq!(zero.debug, "rilproxy-debug");

        let two = SocketFamily::for_selector(2);
        assert_eq!(two.upstream, "rild2");
        assert_eq!(two.secondary, "rilproxy2");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"socket_dir": "/run/ril", "fission": true, "upstream_mode": "listen"}"#,
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.socket_dir, PathBuf::from("/run/ril"));
        assert!(config.fission);
        assert_eq!(config.upstream_mode, UpstreamMode::Listen);
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_oversized_record_limit_rejected() {
        let config = Config {
            max_record_size: MAX_PAYLOAD + 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = Config {
            reconnect_threshold: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
