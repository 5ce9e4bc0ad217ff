//! Tarpit configuration.
//!
//! Values come from built-in defaults, optionally overlaid by a RON file:
//!
//! ```ron
//! (
//!     port: 2222,
//!     max_active_connections: 50,
//!     stall_delay_secs: 30,
//!     output_path: "/var/lib/sshnope/credentials.csv",
//! )
//! ```
//!
//! Missing fields keep their defaults. The binary applies command-line flags
//! on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BIND_ADDRESS, DEFAULT_FLUSH_BUFFER_SIZE, DEFAULT_HOST_KEY_PATH,
    DEFAULT_MAX_ACTIVE_CONNECTIONS, DEFAULT_OUTPUT_PATH, DEFAULT_SERVER_ID, DEFAULT_SSH_PORT,
    DEFAULT_STALL_DELAY, KEEPALIVE_GRACE,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("invalid bind address {0:?}")]
    BindAddress(String),
}

/// Runtime settings for the tarpit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TarpitConfig {
    pub bind_address: String,
    pub port: u16,
    pub host_key_path: PathBuf,
    pub max_active_connections: usize,
    pub stall_delay_secs: u64,
    pub output_path: PathBuf,
    pub flush_buffer_size: usize,
    /// Wake the drain loop early once this many records are waiting.
    pub drain_threshold: Option<usize>,
    pub server_id: String,
}

impl Default for TarpitConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.into(),
            port: DEFAULT_SSH_PORT,
            host_key_path: DEFAULT_HOST_KEY_PATH.into(),
            max_active_connections: DEFAULT_MAX_ACTIVE_CONNECTIONS,
            stall_delay_secs: DEFAULT_STALL_DELAY.as_secs(),
            output_path: DEFAULT_OUTPUT_PATH.into(),
            flush_buffer_size: DEFAULT_FLUSH_BUFFER_SIZE,
            drain_threshold: None,
            server_id: DEFAULT_SERVER_ID.into(),
        }
    }
}

impl TarpitConfig {
    /// Load from a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse::<SocketAddr>()
            .or_else(|_| {
                // Bare IPv6 literals need brackets.
                format!("[{}]:{}", self.bind_address, self.port).parse::<SocketAddr>()
            })
            .map_err(|_| ConfigError::BindAddress(self.bind_address.clone()))
    }

    pub fn stall_delay(&self) -> Duration {
        Duration::from_secs(self.stall_delay_secs)
    }

    /// Keepalive probes go out a little after a stall would have finished.
    pub fn keepalive_interval(&self) -> Duration {
        self.stall_delay() + KEEPALIVE_GRACE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = TarpitConfig::default();
        assert_eq!(config.port, 8022);
        assert_eq!(config.max_active_connections, 20);
        assert_eq!(config.stall_delay(), Duration::from_secs(10));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(15));
        assert_eq!(config.output_path, PathBuf::from("ssh_credentials.csv"));
        assert_eq!(config.flush_buffer_size, 512);
        assert_eq!(config.drain_threshold, None);
        assert_eq!(
            config.socket_addr().unwrap(),
            "0.0.0.0:8022".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn partial_ron_keeps_defaults() {
        let config = TarpitConfig::from_ron(
            r#"(port: 2222, stall_delay_secs: 30, drain_threshold: Some(100))"#,
        )
        .unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.stall_delay_secs, 30);
        assert_eq!(config.drain_threshold, Some(100));
        assert_eq!(config.max_active_connections, 20);
        assert_eq!(config.server_id, DEFAULT_SERVER_ID);
    }

    #[test]
    fn load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sshnope.ron");
        std::fs::write(&path, "(port: \"nope\")").unwrap();

        let err = TarpitConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("sshnope.ron"));
    }

    #[test]
    fn ipv6_bind_address() {
        let config = TarpitConfig {
            bind_address: "::".into(),
            ..Default::default()
        };
        assert_eq!(
            config.socket_addr().unwrap(),
            "[::]:8022".parse::<SocketAddr>().unwrap()
        );

        let bad = TarpitConfig {
            bind_address: "not an address".into(),
            ..Default::default()
        };
        assert!(matches!(bad.socket_addr(), Err(ConfigError::BindAddress(_))));
    }
}
