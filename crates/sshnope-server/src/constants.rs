//! Tarpit defaults.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default SSH port for the tarpit.
pub const DEFAULT_SSH_PORT: u16 = 8022;

/// Default bind address (all interfaces).
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Default host key file, an OpenSSH private key.
pub const DEFAULT_HOST_KEY_PATH: &str = "ssh_host_key";

/// Ceiling on concurrently admitted connections.
pub const DEFAULT_MAX_ACTIVE_CONNECTIONS: usize = 20;

/// How long every password attempt is held before it is rejected.
pub const DEFAULT_STALL_DELAY: Duration = Duration::from_secs(10);

/// Keepalive probes go out this much later than the stall delay, so a client
/// parked in a stall is never probed mid-wait.
pub const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

/// Captured credentials land here.
pub const DEFAULT_OUTPUT_PATH: &str = "ssh_credentials.csv";

/// Write buffer for the credential store, in bytes.
pub const DEFAULT_FLUSH_BUFFER_SIZE: usize = 512;

/// Cadence of the drain loop. Not configurable.
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// Identification string sent to clients. Looks like stock OpenSSH.
pub const DEFAULT_SERVER_ID: &str = "SSH-2.0-OpenSSH_9.6p1";

/// Header row of the credential CSV.
pub const CSV_HEADER: [&str; 4] = ["timestamp", "ip", "user", "password"];
