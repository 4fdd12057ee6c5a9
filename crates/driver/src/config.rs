//! Driver tunables (§5 ambient addition): one struct gathering every
//! timeout/retry/threshold the driver needs, with a `Default` matching the
//! source firmware's own constants, overridable from the standalone
//! binary's CLI or programmatically by an embedder.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Per-command timeout before a retry or final failure.
    pub command_timeout: Duration,
    /// Maximum retries for a timed-out command.
    pub max_retries: u32,
    /// Interval between idle-priority status-poll commands.
    pub status_poll_interval: Duration,
    /// Number of step failures tolerated inside one MMM session before the
    /// whole session aborts and the clone is discarded.
    pub mmm_failure_threshold: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            max_retries: 3,
            status_poll_interval: Duration::from_secs(5),
            mmm_failure_threshold: 1,
        }
    }
}

/// Which wire variant and transport kind to use; selected at handshake time
/// in a full deployment, fixed up front here since the standalone binary has
/// no handshake step of its own yet.
#[derive(Debug, Clone, Copy, clap::ValueEnum, PartialEq, Eq)]
pub enum TransportKind {
    /// HID-style fixed 64-byte frames (classic/mini).
    Hid,
    /// Stream framing over a local socket (testing) or BLE.
    Stream,
}

#[derive(Debug, Clone, clap::Parser)]
#[command(name = "driverd", about = "Hardware password manager host driver")]
pub struct Cli {
    /// Path to the local stream socket to connect to.
    #[arg(long, default_value = "/tmp/device-driver.sock")]
    pub socket_path: String,

    /// Wire framing to use for the connection.
    #[arg(long, value_enum, default_value_t = TransportKind::Stream)]
    pub transport: TransportKind,

    /// Per-command timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub command_timeout_ms: u64,

    /// Maximum retries per command before giving up.
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
}

impl Cli {
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            max_retries: self.max_retries,
            ..DriverConfig::default()
        }
    }
}
