//! Transport configuration.
//!
//! Every timing and size constant of the wire layer lives here so tests
//! and deployments can tighten or loosen them without code changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Hard limit: a frame longer than this fails the connection.
    #[serde(default = "default_packet_limit")]
    pub packet_limit: usize,

    /// Soft limit: frames longer than this are logged.
    #[serde(default = "default_packet_warn_bytes")]
    pub packet_warn_bytes: usize,

    /// Upper bound on the jittered write-coalescing delay.
    #[serde(default = "default_max_coalesce_delay_ms", with = "duration_ms")]
    pub max_coalesce_delay: Duration,

    /// Maximum bytes handed to the kernel per write call.
    #[serde(default = "default_max_packet_send_bytes")]
    pub max_packet_send_bytes: usize,

    /// First reconnect delay after a failure.
    #[serde(default = "default_connect_backoff_initial_ms", with = "duration_ms")]
    pub connect_backoff_initial: Duration,

    /// Ceiling for the exponential reconnect delay.
    #[serde(default = "default_connect_backoff_max_ms", with = "duration_ms")]
    pub connect_backoff_max: Duration,

    /// A connection older than this resets the backoff to the initial value.
    #[serde(default = "default_connect_backoff_reset_ms", with = "duration_ms")]
    pub connect_backoff_reset: Duration,

    /// Liveness ping period. Two silent periods fail the connection.
    #[serde(default = "default_ping_interval_ms", with = "duration_ms")]
    pub ping_interval: Duration,

    /// Window over which peer closes are counted for degradation.
    #[serde(default = "default_close_window_ms", with = "duration_ms")]
    pub peer_close_window: Duration,

    /// Closes within the window before this process marks itself degraded.
    #[serde(default = "default_close_limit")]
    pub peer_close_limit: usize,

    /// Incompatible-peer records older than this are dropped.
    #[serde(default = "default_incompatible_ttl_ms", with = "duration_ms")]
    pub incompatible_peer_ttl: Duration,

    /// TLS mode: the stream provides integrity, so frames omit the CRC.
    #[serde(default)]
    pub tls_mode: bool,

    /// This process can talk to incompatible peers through an out-of-band
    /// mechanism; keep such connections open instead of closing them.
    #[serde(default)]
    pub multi_version_client: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            packet_limit: default_packet_limit(),
            packet_warn_bytes: default_packet_warn_bytes(),
            max_coalesce_delay: default_max_coalesce_delay_ms(),
            max_packet_send_bytes: default_max_packet_send_bytes(),
            connect_backoff_initial: default_connect_backoff_initial_ms(),
            connect_backoff_max: default_connect_backoff_max_ms(),
            connect_backoff_reset: default_connect_backoff_reset_ms(),
            ping_interval: default_ping_interval_ms(),
            peer_close_window: default_close_window_ms(),
            peer_close_limit: default_close_limit(),
            incompatible_peer_ttl: default_incompatible_ttl_ms(),
            tls_mode: false,
            multi_version_client: false,
        }
    }
}

fn default_packet_limit() -> usize {
    100 * 1024 * 1024
}
fn default_packet_warn_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_max_coalesce_delay_ms() -> Duration {
    Duration::from_millis(2)
}
fn default_max_packet_send_bytes() -> usize {
    128 * 1024
}
fn default_connect_backoff_initial_ms() -> Duration {
    Duration::from_millis(50)
}
fn default_connect_backoff_max_ms() -> Duration {
    Duration::from_secs(5)
}
fn default_connect_backoff_reset_ms() -> Duration {
    Duration::from_secs(10)
}
fn default_ping_interval_ms() -> Duration {
    Duration::from_secs(1)
}
fn default_close_window_ms() -> Duration {
    Duration::from_secs(10)
}
fn default_close_limit() -> usize {
    5
}
fn default_incompatible_ttl_ms() -> Duration {
    Duration::from_secs(60)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
