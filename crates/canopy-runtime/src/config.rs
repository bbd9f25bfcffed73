//! Node configuration

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use canopy_core::{CanopyError, CanopyResult, DEFAULT_SEPARATORS};
use canopy_routing::{DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL};

/// Canopy node configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Characters that split topic strings into segments
    pub separators: String,
    /// Address the UDP transport binds to
    pub bind_ip: IpAddr,
    /// Default timeout for `link` when the caller gives none
    #[serde(with = "millis")]
    pub link_timeout: Duration,
    /// Event loop housekeeping interval
    #[serde(with = "millis")]
    pub tick_interval: Duration,
    pub dedup_capacity: usize,
    #[serde(with = "millis")]
    pub dedup_ttl: Duration,
    /// Resend period for unacknowledged interest and pending handshakes
    #[serde(with = "millis")]
    pub interest_retry_interval: Duration,
    /// Retransmissions before an unacknowledged link is closed. Also the
    /// number of unanswered keepalives after which a silent link is closed.
    pub max_interest_retries: u32,
    /// Quiet period on an established link before a keepalive is sent, and
    /// between keepalives while it stays quiet
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,
    pub command_buffer: usize,
    pub packet_buffer: usize,
    pub event_buffer: usize,
    /// Trace interest sets and publication topics for this node
    pub debug: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            separators: DEFAULT_SEPARATORS.to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            link_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(20),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            interest_retry_interval: Duration::from_millis(250),
            max_interest_retries: 8,
            keepalive_interval: Duration::from_millis(500),
            command_buffer: 256,
            packet_buffer: 1024,
            event_buffer: 256,
            debug: false,
        }
    }
}

impl NodeConfig {
    /// Load from a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> CanopyResult<Self> {
        let config: NodeConfig =
            serde_json::from_str(json).map_err(|e| CanopyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> CanopyResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| CanopyError::Config(e.to_string()))
    }

    /// Reject values the event loop cannot run with
    pub fn validate(&self) -> CanopyResult<()> {
        if self.separators.is_empty() {
            return Err(CanopyError::Config("separators must not be empty".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(CanopyError::Config("tick_interval must be positive".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(CanopyError::Config("keepalive_interval must be positive".into()));
        }
        if self.command_buffer == 0 || self.packet_buffer == 0 || self.event_buffer == 0 {
            return Err(CanopyError::Config("buffer sizes must be positive".into()));
        }
        Ok(())
    }

    /// Same defaults with per-node debug tracing on
    pub fn debug() -> Self {
        NodeConfig {
            debug: true,
            ..Default::default()
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
