use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use tracing::warn;

use crate::transport::chunk::{AssemblerConfig, DEFAULT_MAX_INFLIGHT, DEFAULT_TRANSFER_TIMEOUT};

pub const ENV_TRANSPORT: &str = "MESH_TRANSPORT";
pub const ENV_CHUNK_SIZE: &str = "MESH_CHUNK_SIZE";
pub const ENV_CHUNK_INTERVAL_MS: &str = "MESH_CHUNK_INTERVAL_MS";
pub const ENV_AUTO_CLOSE_ENTIRE_SESSION: &str = "MESH_AUTO_CLOSE_ENTIRE_SESSION";
pub const ENV_TRANSMIT_ROOM_ONCE: &str = "MESH_TRANSMIT_ROOM_ONCE";

const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_CANDIDATE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Preferred peer-link transport. Only affects chunking defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TransportMode {
    #[default]
    Sctp,
    Rtp,
}

impl TransportMode {
    pub fn default_chunk_size(self) -> usize {
        match self {
            TransportMode::Sctp => 13_000,
            TransportMode::Rtp => 1_000,
        }
    }

    pub fn default_chunk_interval(self) -> Duration {
        match self {
            TransportMode::Sctp => Duration::from_millis(100),
            TransportMode::Rtp => Duration::from_millis(500),
        }
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sctp" => Ok(TransportMode::Sctp),
            "rtp" => Ok(TransportMode::Rtp),
            other => Err(format!("unknown transport mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    pub transport_mode: TransportMode,
    pub chunk_size: usize,
    pub chunk_interval: Duration,
    /// End the whole room when the broadcaster leaves instead of handing
    /// the role to the first remaining peer.
    pub auto_close_entire_session: bool,
    pub transmit_room_once: bool,
    pub auto_join: bool,
    pub announce_interval: Duration,
    pub candidate_retry_interval: Duration,
    pub max_inflight_transfers: usize,
    pub transfer_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::for_mode(TransportMode::default())
    }
}

impl MeshConfig {
    pub fn for_mode(mode: TransportMode) -> Self {
        Self {
            transport_mode: mode,
            chunk_size: mode.default_chunk_size(),
            chunk_interval: mode.default_chunk_interval(),
            auto_close_entire_session: false,
            transmit_room_once: false,
            auto_join: true,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            candidate_retry_interval: DEFAULT_CANDIDATE_RETRY_INTERVAL,
            max_inflight_transfers: DEFAULT_MAX_INFLIGHT,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }

    /// Load configuration from `MESH_*` environment variables.
    pub fn from_env() -> Self {
        let mode = match std::env::var(ENV_TRANSPORT) {
            Ok(raw) => raw.parse::<TransportMode>().unwrap_or_else(|err: String| {
                warn!(target = "mesh::config", var = ENV_TRANSPORT, error = %err, "using default transport");
                TransportMode::default()
            }),
            Err(_) => TransportMode::default(),
        };
        let mut config = Self::for_mode(mode);
        config.chunk_size = parse_usize_env(ENV_CHUNK_SIZE, config.chunk_size, 1);
        config.chunk_interval = Duration::from_millis(parse_u64_env(
            ENV_CHUNK_INTERVAL_MS,
            config.chunk_interval.as_millis() as u64,
        ));
        config.auto_close_entire_session =
            parse_bool_env(ENV_AUTO_CLOSE_ENTIRE_SESSION, config.auto_close_entire_session);
        config.transmit_room_once = parse_bool_env(ENV_TRANSMIT_ROOM_ONCE, config.transmit_room_once);
        config
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    pub fn with_auto_close_entire_session(mut self, enabled: bool) -> Self {
        self.auto_close_entire_session = enabled;
        self
    }

    pub fn with_transmit_room_once(mut self, enabled: bool) -> Self {
        self.transmit_room_once = enabled;
        self
    }

    pub fn with_auto_join(mut self, enabled: bool) -> Self {
        self.auto_join = enabled;
        self
    }

    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    pub fn with_candidate_retry_interval(mut self, interval: Duration) -> Self {
        self.candidate_retry_interval = interval;
        self
    }

    pub fn with_max_inflight_transfers(mut self, max: usize) -> Self {
        self.max_inflight_transfers = max;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn assembler(&self) -> AssemblerConfig {
        AssemblerConfig {
            max_inflight: self.max_inflight_transfers,
            transfer_timeout: self.transfer_timeout,
        }
    }
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "mesh::config",
                    var, parsed, min, default, "value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "mesh::config",
                    var,
                    error = %err,
                    default,
                    "invalid value; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_u64_env(var: &str, default: u64) -> u64 {
    match std::env::var(var) {
        Ok(value) => value.trim().parse::<u64>().unwrap_or_else(|err| {
            warn!(target = "mesh::config", var, error = %err, default, "invalid value; using default");
            default
        }),
        Err(_) => default,
    }
}

fn parse_bool_env(var: &str, default: bool) -> bool {
    match std::env::var(var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            other => {
                warn!(target = "mesh::config", var, value = other, default, "invalid flag; using default");
                default
            }
        },
        Err(_) => default,
    }
}
