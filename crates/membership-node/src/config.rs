//! Node configuration loading and validation

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use membership_core::{
    DetectorConfig, EngineConfig, Identity, NodeIdSet, SystemViewConfig,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::pool::DEFAULT_LANE_CAPACITY;

/// Complete configuration of one membership node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster discriminator; nodes with a different magic ignore each other
    #[serde(default = "default_magic")]
    pub magic: i32,

    /// This node's id, unique in the cluster
    #[serde(default)]
    pub node_id: i32,

    /// Incarnation number. Defaults to the start time in milliseconds
    #[serde(default)]
    pub epoch: Option<i64>,

    /// Advertise a preference for leadership
    #[serde(default)]
    pub preferred: bool,

    #[serde(default)]
    pub gossip: GossipConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Time between gossip rounds
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Live members contacted per round
    #[serde(default = "default_fanout")]
    pub fanout: usize,

    /// Silence after which a peer is dead whatever the detector says.
    /// Defaults to six intervals
    #[serde(default)]
    pub heartbeat_timeout_ms: Option<i64>,

    #[serde(default = "default_quarantine_delay")]
    pub quarantine_delay_ms: i64,

    /// How long an unreachable address is remembered
    #[serde(default = "default_unreachable_node_delay")]
    pub unreachable_node_delay_ms: i64,

    /// Unchanged time before a view is declared stable. Defaults to two
    /// intervals
    #[serde(default)]
    pub quiescence_ms: Option<i64>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval(),
            fanout: default_fanout(),
            heartbeat_timeout_ms: None,
            quarantine_delay_ms: default_quarantine_delay(),
            unreachable_node_delay_ms: default_unreachable_node_delay(),
            quiescence_ms: None,
        }
    }
}

impl GossipConfig {
    pub fn heartbeat_timeout_ms(&self) -> i64 {
        self.heartbeat_timeout_ms.unwrap_or(HEARTBEAT_TIMEOUT_INTERVALS * self.interval_ms as i64)
    }

    pub fn quiescence_ms(&self) -> i64 {
        self.quiescence_ms.unwrap_or(QUIESCENCE_INTERVALS * self.interval_ms as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Address put in heartbeats (default: the bound address)
    #[serde(default)]
    pub advertise: Option<SocketAddr>,

    /// Bootstrap peers
    #[serde(default)]
    pub seeds: Vec<SocketAddr>,

    #[serde(default = "default_backlog")]
    pub backlog: u32,

    #[serde(default)]
    pub send_buffer_size: Option<u32>,

    #[serde(default)]
    pub recv_buffer_size: Option<u32>,

    /// Largest payload accepted or sent in one frame
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Upper bound on how long the selector sleeps without an event
    #[serde(default = "default_select_timeout")]
    pub select_timeout_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_workers")]
    pub io_workers: usize,

    #[serde(default = "default_workers")]
    pub dispatch_workers: usize,

    /// Messages waiting per dispatch lane before new ones are dropped
    #[serde(default = "default_dispatch_queue_capacity")]
    pub dispatch_queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            advertise: None,
            seeds: Vec::new(),
            backlog: default_backlog(),
            send_buffer_size: None,
            recv_buffer_size: None,
            max_frame_size: default_max_frame_size(),
            select_timeout_ms: default_select_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            io_workers: default_workers(),
            dispatch_workers: default_workers(),
            dispatch_queue_capacity: default_dispatch_queue_capacity(),
        }
    }
}

impl TransportConfig {
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

const HEARTBEAT_TIMEOUT_INTERVALS: i64 = 6;
const QUIESCENCE_INTERVALS: i64 = 2;

fn default_magic() -> i32 {
    12345
}

fn default_interval() -> u64 {
    1000
}

fn default_fanout() -> usize {
    1
}

fn default_quarantine_delay() -> i64 {
    1000
}

fn default_unreachable_node_delay() -> i64 {
    500_000
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7000))
}

fn default_backlog() -> u32 {
    128
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_select_timeout() -> u64 {
    1000
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_workers() -> usize {
    3
}

fn default_dispatch_queue_capacity() -> usize {
    DEFAULT_LANE_CAPACITY
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            magic: default_magic(),
            node_id: 0,
            epoch: None,
            preferred: false,
            gossip: GossipConfig::default(),
            detector: DetectorConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: NodeConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id < 0 || self.node_id as usize >= NodeIdSet::CAPACITY {
            return Err(ConfigError::NodeIdOutOfRange(self.node_id));
        }
        if self.gossip.interval_ms == 0 {
            return Err(ConfigError::NotPositive("gossip.interval_ms"));
        }
        if self.gossip.fanout == 0 {
            return Err(ConfigError::NotPositive("gossip.fanout"));
        }
        if self.gossip.heartbeat_timeout_ms() <= 0 {
            return Err(ConfigError::NotPositive("gossip.heartbeat_timeout_ms"));
        }
        if self.gossip.quiescence_ms() < 0 {
            return Err(ConfigError::NotPositive("gossip.quiescence_ms"));
        }
        let threshold = self.detector.conviction_threshold;
        if threshold.is_nan() || threshold <= 0.0 {
            return Err(ConfigError::NotPositive("detector.conviction_threshold"));
        }
        if self.detector.window_size == 0 {
            return Err(ConfigError::NotPositive("detector.window_size"));
        }
        if self.transport.io_workers == 0 {
            return Err(ConfigError::NotPositive("transport.io_workers"));
        }
        if self.transport.dispatch_workers == 0 {
            return Err(ConfigError::NotPositive("transport.dispatch_workers"));
        }
        if self.transport.dispatch_queue_capacity == 0 {
            return Err(ConfigError::NotPositive("transport.dispatch_queue_capacity"));
        }
        if self.transport.max_frame_size == 0 {
            return Err(ConfigError::NotPositive("transport.max_frame_size"));
        }
        if let Some(advertise) = self.transport.advertise {
            if advertise.ip().is_unspecified() || advertise.port() == 0 {
                return Err(ConfigError::InvalidAddress {
                    value: advertise.to_string(),
                    reason: "advertised address must be routable".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Identity for this run. Without a configured epoch, a fresh one is taken
    /// from the clock.
    pub fn identity(&self) -> Identity {
        match self.epoch {
            Some(epoch) => Identity::new(self.magic, self.node_id, epoch),
            None => Identity::with_fresh_epoch(self.magic, self.node_id),
        }
    }

    /// Engine settings for a node reachable at `address`.
    pub fn engine_config(&self, identity: Identity, address: SocketAddr) -> EngineConfig {
        let mut engine = EngineConfig::new(identity, address);
        engine.interval_ms = self.gossip.interval_ms as i64;
        engine.fanout = self.gossip.fanout;
        engine.heartbeat_timeout_ms = self.gossip.heartbeat_timeout_ms();
        engine.quiescence_ms = self.gossip.quiescence_ms();
        engine.preferred = self.preferred;
        engine.detector = self.detector.clone();
        engine.system_view = SystemViewConfig {
            seeds: self.transport.seeds.clone(),
            quarantine_delay_ms: self.gossip.quarantine_delay_ms,
            unreachable_node_delay_ms: self.gossip.unreachable_node_delay_ms,
        };
        engine
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.gossip.interval_ms)
    }
}
