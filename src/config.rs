//! Raft runtime configuration.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Default duration of one ticker tick, in milliseconds.
pub const DEFAULT_TICK_INTERVAL: u64 = 100;
/// Default minimum number of ticks before an election timeout fires.
pub const DEFAULT_TICK_MIN: u64 = 5;
/// Default maximum number of ticks before an election timeout fires.
pub const DEFAULT_TICK_MAX: u64 = 10;
/// Default timeout for a single outbound RPC, in milliseconds.
pub const DEFAULT_RPC_TIMEOUT: u64 = 100;
/// Default maximum number of entries per replication payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;

/// Errors encountered during the building of a `Config` instance.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The tick interval must be greater than zero.
    #[error("tick interval must be greater than 0")]
    InvalidTickInterval,
    /// The election tick bounds are invalid.
    ///
    /// The minimum must be at least 2 (so that the leader's heartbeat reset
    /// of `tick_min - 1` stays positive and still beats every follower), and
    /// the maximum must not be less than the minimum.
    #[error("election tick bounds are invalid")]
    InvalidTickBounds,
    /// The RPC timeout must be greater than zero.
    #[error("rpc timeout must be greater than 0")]
    InvalidRpcTimeout,
    /// The maximum replication payload size must be greater than zero.
    #[error("max payload entries must be greater than 0")]
    MaxPayloadEntriesTooSmall,
}

/// The runtime configuration for a Raft node.
///
/// Election timeouts are expressed in ticks: a node's ticker is decremented
/// once per `tick_interval` milliseconds, and a non-leader whose counter
/// reaches zero starts an election. The counter is reset to a uniform draw
/// from `[tick_min, tick_max]`; a leader resets to `max(1, tick_min - 1)`
/// instead, which guarantees its heartbeats land inside every follower's
/// election window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// Duration of one ticker tick, in milliseconds.
    pub tick_interval: u64,
    /// Minimum number of ticks before an election timeout fires.
    pub tick_min: u64,
    /// Maximum number of ticks before an election timeout fires.
    pub tick_max: u64,
    /// Timeout for a single outbound RPC, in milliseconds.
    pub rpc_timeout: u64,
    /// Maximum number of entries per replication payload.
    pub max_payload_entries: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            tick_interval: None,
            tick_min: None,
            tick_max: None,
            rpc_timeout: None,
            max_payload_entries: None,
        }
    }
}

/// A configuration builder to ensure that runtime config is valid.
pub struct ConfigBuilder {
    cluster_name: String,
    tick_interval: Option<u64>,
    tick_min: Option<u64>,
    tick_max: Option<u64>,
    rpc_timeout: Option<u64>,
    max_payload_entries: Option<u64>,
}

impl ConfigBuilder {
    /// Set the duration of one ticker tick, in milliseconds.
    pub fn tick_interval(mut self, val: u64) -> Self {
        self.tick_interval = Some(val);
        self
    }

    /// Set the minimum number of ticks before an election timeout fires.
    pub fn tick_min(mut self, val: u64) -> Self {
        self.tick_min = Some(val);
        self
    }

    /// Set the maximum number of ticks before an election timeout fires.
    pub fn tick_max(mut self, val: u64) -> Self {
        self.tick_max = Some(val);
        self
    }

    /// Set the timeout for a single outbound RPC, in milliseconds.
    pub fn rpc_timeout(mut self, val: u64) -> Self {
        self.rpc_timeout = Some(val);
        self
    }

    /// Set the maximum number of entries per replication payload.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let tick_interval = self.tick_interval.unwrap_or(DEFAULT_TICK_INTERVAL);
        if tick_interval == 0 {
            return Err(ConfigError::InvalidTickInterval);
        }
        let tick_min = self.tick_min.unwrap_or(DEFAULT_TICK_MIN);
        let tick_max = self.tick_max.unwrap_or(DEFAULT_TICK_MAX);
        if tick_min < 2 || tick_max < tick_min {
            return Err(ConfigError::InvalidTickBounds);
        }
        let rpc_timeout = self.rpc_timeout.unwrap_or(DEFAULT_RPC_TIMEOUT);
        if rpc_timeout == 0 {
            return Err(ConfigError::InvalidRpcTimeout);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            tick_interval,
            tick_min,
            tick_max,
            rpc_timeout,
            max_payload_entries,
        })
    }
}
