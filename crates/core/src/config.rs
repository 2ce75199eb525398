use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub brokerage: BrokerageConfig,
    pub synchronizer: SynchronizerConfig,
    pub queue_worker: QueueWorkerConfig,
    pub position_log: PositionLogConfig,
    pub reconciliation: ReconciliationConfig,
}

impl AppConfig {
    /// Rejects values the runtime cannot operate on. Zero-period intervals
    /// and zero-capacity channels panic inside tokio; a zero batch size or
    /// buffer stalls the queue and log paths.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending config key.
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            bail!("database.max_connections must be at least 1");
        }
        if self.synchronizer.update_channel_capacity == 0 {
            bail!("synchronizer.update_channel_capacity must be at least 1");
        }
        if self.queue_worker.poll_interval_secs == 0 {
            bail!("queue_worker.poll_interval_secs must be at least 1");
        }
        if self.queue_worker.batch_size == 0 {
            bail!("queue_worker.batch_size must be at least 1");
        }
        if self.position_log.max_buffer == 0 {
            bail!("position_log.max_buffer must be at least 1");
        }
        if self.position_log.flush_interval_secs == 0 {
            bail!("position_log.flush_interval_secs must be at least 1");
        }
        if self.position_log.channel_capacity == 0 {
            bail!("position_log.channel_capacity must be at least 1");
        }
        if self.reconciliation.interval_secs == 0 {
            bail!("reconciliation.interval_secs must be at least 1");
        }
        if !self.reconciliation.quantity_tolerance.is_finite()
            || self.reconciliation.quantity_tolerance < 0.0
        {
            bail!("reconciliation.quantity_tolerance must be a non-negative number");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/possync.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerageConfig {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    /// Paper mode runs against the in-process simulated brokerage.
    pub paper: bool,
}

impl Default for BrokerageConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4002,
            client_id: 0,
            paper: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizerConfig {
    /// Hard cap on concurrently streamed market-data subscriptions.
    pub max_streaming_slots: usize,
    /// Capacity of the update fan-out channel feeding handlers.
    pub update_channel_capacity: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            max_streaming_slots: 90,
            update_channel_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueWorkerConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    /// When set, PROCESSING rows older than this many seconds are moved back
    /// to PENDING at the start of each tick. Disabled by default: a row
    /// orphaned by a crash stays PROCESSING until an operator re-enqueues it.
    pub requeue_stuck_after_secs: Option<u64>,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            batch_size: 25,
            requeue_stuck_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionLogConfig {
    /// Buffered records that trigger an immediate flush.
    pub max_buffer: usize,
    /// Seconds between periodic flushes of a partially filled buffer.
    pub flush_interval_secs: u64,
    /// Capacity of the writer command channel.
    pub channel_capacity: usize,
}

impl Default for PositionLogConfig {
    fn default() -> Self {
        Self {
            max_buffer: 100,
            flush_interval_secs: 5,
            channel_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Absolute quantity difference beyond which two sides of a position
    /// count as mismatched. A difference of exactly this value still matches.
    pub quantity_tolerance: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            quantity_tolerance: 0.001,
        }
    }
}
