//! Batch queue worker.
//!
//! Drains the low-priority queue on an interval. Each tick claims one batch
//! and resolves every row against a single account snapshot: a conid present
//! in the snapshot is recorded to the position log and marked SUCCESS, a
//! conid absent from it is marked FAILED. When the snapshot itself cannot be
//! taken the whole claimed batch fails, since nothing in it can be resolved.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use possync_core::config::QueueWorkerConfig;
use possync_core::types::{BrokerPosition, Conid, PRIORITY_LOW};
use possync_data::PositionRecord;

use crate::queue::WorkQueue;
use crate::session::BrokerageSession;
use crate::writer::PositionLog;

/// Running totals for the worker loop.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub ticks: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub requeued: u64,
    pub last_batch_size: usize,
    pub last_batch_at: Option<DateTime<Utc>>,
}

/// Interval daemon that resolves queued position requests.
pub struct QueueWorker {
    session: Arc<BrokerageSession>,
    queue: Arc<WorkQueue>,
    log: PositionLog,
    config: QueueWorkerConfig,
    stats: Arc<RwLock<WorkerStats>>,
}

impl QueueWorker {
    /// Creates a worker over the shared session, queue, and log.
    #[must_use]
    pub fn new(
        session: Arc<BrokerageSession>,
        queue: Arc<WorkQueue>,
        log: PositionLog,
        config: QueueWorkerConfig,
    ) -> Self {
        Self {
            session,
            queue,
            log,
            config,
            stats: Arc::new(RwLock::new(WorkerStats::default())),
        }
    }

    /// Snapshot of the running totals.
    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Runs the worker until the shutdown signal flips to `true`.
    ///
    /// The first pass runs immediately; later passes follow the configured
    /// poll interval. A failed pass is logged and the loop keeps going.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            "queue worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "queue worker pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("queue worker stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One worker pass: optional stuck-row recovery, claim, resolve.
    ///
    /// # Errors
    /// Returns an error if the queue or log cannot be reached. Brokerage
    /// snapshot failures are handled inside the pass by failing the batch.
    pub async fn run_once(&self) -> Result<()> {
        self.stats.write().await.ticks += 1;

        if let Some(secs) = self.config.requeue_stuck_after_secs {
            // A bound too large to represent means no row is ever stuck.
            let older_than = i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX);
            let requeued = self.queue.requeue_stuck(older_than).await?;
            if requeued > 0 {
                self.stats.write().await.requeued += requeued;
            }
        }

        let batch = self
            .queue
            .get_batch(PRIORITY_LOW, self.config.batch_size)
            .await?;
        {
            let mut stats = self.stats.write().await;
            stats.last_batch_size = batch.len();
            stats.last_batch_at = Some(Utc::now());
        }
        if batch.is_empty() {
            return Ok(());
        }

        let snapshot = async {
            self.session.ensure_connected().await?;
            self.session.fetch_open_positions().await
        }
        .await;

        let positions = match snapshot {
            Ok(positions) => positions,
            Err(e) => {
                // One snapshot serves the whole batch; without it no row
                // can be resolved.
                error!(error = %e, batch = batch.len(), "brokerage snapshot failed, failing batch");
                let message = format!("brokerage snapshot failed: {e}");
                for request in &batch {
                    self.queue.mark_failed(&request.request_id, &message).await?;
                }
                let mut stats = self.stats.write().await;
                stats.processed += batch.len() as u64;
                stats.failed += batch.len() as u64;
                return Ok(());
            }
        };

        let by_conid: HashMap<Conid, &BrokerPosition> =
            positions.iter().map(|p| (p.conid, p)).collect();
        let observed_at = Utc::now();
        let mut records = Vec::new();
        let mut succeeded = Vec::new();
        let mut failed: u64 = 0;

        for request in &batch {
            if let Some(position) = by_conid.get(&request.conid) {
                records.push(PositionRecord::from_position(position, observed_at));
                succeeded.push(request.request_id.clone());
            } else {
                self.queue
                    .mark_failed(&request.request_id, "position not in brokerage snapshot")
                    .await?;
                failed += 1;
            }
        }

        // Record observations before resolving their requests.
        if !records.is_empty() {
            self.log.write(records).await?;
        }
        if !succeeded.is_empty() {
            self.queue.mark_success(&succeeded).await?;
        }

        let mut stats = self.stats.write().await;
        stats.processed += batch.len() as u64;
        stats.succeeded += succeeded.len() as u64;
        stats.failed += failed;
        info!(
            processed = batch.len(),
            succeeded = succeeded.len(),
            failed,
            "queue batch processed"
        );
        Ok(())
    }
}
