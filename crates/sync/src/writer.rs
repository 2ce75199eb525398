//! Buffered append-only position log.
//!
//! Updates accumulate in a single writer task and flush when the buffer
//! reaches its size cap, when the flush interval elapses, or on an explicit
//! flush barrier. Every flush first collapses the batch to the newest record
//! per conid, then drops records not strictly newer than what the table
//! already holds. Replayed or out-of-order updates therefore never produce a
//! duplicate or backwards row, no matter the arrival order.
//!
//! On a storage error the flush keeps its records buffered and the next
//! trigger retries them.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use possync_core::config::PositionLogConfig;
use possync_core::traits::PositionHandler;
use possync_core::types::{Conid, PositionUpdate};
use possync_data::{PositionLogRepository, PositionRecord};

enum WriterCommand {
    Write(Vec<PositionRecord>),
    Flush(oneshot::Sender<()>),
}

/// Collapses a batch to one record per conid, keeping the newest.
///
/// On equal timestamps the later arrival wins. Output is ordered by conid so
/// flushed batches are deterministic.
fn dedupe_newest(records: Vec<PositionRecord>) -> Vec<PositionRecord> {
    let mut newest: HashMap<Conid, PositionRecord> = HashMap::new();
    for record in records {
        match newest.get(&record.conid) {
            Some(kept) if kept.timestamp_us > record.timestamp_us => {}
            _ => {
                newest.insert(record.conid, record);
            }
        }
    }
    let mut records: Vec<PositionRecord> = newest.into_values().collect();
    records.sort_by_key(|r| r.conid);
    records
}

/// Drops records not strictly newer than the stored latest row per conid.
///
/// Equal timestamps count as already stored, which makes replays of the
/// same observation idempotent.
fn filter_newer(records: Vec<PositionRecord>, stored: &[PositionRecord]) -> Vec<PositionRecord> {
    let stored_ts: HashMap<Conid, i64> = stored
        .iter()
        .map(|r| (r.conid, r.timestamp_us))
        .collect();

    records
        .into_iter()
        .filter(|r| stored_ts.get(&r.conid).map_or(true, |&ts| r.timestamp_us > ts))
        .collect()
}

async fn flush_buffer(repo: &PositionLogRepository, buffer: &mut Vec<PositionRecord>) {
    if buffer.is_empty() {
        return;
    }

    let fresh = dedupe_newest(std::mem::take(buffer));
    let conids: Vec<Conid> = fresh.iter().map(|r| r.conid).collect();

    let stored = match repo.latest_rows_for_conids(&conids).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, buffered = fresh.len(), "failed to read stored positions, keeping buffer");
            *buffer = fresh;
            return;
        }
    };

    let fresh = filter_newer(fresh, &stored);
    if fresh.is_empty() {
        return;
    }

    match repo.insert_batch(&fresh).await {
        Ok(written) => debug!(written, "flushed position buffer"),
        Err(e) => {
            error!(error = %e, buffered = fresh.len(), "failed to append position batch, keeping buffer");
            *buffer = fresh;
        }
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<WriterCommand>,
    repo: PositionLogRepository,
    max_buffer: usize,
    flush_interval: std::time::Duration,
) {
    let mut buffer: Vec<PositionRecord> = Vec::new();
    let mut timer = tokio::time::interval(flush_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(WriterCommand::Write(records)) => {
                    buffer.extend(records);
                    if buffer.len() >= max_buffer {
                        flush_buffer(&repo, &mut buffer).await;
                    }
                }
                Some(WriterCommand::Flush(ack)) => {
                    flush_buffer(&repo, &mut buffer).await;
                    let _ = ack.send(());
                }
                None => {
                    // All senders dropped: final flush, then exit.
                    flush_buffer(&repo, &mut buffer).await;
                    return;
                }
            },
            _ = timer.tick() => {
                flush_buffer(&repo, &mut buffer).await;
            }
        }
    }
}

/// Handle to the position log writer task, plus read access to the table.
///
/// Cheap to clone; all clones feed the same writer.
#[derive(Clone)]
pub struct PositionLog {
    tx: mpsc::Sender<WriterCommand>,
    repo: PositionLogRepository,
}

impl PositionLog {
    /// Spawns the writer task and returns the log handle alongside the
    /// task's join handle.
    #[must_use]
    pub fn spawn(repo: PositionLogRepository, config: &PositionLogConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let task = tokio::spawn(run_writer(
            rx,
            repo.clone(),
            config.max_buffer,
            std::time::Duration::from_secs(config.flush_interval_secs),
        ));
        (Self { tx, repo }, task)
    }

    /// Buffers records for the next flush.
    ///
    /// # Errors
    /// Returns an error if the writer task is no longer running.
    pub async fn write(&self, records: Vec<PositionRecord>) -> Result<()> {
        self.tx
            .send(WriterCommand::Write(records))
            .await
            .map_err(|_| anyhow!("position log writer is not running"))
    }

    /// Flushes the buffer and waits until the flush completed.
    ///
    /// # Errors
    /// Returns an error if the writer task is no longer running.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(ack_tx))
            .await
            .map_err(|_| anyhow!("position log writer is not running"))?;
        ack_rx
            .await
            .map_err(|_| anyhow!("position log writer stopped before acknowledging flush"))
    }

    /// Latest stored row per conid.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    pub async fn read_latest(&self) -> Result<Vec<PositionRecord>> {
        self.repo.latest_rows().await
    }

    /// Latest stored row per conid for one symbol.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    pub async fn read_latest_for_symbol(&self, symbol: &str) -> Result<Vec<PositionRecord>> {
        self.repo.latest_rows_for_symbol(symbol).await
    }

    /// Stored history for one conid between two microsecond timestamps.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    pub async fn read_conid_range(
        &self,
        conid: Conid,
        start_us: i64,
        end_us: i64,
    ) -> Result<Vec<PositionRecord>> {
        self.repo.fetch_conid_range(conid, start_us, end_us).await
    }

    /// Stored history for one symbol between two microsecond timestamps.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    pub async fn read_symbol_range(
        &self,
        symbol: &str,
        start_us: i64,
        end_us: i64,
    ) -> Result<Vec<PositionRecord>> {
        self.repo.fetch_symbol_range(symbol, start_us, end_us).await
    }

    /// Total stored rows.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    pub async fn count(&self) -> Result<i64> {
        self.repo.count().await
    }
}

/// Streams every position update into the log.
pub struct PositionLogHandler {
    log: PositionLog,
}

impl PositionLogHandler {
    #[must_use]
    pub fn new(log: PositionLog) -> Self {
        Self { log }
    }
}

#[async_trait::async_trait]
impl PositionHandler for PositionLogHandler {
    async fn on_position_update(&self, update: &PositionUpdate) -> Result<()> {
        self.log.write(vec![PositionRecord::from_update(update)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use possync_core::types::{BrokerPosition, OptionRight};
    use possync_data::Database;

    fn record(conid: Conid, quantity: f64, timestamp_us: i64) -> PositionRecord {
        PositionRecord {
            conid,
            symbol: "NVDA".to_string(),
            right: "C".to_string(),
            strike: 140.0,
            expiry: "20260320".to_string(),
            quantity,
            market_price: 4.2,
            market_value: quantity * 420.0,
            average_cost: 390.0,
            unrealized_pnl: quantity * 30.0,
            timestamp_us,
            date: "2026-08-25".to_string(),
        }
    }

    async fn test_log(config: &PositionLogConfig) -> (PositionLog, JoinHandle<()>) {
        let db = Database::new_in_memory().await.unwrap();
        let repo = PositionLogRepository::new(db.pool().clone());
        PositionLog::spawn(repo, config)
    }

    fn slow_flush_config() -> PositionLogConfig {
        PositionLogConfig {
            max_buffer: 100,
            flush_interval_secs: 3600,
            channel_capacity: 64,
        }
    }

    #[test]
    fn test_dedupe_newest_keeps_latest_per_conid() {
        let deduped = dedupe_newest(vec![
            record(1, 5.0, 100),
            record(1, 7.0, 300),
            record(1, 6.0, 200),
            record(2, 1.0, 50),
        ]);

        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].conid, 1);
        assert_eq!(deduped[0].timestamp_us, 300);
        assert_eq!(deduped[1].conid, 2);
    }

    #[test]
    fn test_dedupe_newest_tie_keeps_later_arrival() {
        let deduped = dedupe_newest(vec![record(1, 5.0, 100), record(1, 9.0, 100)]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].quantity, 9.0);
    }

    #[test]
    fn test_filter_newer_is_strict() {
        let stored = vec![record(1, 5.0, 200)];

        // Equal timestamp: already stored, dropped.
        assert!(filter_newer(vec![record(1, 5.0, 200)], &stored).is_empty());
        // Older: dropped.
        assert!(filter_newer(vec![record(1, 4.0, 150)], &stored).is_empty());
        // Strictly newer: kept.
        assert_eq!(filter_newer(vec![record(1, 6.0, 201)], &stored).len(), 1);
        // Unknown conid: kept.
        assert_eq!(filter_newer(vec![record(2, 1.0, 10)], &stored).len(), 1);
    }

    #[tokio::test]
    async fn test_flush_barrier_writes_buffer() {
        let (log, task) = test_log(&slow_flush_config()).await;

        log.write(vec![record(1, 5.0, 100), record(2, 3.0, 200)])
            .await
            .unwrap();
        assert_eq!(log.count().await.unwrap(), 0);

        log.flush().await.unwrap();
        assert_eq!(log.count().await.unwrap(), 2);
        task.abort();
    }

    #[tokio::test]
    async fn test_size_cap_triggers_flush() {
        let config = PositionLogConfig {
            max_buffer: 2,
            flush_interval_secs: 3600,
            channel_capacity: 64,
        };
        let (log, task) = test_log(&config).await;

        log.write(vec![record(1, 5.0, 100)]).await.unwrap();
        log.write(vec![record(2, 3.0, 200)]).await.unwrap();

        // The second write crosses the cap; wait for the writer to land it.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if log.count().await.unwrap() == 2 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "size flush never happened");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        task.abort();
    }

    #[tokio::test]
    async fn test_replayed_and_stale_updates_are_dropped() {
        let (log, task) = test_log(&slow_flush_config()).await;

        log.write(vec![record(1, 7.0, 300)]).await.unwrap();
        log.flush().await.unwrap();

        // Older and equal observations arriving later change nothing.
        log.write(vec![record(1, 5.0, 200), record(1, 7.0, 300)])
            .await
            .unwrap();
        log.flush().await.unwrap();

        assert_eq!(log.count().await.unwrap(), 1);
        let latest = log.read_latest().await.unwrap();
        assert_eq!(latest[0].quantity, 7.0);
        assert_eq!(latest[0].timestamp_us, 300);
        task.abort();
    }

    #[tokio::test]
    async fn test_mixed_batch_drops_stale_rows_only() {
        let (log, task) = test_log(&slow_flush_config()).await;

        // Two conids already stored, only one of them replayed below.
        log.write(vec![record(1, 7.0, 300), record(9, 2.0, 400)])
            .await
            .unwrap();
        log.flush().await.unwrap();

        // Stale replay for conid 1 mixed with a first observation of conid 2.
        log.write(vec![record(1, 5.0, 200), record(2, 1.0, 100)])
            .await
            .unwrap();
        log.flush().await.unwrap();

        assert_eq!(log.count().await.unwrap(), 3);
        let latest = log.read_latest().await.unwrap();
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].quantity, 7.0);
        assert_eq!(latest[1].quantity, 1.0);
        assert_eq!(latest[2].quantity, 2.0);
        task.abort();
    }

    #[tokio::test]
    async fn test_in_batch_dedupe_writes_one_row() {
        let (log, task) = test_log(&slow_flush_config()).await;

        log.write(vec![
            record(1, 5.0, 100),
            record(1, 6.0, 200),
            record(1, 7.0, 300),
        ])
        .await
        .unwrap();
        log.flush().await.unwrap();

        assert_eq!(log.count().await.unwrap(), 1);
        assert_eq!(log.read_latest().await.unwrap()[0].timestamp_us, 300);
        task.abort();
    }

    #[tokio::test]
    async fn test_append_only_history_grows() {
        let (log, task) = test_log(&slow_flush_config()).await;

        log.write(vec![record(1, 5.0, 100)]).await.unwrap();
        log.flush().await.unwrap();
        log.write(vec![record(1, 6.0, 200)]).await.unwrap();
        log.flush().await.unwrap();

        // Two generations of the same conid, both retained.
        assert_eq!(log.count().await.unwrap(), 2);
        let history = log.read_conid_range(1, 0, 1_000).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].timestamp_us, 100);
        assert_eq!(history[1].timestamp_us, 200);

        let latest = log.read_latest().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].timestamp_us, 200);
        task.abort();
    }

    #[tokio::test]
    async fn test_handler_feeds_log() {
        let (log, task) = test_log(&slow_flush_config()).await;
        let handler = PositionLogHandler::new(log.clone());

        let position = BrokerPosition::new(1001, "NVDA", OptionRight::Call, 140.0, "20260320", 5.0);
        let update = PositionUpdate {
            position,
            timestamp: Utc.with_ymd_and_hms(2026, 8, 25, 15, 0, 0).unwrap(),
        };
        handler.on_position_update(&update).await.unwrap();
        log.flush().await.unwrap();

        let latest = log.read_latest().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].conid, 1001);
        assert_eq!(latest[0].timestamp_us, update.timestamp.timestamp_micros());
        task.abort();
    }

    #[tokio::test]
    async fn test_writer_exits_with_final_flush_when_handles_drop() {
        let db = Database::new_in_memory().await.unwrap();
        let repo = PositionLogRepository::new(db.pool().clone());
        let (log, task) = PositionLog::spawn(repo.clone(), &slow_flush_config());

        log.write(vec![record(1, 5.0, 100)]).await.unwrap();
        drop(log);

        // Channel closed: the writer flushes what it holds and returns.
        task.await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}
