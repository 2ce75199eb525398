//! Position synchronizer.
//!
//! On start, takes one account snapshot and routes every open position:
//! contracts in the active registry get a streaming market data slot (up to
//! the configured budget), everything else is enqueued for the batch worker.
//! Streamed updates are re-broadcast to registered handlers, each on its own
//! forwarding task so a slow handler never stalls ingestion or its peers.
//!
//! A session carries at most one synchronizer. The claim is taken at
//! construction and released when the synchronizer is dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use possync_core::config::SynchronizerConfig;
use possync_core::traits::PositionHandler;
use possync_core::types::{Conid, PositionUpdate, PRIORITY_LOW};

use crate::queue::WorkQueue;
use crate::registry::ContractRegistry;
use crate::session::{BrokerageSession, SessionError};

/// Outcome of the startup snapshot routing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StartReport {
    /// Positions that received a streaming subscription.
    pub streamed: usize,
    /// Positions handed to the work queue.
    pub queued: usize,
    /// Positions that could not be routed (subscribe error, slot budget
    /// exhausted, or enqueue error).
    pub failed: usize,
}

struct SyncState {
    running: bool,
    /// Conids with a live streaming subscription.
    tracked: HashSet<Conid>,
    fan_tx: Option<broadcast::Sender<PositionUpdate>>,
    ingest_task: Option<JoinHandle<()>>,
    forward_tasks: Vec<JoinHandle<()>>,
}

/// Routes snapshot positions and fans streamed updates out to handlers.
pub struct PositionSynchronizer {
    session: Arc<BrokerageSession>,
    registry: ContractRegistry,
    queue: Arc<WorkQueue>,
    config: SynchronizerConfig,
    handlers: Mutex<Vec<Arc<dyn PositionHandler>>>,
    state: Mutex<SyncState>,
    updates_ingested: Arc<AtomicU64>,
}

impl PositionSynchronizer {
    /// Claims the session and builds an idle synchronizer.
    ///
    /// # Errors
    /// Returns [`SessionError::SynchronizerAttached`] when the session
    /// already carries a synchronizer.
    pub fn new(
        session: Arc<BrokerageSession>,
        registry: ContractRegistry,
        queue: Arc<WorkQueue>,
        config: SynchronizerConfig,
    ) -> Result<Self, SessionError> {
        session.attach_synchronizer()?;
        Ok(Self {
            session,
            registry,
            queue,
            config,
            handlers: Mutex::new(Vec::new()),
            state: Mutex::new(SyncState {
                running: false,
                tracked: HashSet::new(),
                fan_tx: None,
                ingest_task: None,
                forward_tasks: Vec::new(),
            }),
            updates_ingested: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Registers a handler for streamed updates.
    ///
    /// Handlers registered while running take effect on the next start.
    pub async fn register_handler(&self, handler: Arc<dyn PositionHandler>) {
        if self.state.lock().await.running {
            warn!("handler registered while running, takes effect on next start");
        }
        self.handlers.lock().await.push(handler);
    }

    /// Connects, snapshots the account, and routes every open position.
    ///
    /// # Errors
    /// Returns an error when already running or when the connect or
    /// snapshot fails. Per-position routing problems are counted in the
    /// report instead of failing the start.
    pub async fn start(&self) -> Result<StartReport> {
        let mut state = self.state.lock().await;
        if state.running {
            bail!("synchronizer is already running");
        }

        self.session.ensure_connected().await?;
        let positions = self.session.fetch_open_positions().await?;

        // Wire ingestion before the first subscribe so no update can slip
        // between the subscription and the listener.
        let (fan_tx, _) = broadcast::channel(self.config.update_channel_capacity);
        let handlers = self.handlers.lock().await.clone();
        for handler in handlers {
            state
                .forward_tasks
                .push(tokio::spawn(forward_updates(fan_tx.subscribe(), handler)));
        }
        state.ingest_task = Some(tokio::spawn(ingest_updates(
            self.session.updates(),
            fan_tx.clone(),
            Arc::clone(&self.updates_ingested),
        )));

        let mut report = StartReport::default();
        for position in positions {
            if self.registry.is_active(position.conid).await {
                // An active conid owns no queue rows. Stale PENDING rows can
                // survive a crashed retire or an out-of-order enqueue; clear
                // them before the batch worker can dispatch one.
                match self
                    .queue
                    .cancel_pending(position.conid, "superseded by active contract")
                    .await
                {
                    Ok(0) => {}
                    Ok(cancelled) => {
                        info!(conid = position.conid, cancelled, "retired stale queue rows for active contract");
                    }
                    Err(e) => {
                        warn!(conid = position.conid, error = %e, "failed to retire stale queue rows");
                    }
                }
                if state.tracked.len() >= self.config.max_streaming_slots {
                    warn!(
                        conid = position.conid,
                        budget = self.config.max_streaming_slots,
                        "streaming slot budget exhausted"
                    );
                    report.failed += 1;
                    continue;
                }
                match self.session.subscribe_market_data(&position).await {
                    Ok(()) => {
                        state.tracked.insert(position.conid);
                        report.streamed += 1;
                    }
                    Err(e) => {
                        warn!(conid = position.conid, error = %e, "market data subscribe failed");
                        report.failed += 1;
                    }
                }
            } else {
                match self
                    .queue
                    .insert(position.conid, &position.symbol, PRIORITY_LOW)
                    .await
                {
                    Ok(_) => report.queued += 1,
                    Err(e) => {
                        error!(conid = position.conid, error = %e, "failed to enqueue position");
                        report.failed += 1;
                    }
                }
            }
        }

        state.fan_tx = Some(fan_tx);
        state.running = true;
        info!(
            streamed = report.streamed,
            queued = report.queued,
            failed = report.failed,
            "position synchronizer started"
        );
        Ok(report)
    }

    /// Unsubscribes everything and winds down the update pipeline.
    ///
    /// Idempotent; unsubscribe errors are logged and do not stop the
    /// teardown. The synchronizer can be started again afterwards.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }

        for conid in state.tracked.drain() {
            if let Err(e) = self.session.unsubscribe_market_data(conid).await {
                warn!(conid, error = %e, "unsubscribe failed during stop");
            }
        }

        if let Some(task) = state.ingest_task.take() {
            task.abort();
        }
        // Dropping the fan sender closes every forwarding receiver.
        state.fan_tx = None;
        for task in state.forward_tasks.drain(..) {
            let _ = task.await;
        }

        state.running = false;
        info!("position synchronizer stopped");
    }

    /// Whether start has completed and stop has not.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Number of contracts with a live streaming subscription.
    pub async fn tracked_count(&self) -> usize {
        self.state.lock().await.tracked.len()
    }

    /// Total updates pulled off the session stream since construction.
    #[must_use]
    pub fn updates_ingested(&self) -> u64 {
        self.updates_ingested.load(Ordering::Relaxed)
    }
}

impl Drop for PositionSynchronizer {
    fn drop(&mut self) {
        self.session.detach_synchronizer();
    }
}

async fn ingest_updates(
    mut rx: broadcast::Receiver<PositionUpdate>,
    fan_tx: broadcast::Sender<PositionUpdate>,
    ingested: Arc<AtomicU64>,
) {
    loop {
        match rx.recv().await {
            Ok(update) => {
                ingested.fetch_add(1, Ordering::Relaxed);
                // No receivers just means no handlers are registered.
                let _ = fan_tx.send(update);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "update ingestion lagged, dropping updates");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn forward_updates(
    mut rx: broadcast::Receiver<PositionUpdate>,
    handler: Arc<dyn PositionHandler>,
) {
    loop {
        match rx.recv().await {
            Ok(update) => {
                if let Err(e) = handler.on_position_update(&update).await {
                    warn!(conid = update.position.conid, error = %e, "position handler failed");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "position handler lagged, dropping updates");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use possync_broker_sim::SimBrokerage;
    use possync_core::types::{BrokerPosition, OptionRight};
    use possync_data::{ContractRepository, Database, QueueRepository};

    use crate::registry::NewActiveContract;

    struct Harness {
        sim: Arc<SimBrokerage>,
        session: Arc<BrokerageSession>,
        registry: ContractRegistry,
        queue: Arc<WorkQueue>,
    }

    async fn harness() -> Harness {
        let db = Database::new_in_memory().await.unwrap();
        let sim = Arc::new(SimBrokerage::new());
        let session = Arc::new(BrokerageSession::new(
            Arc::clone(&sim) as Arc<dyn possync_core::traits::Brokerage>
        ));
        let registry = ContractRegistry::new(
            ContractRepository::new(db.pool().clone()),
            QueueRepository::new(db.pool().clone()),
        );
        let queue = Arc::new(WorkQueue::new(QueueRepository::new(db.pool().clone())));
        Harness {
            sim,
            session,
            registry,
            queue,
        }
    }

    fn synchronizer_config(slots: usize) -> SynchronizerConfig {
        SynchronizerConfig {
            max_streaming_slots: slots,
            update_channel_capacity: 64,
        }
    }

    fn position(conid: Conid, quantity: f64) -> BrokerPosition {
        BrokerPosition::new(conid, "NVDA", OptionRight::Call, 140.0, "20260320", quantity)
    }

    fn contract(conid: Conid) -> NewActiveContract {
        NewActiveContract {
            conid,
            symbol: "NVDA".to_string(),
            right: OptionRight::Call,
            strike: 140.0,
            expiry: "20260320".to_string(),
            strategy_id: 1,
        }
    }

    struct RecordingHandler {
        seen: std::sync::Mutex<Vec<Conid>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Conid> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PositionHandler for RecordingHandler {
        async fn on_position_update(&self, update: &PositionUpdate) -> Result<()> {
            self.seen.lock().unwrap().push(update.position.conid);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_routes_active_and_inactive() {
        let h = harness().await;
        h.registry.add_active(contract(100)).await;
        h.registry.add_active(contract(101)).await;
        h.sim
            .set_positions(vec![position(100, 1.0), position(101, 2.0), position(200, 3.0)]);

        let sync = PositionSynchronizer::new(
            Arc::clone(&h.session),
            h.registry.clone(),
            Arc::clone(&h.queue),
            synchronizer_config(90),
        )
        .unwrap();

        let report = sync.start().await.unwrap();
        assert_eq!(report.streamed, 2);
        assert_eq!(report.queued, 1);
        assert_eq!(report.failed, 0);

        assert!(h.sim.is_subscribed(100));
        assert!(h.sim.is_subscribed(101));
        assert!(!h.sim.is_subscribed(200));
        assert_eq!(sync.tracked_count().await, 2);

        let batch = h.queue.get_batch(PRIORITY_LOW, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].conid, 200);
    }

    #[tokio::test]
    async fn test_start_retires_stale_queue_rows_for_active_contracts() {
        let h = harness().await;
        h.registry.add_active(contract(100)).await;
        // A leftover request enqueued after activation, as a restart would
        // find it.
        let stale = h.queue.insert(100, "NVDA", PRIORITY_LOW).await.unwrap();
        h.sim.set_positions(vec![position(100, 1.0)]);

        let sync = PositionSynchronizer::new(
            Arc::clone(&h.session),
            h.registry.clone(),
            Arc::clone(&h.queue),
            synchronizer_config(90),
        )
        .unwrap();

        let report = sync.start().await.unwrap();
        assert_eq!(report.streamed, 1);
        assert_eq!(report.queued, 0);
        assert!(h.sim.is_subscribed(100));

        // The streamed conid no longer has a dispatchable queue row.
        let row = h.queue.get(&stale).await.unwrap().unwrap();
        assert_eq!(row.queue_status(), Some(possync_core::types::QueueStatus::Failed));
        assert!(h.queue.get_batch(PRIORITY_LOW, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slot_budget_failures_do_not_queue() {
        let h = harness().await;
        h.registry.add_active(contract(100)).await;
        h.registry.add_active(contract(101)).await;
        h.sim
            .set_positions(vec![position(100, 1.0), position(101, 2.0)]);

        let sync = PositionSynchronizer::new(
            Arc::clone(&h.session),
            h.registry.clone(),
            Arc::clone(&h.queue),
            synchronizer_config(1),
        )
        .unwrap();

        let report = sync.start().await.unwrap();
        assert_eq!(report.streamed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.queued, 0);
        assert!(h.queue.get_batch(PRIORITY_LOW, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_counted() {
        let h = harness().await;
        h.registry.add_active(contract(100)).await;
        h.registry.add_active(contract(101)).await;
        h.sim
            .set_positions(vec![position(100, 1.0), position(101, 2.0)]);
        h.sim.fail_subscribe_for(100);

        let sync = PositionSynchronizer::new(
            Arc::clone(&h.session),
            h.registry.clone(),
            Arc::clone(&h.queue),
            synchronizer_config(90),
        )
        .unwrap();

        let report = sync.start().await.unwrap();
        assert_eq!(report.streamed, 1);
        assert_eq!(report.failed, 1);
        assert!(h.sim.is_subscribed(101));
    }

    #[tokio::test]
    async fn test_session_accepts_one_synchronizer_at_a_time() {
        let h = harness().await;

        let first = PositionSynchronizer::new(
            Arc::clone(&h.session),
            h.registry.clone(),
            Arc::clone(&h.queue),
            synchronizer_config(90),
        )
        .unwrap();

        assert!(matches!(
            PositionSynchronizer::new(
                Arc::clone(&h.session),
                h.registry.clone(),
                Arc::clone(&h.queue),
                synchronizer_config(90),
            ),
            Err(SessionError::SynchronizerAttached)
        ));

        // Dropping the first releases the claim.
        drop(first);
        PositionSynchronizer::new(
            Arc::clone(&h.session),
            h.registry.clone(),
            Arc::clone(&h.queue),
            synchronizer_config(90),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let h = harness().await;
        let sync = PositionSynchronizer::new(
            Arc::clone(&h.session),
            h.registry.clone(),
            Arc::clone(&h.queue),
            synchronizer_config(90),
        )
        .unwrap();

        sync.start().await.unwrap();
        assert!(sync.start().await.is_err());
    }

    #[tokio::test]
    async fn test_updates_reach_registered_handlers() {
        let h = harness().await;
        h.registry.add_active(contract(100)).await;
        h.sim.set_positions(vec![position(100, 1.0)]);

        let sync = PositionSynchronizer::new(
            Arc::clone(&h.session),
            h.registry.clone(),
            Arc::clone(&h.queue),
            synchronizer_config(90),
        )
        .unwrap();
        let handler_a = RecordingHandler::new();
        let handler_b = RecordingHandler::new();
        sync.register_handler(handler_a.clone()).await;
        sync.register_handler(handler_b.clone()).await;

        sync.start().await.unwrap();
        assert!(h.sim.push_update(PositionUpdate::now(position(100, 1.5))));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while handler_a.seen().is_empty() || handler_b.seen().is_empty() {
            assert!(std::time::Instant::now() < deadline, "update never reached handlers");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(handler_a.seen(), vec![100]);
        assert_eq!(handler_b.seen(), vec![100]);
        assert_eq!(sync.updates_ingested(), 1);
    }

    #[tokio::test]
    async fn test_stop_unsubscribes_and_allows_restart() {
        let h = harness().await;
        h.registry.add_active(contract(100)).await;
        h.sim.set_positions(vec![position(100, 1.0)]);

        let sync = PositionSynchronizer::new(
            Arc::clone(&h.session),
            h.registry.clone(),
            Arc::clone(&h.queue),
            synchronizer_config(90),
        )
        .unwrap();

        sync.start().await.unwrap();
        assert_eq!(h.sim.subscription_count(), 1);

        sync.stop().await;
        assert!(!sync.is_running().await);
        assert_eq!(h.sim.subscription_count(), 0);
        // Second stop is a no-op.
        sync.stop().await;

        let report = sync.start().await.unwrap();
        assert_eq!(report.streamed, 1);
    }
}
