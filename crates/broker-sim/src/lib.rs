//! In-process brokerage simulator.
//!
//! Implements [`Brokerage`] over a mutable in-memory position book. Used by
//! the paper-trading CLI profile and by integration tests that need to drive
//! connect failures, snapshot failures, and market data pushes without a
//! gateway.
//!
//! # Safety
//!
//! This handler makes **zero API calls** to any brokerage. All state lives
//! in process memory.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use possync_core::traits::Brokerage;
use possync_core::types::{BrokerPosition, Conid, PositionUpdate};

/// Capacity of the simulated market data channel.
const UPDATE_CHANNEL_CAPACITY: usize = 1000;

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    /// Position book keyed by conid. This is what `fetch_positions` snapshots.
    book: HashMap<Conid, BrokerPosition>,
    /// Conids with an active market data subscription.
    subscriptions: HashSet<Conid>,
    /// Conids whose subscribe calls are rigged to fail.
    failing_subscribes: HashSet<Conid>,
    fail_connect: bool,
    fail_fetch: bool,
    fetch_calls: u64,
    subscribe_calls: u64,
}

// =============================================================================
// Simulator
// =============================================================================

/// Simulated brokerage backed by an in-memory position book.
///
/// # Thread Safety
///
/// The simulator is thread-safe and can be shared across tasks behind an
/// `Arc`. Internal state is protected by a read-write lock that is never
/// held across an await point.
pub struct SimBrokerage {
    state: RwLock<SimState>,
    update_tx: broadcast::Sender<PositionUpdate>,
}

impl std::fmt::Debug for SimBrokerage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimBrokerage")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for SimBrokerage {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBrokerage {
    /// Creates a simulator with an empty book and no rigged failures.
    #[must_use]
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(SimState::default()),
            update_tx,
        }
    }

    /// Replaces the whole position book.
    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        let mut state = self.state.write();
        state.book = positions.into_iter().map(|p| (p.conid, p)).collect();
    }

    /// Inserts or replaces one book entry.
    pub fn upsert_position(&self, position: BrokerPosition) {
        self.state.write().book.insert(position.conid, position);
    }

    /// Removes one book entry. Returns the removed position, if any.
    pub fn remove_position(&self, conid: Conid) -> Option<BrokerPosition> {
        self.state.write().book.remove(&conid)
    }

    /// Rigs subscribe calls for `conid` to fail.
    pub fn fail_subscribe_for(&self, conid: Conid) {
        self.state.write().failing_subscribes.insert(conid);
    }

    /// Rigs all snapshot fetches to fail (or clears the rig).
    pub fn set_fetch_failure(&self, fail: bool) {
        self.state.write().fail_fetch = fail;
    }

    /// Rigs connect calls to fail (or clears the rig).
    pub fn set_connect_failure(&self, fail: bool) {
        self.state.write().fail_connect = fail;
    }

    /// Pushes a market data update for a subscribed contract.
    ///
    /// Returns `false` (and drops the update) when the contract has no
    /// active subscription, mirroring a gateway that only streams what was
    /// requested.
    pub fn push_update(&self, update: PositionUpdate) -> bool {
        let conid = update.position.conid;
        if !self.state.read().subscriptions.contains(&conid) {
            debug!(conid, "dropping update for unsubscribed contract");
            return false;
        }
        // Send only fails when there are no receivers; the update is still
        // considered delivered from the gateway's point of view.
        let _ = self.update_tx.send(update);
        true
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.read().subscriptions.len()
    }

    /// Whether `conid` has an active subscription.
    #[must_use]
    pub fn is_subscribed(&self, conid: Conid) -> bool {
        self.state.read().subscriptions.contains(&conid)
    }

    /// Number of snapshot fetches attempted so far.
    #[must_use]
    pub fn fetch_calls(&self) -> u64 {
        self.state.read().fetch_calls
    }

    /// Number of subscribe calls attempted so far.
    #[must_use]
    pub fn subscribe_calls(&self) -> u64 {
        self.state.read().subscribe_calls
    }
}

#[async_trait]
impl Brokerage for SimBrokerage {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.fail_connect {
            bail!("simulated connect failure");
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.write();
        state.connected = false;
        state.subscriptions.clear();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    async fn fetch_positions(&self) -> Result<Vec<BrokerPosition>> {
        let mut state = self.state.write();
        state.fetch_calls += 1;
        if !state.connected {
            bail!("not connected");
        }
        if state.fail_fetch {
            bail!("simulated snapshot failure");
        }
        let mut positions: Vec<BrokerPosition> = state.book.values().cloned().collect();
        positions.sort_by_key(|p| p.conid);
        Ok(positions)
    }

    async fn subscribe_market_data(&self, position: &BrokerPosition) -> Result<()> {
        let mut state = self.state.write();
        state.subscribe_calls += 1;
        if !state.connected {
            bail!("not connected");
        }
        if state.failing_subscribes.contains(&position.conid) {
            bail!("simulated subscribe failure for conid {}", position.conid);
        }
        state.subscriptions.insert(position.conid);
        Ok(())
    }

    async fn unsubscribe_market_data(&self, conid: Conid) -> Result<()> {
        self.state.write().subscriptions.remove(&conid);
        Ok(())
    }

    fn updates(&self) -> broadcast::Receiver<PositionUpdate> {
        self.update_tx.subscribe()
    }
}
