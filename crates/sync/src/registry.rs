//! Active contract registry.
//!
//! Two tiers: an in-memory map answers every routing lookup, and the
//! `active_contracts` history table records each add and soft remove. The
//! in-memory state is always exactly the fold of the history rows, so a
//! restart rebuilds the same set the process had before it stopped.
//!
//! Memory is authoritative for routing. History writes are best-effort; a
//! failed write is logged and never unwinds the in-memory update.
//!
//! An active contract belongs to the streaming path, never the queue path.
//! Activating a conid retires any PENDING queue rows it still has, so the
//! two paths stay mutually exclusive.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use possync_core::types::{Conid, OptionRight};
use possync_data::{ActiveContractRecord, ContractRepository, QueueRepository};

/// A contract registration request from a strategy.
#[derive(Debug, Clone)]
pub struct NewActiveContract {
    pub conid: Conid,
    pub symbol: String,
    pub right: OptionRight,
    pub strike: f64,
    pub expiry: String,
    pub strategy_id: i64,
}

/// Replays history rows in id order into the current active set.
///
/// Each non-removed row starts a tenure for its conid; each removed row ends
/// one. Re-adds append a fresh row, so the live tenure is always the latest
/// row for its conid.
fn fold_contract_rows(rows: Vec<ActiveContractRecord>) -> HashMap<Conid, ActiveContractRecord> {
    let mut contracts = HashMap::new();
    for row in rows {
        if row.is_removed() {
            contracts.remove(&row.conid);
        } else {
            contracts.insert(row.conid, row);
        }
    }
    contracts
}

/// Registry of contracts that strategies currently care about.
#[derive(Clone)]
pub struct ContractRegistry {
    contracts: Arc<RwLock<HashMap<Conid, ActiveContractRecord>>>,
    repo: ContractRepository,
    queue: QueueRepository,
}

impl ContractRegistry {
    /// Creates an empty registry.
    ///
    /// The queue repository is needed to retire pending resolution requests
    /// when their conid becomes active.
    #[must_use]
    pub fn new(repo: ContractRepository, queue: QueueRepository) -> Self {
        Self {
            contracts: Arc::new(RwLock::new(HashMap::new())),
            repo,
            queue,
        }
    }

    /// Rebuilds the in-memory set from the history table.
    ///
    /// Returns the number of active contracts after the rebuild.
    ///
    /// # Errors
    /// Returns an error if the history rows cannot be read.
    pub async fn initialize(&self) -> Result<usize> {
        let rows = self.repo.fetch_all().await?;
        let folded = fold_contract_rows(rows);
        let count = folded.len();

        let mut contracts = self.contracts.write().await;
        *contracts = folded;
        info!(active = count, "contract registry initialized");
        Ok(count)
    }

    /// Whether `conid` is in the active set.
    pub async fn is_active(&self, conid: Conid) -> bool {
        self.contracts.read().await.contains_key(&conid)
    }

    /// The active record for `conid`, if present.
    pub async fn get(&self, conid: Conid) -> Option<ActiveContractRecord> {
        self.contracts.read().await.get(&conid).cloned()
    }

    /// All active contracts, ordered by conid.
    pub async fn get_all_active(&self) -> Vec<ActiveContractRecord> {
        let contracts = self.contracts.read().await;
        let mut records: Vec<ActiveContractRecord> = contracts.values().cloned().collect();
        records.sort_by_key(|r| r.conid);
        records
    }

    /// Number of active contracts.
    pub async fn active_count(&self) -> usize {
        self.contracts.read().await.len()
    }

    /// Adds a contract to the active set, replacing any existing tenure.
    ///
    /// The in-memory update always happens. History writes are best-effort:
    /// a re-add soft-removes the previous row first, and a failed insert
    /// leaves the record with id 0 until the next successful rebuild.
    ///
    /// Open PENDING queue rows for the conid are retired: the contract now
    /// belongs to the streaming path and must not be dispatched by the
    /// batch worker.
    pub async fn add_active(&self, contract: NewActiveContract) -> ActiveContractRecord {
        let mut contracts = self.contracts.write().await;
        let now = Utc::now();

        if contracts.contains_key(&contract.conid) {
            if let Err(e) = self.repo.mark_removed(contract.conid, now).await {
                warn!(conid = contract.conid, error = %e, "failed to close previous contract tenure");
            }
        }

        let mut record = ActiveContractRecord {
            id: 0,
            conid: contract.conid,
            symbol: contract.symbol.to_uppercase(),
            right: contract.right.to_string(),
            strike: contract.strike,
            expiry: contract.expiry,
            strategy_id: contract.strategy_id,
            added_at: now,
            removed_at: None,
        };

        match self.repo.insert(&record).await {
            Ok(id) => record.id = id,
            Err(e) => {
                warn!(conid = record.conid, error = %e, "failed to persist contract add, keeping in memory");
            }
        }

        match self
            .queue
            .cancel_pending(record.conid, "superseded by active contract", now)
            .await
        {
            Ok(0) => {}
            Ok(cancelled) => {
                info!(conid = record.conid, cancelled, "retired pending queue rows for activated contract");
            }
            Err(e) => {
                warn!(conid = record.conid, error = %e, "failed to retire pending queue rows");
            }
        }

        contracts.insert(record.conid, record.clone());
        info!(conid = record.conid, symbol = %record.symbol, "contract activated");
        record
    }

    /// Removes a contract from the active set.
    ///
    /// Returns `false` when the contract was not active. The history row is
    /// soft-removed; nothing is deleted.
    pub async fn remove_active(&self, conid: Conid) -> bool {
        let mut contracts = self.contracts.write().await;
        if contracts.remove(&conid).is_none() {
            return false;
        }

        if let Err(e) = self.repo.mark_removed(conid, Utc::now()).await {
            warn!(conid, error = %e, "failed to persist contract removal, removed from memory only");
        }
        info!(conid, "contract deactivated");
        true
    }
}
