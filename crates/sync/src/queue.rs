//! Durable work queue for position resolution requests.
//!
//! Dispatch is exactly-once per row: candidates are claimed through guarded
//! PENDING -> PROCESSING updates inside one transaction, and a local lock
//! keeps concurrent dispatchers from racing over the same candidate scan.
//! FAILED is terminal; nothing here retries a failed row automatically.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use possync_core::types::{Conid, QueueStatus};
use possync_data::{QueueRepository, QueuedPositionRecord};

/// Orders candidates by age and keeps one request per conid.
///
/// When the same contract was enqueued more than once, the earliest request
/// rides this batch and the later duplicates stay PENDING for a later one.
fn select_batch(
    mut pending: Vec<QueuedPositionRecord>,
    limit: usize,
) -> Vec<QueuedPositionRecord> {
    pending.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.request_id.cmp(&b.request_id))
    });
    let mut seen = HashSet::new();
    pending.retain(|r| seen.insert(r.conid));
    pending.truncate(limit);
    pending
}

/// Queue facade used by producers (synchronizer) and the batch worker.
pub struct WorkQueue {
    repo: QueueRepository,
    /// Serializes the scan-then-claim dispatch step.
    dispatch_lock: Mutex<()>,
}

impl WorkQueue {
    /// Creates a queue over the given repository.
    #[must_use]
    pub fn new(repo: QueueRepository) -> Self {
        Self {
            repo,
            dispatch_lock: Mutex::new(()),
        }
    }

    /// Enqueues a resolution request. Returns the generated request id.
    ///
    /// Duplicate conids are allowed; dispatch collapses them per batch.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn insert(&self, conid: Conid, symbol: &str, priority: i64) -> Result<String> {
        let request_id = self.repo.insert(conid, symbol, priority).await?;
        debug!(conid, priority, request_id = %request_id, "enqueued position request");
        Ok(request_id)
    }

    /// Claims up to `limit` PENDING rows of one priority for processing.
    ///
    /// Returned records are already PROCESSING. A row lost to a concurrent
    /// dispatcher is silently dropped from the batch rather than dispatched
    /// twice.
    ///
    /// # Errors
    /// Returns an error if the scan or claim fails.
    pub async fn get_batch(
        &self,
        priority: i64,
        limit: usize,
    ) -> Result<Vec<QueuedPositionRecord>> {
        let _guard = self.dispatch_lock.lock().await;

        let pending = self.repo.fetch_pending(priority).await?;
        let mut batch = select_batch(pending, limit);
        if batch.is_empty() {
            return Ok(batch);
        }

        let ids: Vec<String> = batch.iter().map(|r| r.request_id.clone()).collect();
        let claimed: HashSet<String> = self
            .repo
            .mark_processing(&ids, Utc::now())
            .await?
            .into_iter()
            .collect();

        batch.retain(|r| claimed.contains(&r.request_id));
        for record in &mut batch {
            record.status = QueueStatus::Processing.as_str().to_string();
        }

        debug!(claimed = batch.len(), priority, "dispatched queue batch");
        Ok(batch)
    }

    /// Resolves claimed rows as SUCCESS. Returns the number updated.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn mark_success(&self, request_ids: &[String]) -> Result<u64> {
        self.repo.mark_success(request_ids, Utc::now()).await
    }

    /// Resolves one claimed row as FAILED with an error message.
    ///
    /// FAILED rows stay failed; re-resolving a contract takes a new request.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn mark_failed(&self, request_id: &str, error_message: &str) -> Result<u64> {
        self.repo.mark_failed(request_id, error_message, Utc::now()).await
    }

    /// Retires every PENDING row for `conid` as FAILED with a reason.
    ///
    /// The queue path owns a conid only while it is inactive; when the conid
    /// moves to the streaming path its open requests are superseded here.
    /// PROCESSING rows are left for the dispatcher that claimed them.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn cancel_pending(&self, conid: Conid, reason: &str) -> Result<u64> {
        let cancelled = self.repo.cancel_pending(conid, reason, Utc::now()).await?;
        if cancelled > 0 {
            debug!(conid, cancelled, "superseded pending queue rows");
        }
        Ok(cancelled)
    }

    /// Returns PROCESSING rows older than `older_than` to PENDING.
    ///
    /// Recovery for rows orphaned by a crash mid-batch. Only runs when the
    /// operator opted in via configuration; see the worker.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn requeue_stuck(&self, older_than: Duration) -> Result<u64> {
        let now = Utc::now();
        // An out-of-range bound clamps to "nothing is old enough".
        let cutoff = now
            .checked_sub_signed(older_than)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let requeued = self.repo.requeue_stuck(cutoff, now).await?;
        if requeued > 0 {
            warn!(requeued, "returned stuck PROCESSING rows to PENDING");
        }
        Ok(requeued)
    }

    /// Per-status row counts for operator visibility.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn counts_by_status(&self) -> Result<Vec<(String, i64)>> {
        self.repo.counts_by_status().await
    }

    /// One row by request id.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get(&self, request_id: &str) -> Result<Option<QueuedPositionRecord>> {
        self.repo.get(request_id).await
    }
}
