//! Position queue repository.
//!
//! Status transitions are guarded updates: a row moves only out of the
//! expected prior status, so a lost race shows up as zero affected rows
//! instead of a silent overwrite.

use anyhow::Result;
use chrono::{DateTime, Utc};
use possync_core::types::{Conid, QueueStatus};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::QueuedPositionRecord;

/// Repository for queue operations.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    /// Creates a new repository instance.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a PENDING row and returns the generated request id.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn insert(&self, conid: Conid, symbol: &str, priority: i64) -> Result<String> {
        let request_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r"
            INSERT INTO position_queue
                (request_id, conid, symbol, priority, status, created_at, updated_at, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, NULL)
            ",
        )
        .bind(&request_id)
        .bind(conid)
        .bind(symbol)
        .bind(priority)
        .bind(QueueStatus::Pending.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(request_id)
    }

    /// PENDING rows for one priority, oldest first.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn fetch_pending(&self, priority: i64) -> Result<Vec<QueuedPositionRecord>> {
        let records = sqlx::query_as::<_, QueuedPositionRecord>(
            r"
            SELECT request_id, conid, symbol, priority, status, created_at,
                   updated_at, error_message
            FROM position_queue
            WHERE status = ?1 AND priority = ?2
            ORDER BY created_at ASC, request_id ASC
            ",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(priority)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Moves rows PENDING -> PROCESSING in one transaction.
    ///
    /// Returns the ids actually claimed. Rows no longer PENDING (already
    /// claimed or resolved) are skipped, never overwritten.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn mark_processing(
        &self,
        request_ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let mut claimed = Vec::with_capacity(request_ids.len());

        for request_id in request_ids {
            let result = sqlx::query(
                r"
                UPDATE position_queue
                SET status = ?2, updated_at = ?3
                WHERE request_id = ?1 AND status = ?4
                ",
            )
            .bind(request_id)
            .bind(QueueStatus::Processing.as_str())
            .bind(at)
            .bind(QueueStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                claimed.push(request_id.clone());
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    /// Moves PROCESSING rows to SUCCESS. Returns the number updated.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn mark_success(&self, request_ids: &[String], at: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for request_id in request_ids {
            let result = sqlx::query(
                r"
                UPDATE position_queue
                SET status = ?2, updated_at = ?3
                WHERE request_id = ?1 AND status = ?4
                ",
            )
            .bind(request_id)
            .bind(QueueStatus::Success.as_str())
            .bind(at)
            .bind(QueueStatus::Processing.as_str())
            .execute(&mut *tx)
            .await?;

            updated += result.rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }

    /// Moves one PROCESSING row to FAILED with an error message.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn mark_failed(
        &self,
        request_id: &str,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE position_queue
            SET status = ?2, updated_at = ?3, error_message = ?4
            WHERE request_id = ?1 AND status = ?5
            ",
        )
        .bind(request_id)
        .bind(QueueStatus::Failed.as_str())
        .bind(at)
        .bind(error_message)
        .bind(QueueStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Moves every PENDING row for `conid` to FAILED with a reason.
    ///
    /// Used when a conid leaves the queue path because it became an active,
    /// streamed contract. PROCESSING rows are left for their dispatcher.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn cancel_pending(
        &self,
        conid: Conid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE position_queue
            SET status = ?2, updated_at = ?3, error_message = ?4
            WHERE conid = ?1 AND status = ?5
            ",
        )
        .bind(conid)
        .bind(QueueStatus::Failed.as_str())
        .bind(at)
        .bind(reason)
        .bind(QueueStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Returns PROCESSING rows older than `cutoff` to PENDING.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn requeue_stuck(&self, cutoff: DateTime<Utc>, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE position_queue
            SET status = ?3, updated_at = ?2
            WHERE status = ?4 AND updated_at < ?1
            ",
        )
        .bind(cutoff)
        .bind(at)
        .bind(QueueStatus::Pending.as_str())
        .bind(QueueStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Per-status row counts.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn counts_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM position_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// One row by request id.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn get(&self, request_id: &str) -> Result<Option<QueuedPositionRecord>> {
        let record = sqlx::query_as::<_, QueuedPositionRecord>(
            r"
            SELECT request_id, conid, symbol, priority, status, created_at,
                   updated_at, error_message
            FROM position_queue
            WHERE request_id = ?1
            ",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use possync_core::types::{PRIORITY_HIGH, PRIORITY_LOW};

    async fn test_repo() -> QueueRepository {
        let db = Database::new_in_memory().await.unwrap();
        QueueRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_insert_generates_unique_ids() {
        let repo = test_repo().await;

        let id1 = repo.insert(100, "NVDA", PRIORITY_LOW).await.unwrap();
        let id2 = repo.insert(100, "NVDA", PRIORITY_LOW).await.unwrap();
        assert_ne!(id1, id2);

        let pending = repo.fetch_pending(PRIORITY_LOW).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(QueuedPositionRecord::is_pending));
    }

    #[tokio::test]
    async fn test_fetch_pending_filters_priority() {
        let repo = test_repo().await;

        repo.insert(1, "SPY", PRIORITY_HIGH).await.unwrap();
        repo.insert(2, "SPY", PRIORITY_LOW).await.unwrap();

        let high = repo.fetch_pending(PRIORITY_HIGH).await.unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].conid, 1);

        let low = repo.fetch_pending(PRIORITY_LOW).await.unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].conid, 2);
    }

    #[tokio::test]
    async fn test_mark_processing_claims_only_pending() {
        let repo = test_repo().await;

        let id = repo.insert(1, "SPY", PRIORITY_LOW).await.unwrap();
        let claimed = repo.mark_processing(&[id.clone()], Utc::now()).await.unwrap();
        assert_eq!(claimed, vec![id.clone()]);

        // Second claim sees no PENDING row.
        let claimed = repo.mark_processing(&[id.clone()], Utc::now()).await.unwrap();
        assert!(claimed.is_empty());

        let record = repo.get(&id).await.unwrap().unwrap();
        assert!(record.is_processing());
    }

    #[tokio::test]
    async fn test_terminal_transitions_guarded() {
        let repo = test_repo().await;

        let id = repo.insert(1, "SPY", PRIORITY_LOW).await.unwrap();

        // SUCCESS requires PROCESSING; a PENDING row is untouched.
        assert_eq!(repo.mark_success(&[id.clone()], Utc::now()).await.unwrap(), 0);

        repo.mark_processing(&[id.clone()], Utc::now()).await.unwrap();
        assert_eq!(repo.mark_success(&[id.clone()], Utc::now()).await.unwrap(), 1);

        // Terminal rows do not fail afterwards.
        assert_eq!(repo.mark_failed(&id, "late", Utc::now()).await.unwrap(), 0);

        let record = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(record.queue_status(), Some(QueueStatus::Success));
        assert_eq!(record.error_message, None);
    }

    #[tokio::test]
    async fn test_mark_failed_records_message() {
        let repo = test_repo().await;

        let id = repo.insert(1, "SPY", PRIORITY_LOW).await.unwrap();
        repo.mark_processing(&[id.clone()], Utc::now()).await.unwrap();
        assert_eq!(
            repo.mark_failed(&id, "position not in brokerage snapshot", Utc::now())
                .await
                .unwrap(),
            1
        );

        let record = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(record.queue_status(), Some(QueueStatus::Failed));
        assert_eq!(
            record.error_message.as_deref(),
            Some("position not in brokerage snapshot")
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_supersedes_only_pending_rows() {
        let repo = test_repo().await;

        let open = repo.insert(100, "NVDA", PRIORITY_LOW).await.unwrap();
        let claimed = repo.insert(100, "NVDA", PRIORITY_LOW).await.unwrap();
        let other = repo.insert(200, "SPY", PRIORITY_LOW).await.unwrap();
        repo.mark_processing(&[claimed.clone()], Utc::now())
            .await
            .unwrap();

        let cancelled = repo
            .cancel_pending(100, "superseded by active contract", Utc::now())
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let row = repo.get(&open).await.unwrap().unwrap();
        assert_eq!(row.queue_status(), Some(QueueStatus::Failed));
        assert_eq!(
            row.error_message.as_deref(),
            Some("superseded by active contract")
        );

        // The claimed row stays with its dispatcher, other conids untouched.
        assert!(repo.get(&claimed).await.unwrap().unwrap().is_processing());
        assert!(repo.get(&other).await.unwrap().unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_requeue_stuck_honors_cutoff() {
        let repo = test_repo().await;

        let id = repo.insert(1, "SPY", PRIORITY_LOW).await.unwrap();
        let claim_time = Utc::now() - chrono::Duration::minutes(10);
        repo.mark_processing(&[id.clone()], claim_time).await.unwrap();

        // Cutoff before the claim time: nothing to requeue.
        let early_cutoff = claim_time - chrono::Duration::minutes(5);
        assert_eq!(repo.requeue_stuck(early_cutoff, Utc::now()).await.unwrap(), 0);

        // Cutoff after the claim time: the row returns to PENDING.
        let late_cutoff = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(repo.requeue_stuck(late_cutoff, Utc::now()).await.unwrap(), 1);

        let record = repo.get(&id).await.unwrap().unwrap();
        assert!(record.is_pending());
    }

    #[tokio::test]
    async fn test_counts_by_status() {
        let repo = test_repo().await;

        let id1 = repo.insert(1, "SPY", PRIORITY_LOW).await.unwrap();
        repo.insert(2, "SPY", PRIORITY_LOW).await.unwrap();
        repo.mark_processing(&[id1], Utc::now()).await.unwrap();

        let counts = repo.counts_by_status().await.unwrap();
        let get = |status: &str| {
            counts
                .iter()
                .find(|(s, _)| s == status)
                .map_or(0, |(_, n)| *n)
        };
        assert_eq!(get("PENDING"), 1);
        assert_eq!(get("PROCESSING"), 1);
    }
}
