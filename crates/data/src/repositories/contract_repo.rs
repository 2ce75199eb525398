//! Contract history repository.
//!
//! The `active_contracts` table is a history: adds append rows, removals set
//! `removed_at`. The in-memory active view is folded from the full history
//! at startup.

use anyhow::Result;
use chrono::{DateTime, Utc};
use possync_core::types::Conid;
use sqlx::SqlitePool;

use crate::models::ActiveContractRecord;

/// Repository for contract history operations.
#[derive(Debug, Clone)]
pub struct ContractRepository {
    pool: SqlitePool,
}

impl ContractRepository {
    /// Creates a new repository instance.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends a contract row and returns the generated id.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn insert(&self, record: &ActiveContractRecord) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r"
            INSERT INTO active_contracts
                (conid, symbol, option_right, strike, expiry, strategy_id, added_at, removed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            RETURNING id
            ",
        )
        .bind(record.conid)
        .bind(&record.symbol)
        .bind(&record.right)
        .bind(record.strike)
        .bind(&record.expiry)
        .bind(record.strategy_id)
        .bind(record.added_at)
        .bind(record.removed_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Loads the full contract history in insertion order.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn fetch_all(&self) -> Result<Vec<ActiveContractRecord>> {
        let records = sqlx::query_as::<_, ActiveContractRecord>(
            r"
            SELECT id, conid, symbol, option_right, strike, expiry, strategy_id,
                   added_at, removed_at
            FROM active_contracts
            ORDER BY id ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Soft-deletes the live row for a conid.
    ///
    /// Returns the number of rows marked (0 when the conid has no live row).
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn mark_removed(&self, conid: Conid, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE active_contracts
            SET removed_at = ?2
            WHERE conid = ?1 AND removed_at IS NULL
            ",
        )
        .bind(conid)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use possync_core::types::OptionRight;

    fn sample_record(conid: Conid) -> ActiveContractRecord {
        ActiveContractRecord {
            id: 0,
            conid,
            symbol: "NVDA".to_string(),
            right: OptionRight::Call.to_string(),
            strike: 140.0,
            expiry: "20260320".to_string(),
            strategy_id: 7,
            added_at: Utc::now(),
            removed_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch_all() {
        let db = Database::new_in_memory().await.unwrap();
        let repo = ContractRepository::new(db.pool().clone());

        let id1 = repo.insert(&sample_record(100)).await.unwrap();
        let id2 = repo.insert(&sample_record(101)).await.unwrap();
        assert!(id2 > id1);

        let all = repo.fetch_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].conid, 100);
        assert_eq!(all[0].right, "C");
        assert!(all.iter().all(|r| !r.is_removed()));
    }

    #[tokio::test]
    async fn test_mark_removed_only_live_row() {
        let db = Database::new_in_memory().await.unwrap();
        let repo = ContractRepository::new(db.pool().clone());

        repo.insert(&sample_record(100)).await.unwrap();
        assert_eq!(repo.mark_removed(100, Utc::now()).await.unwrap(), 1);
        // Second removal finds no live row.
        assert_eq!(repo.mark_removed(100, Utc::now()).await.unwrap(), 0);

        let all = repo.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_removed());
    }

    #[tokio::test]
    async fn test_readd_keeps_history() {
        let db = Database::new_in_memory().await.unwrap();
        let repo = ContractRepository::new(db.pool().clone());

        repo.insert(&sample_record(100)).await.unwrap();
        repo.mark_removed(100, Utc::now()).await.unwrap();
        repo.insert(&sample_record(100)).await.unwrap();

        let all = repo.fetch_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].is_removed());
        assert!(!all[1].is_removed());
    }
}
