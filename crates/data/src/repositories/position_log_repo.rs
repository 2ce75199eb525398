//! Append-only position log repository.
//!
//! Rows are never updated or deleted. The latest state per contract is the
//! row with the highest `timestamp_us` for that conid.

use anyhow::Result;
use sqlx::SqlitePool;

use possync_core::types::Conid;

use crate::models::PositionRecord;

/// Repository for the position log.
#[derive(Debug, Clone)]
pub struct PositionLogRepository {
    pool: SqlitePool,
}

impl PositionLogRepository {
    /// Creates a new repository instance.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends a batch of rows in one transaction.
    ///
    /// # Errors
    /// Returns an error if the database operation fails. No rows from the
    /// batch are written in that case.
    pub async fn insert_batch(&self, records: &[PositionRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                r"
                INSERT INTO position_log
                    (conid, symbol, option_right, strike, expiry, quantity,
                     market_price, market_value, average_cost, unrealized_pnl,
                     timestamp_us, date)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ",
            )
            .bind(record.conid)
            .bind(&record.symbol)
            .bind(&record.right)
            .bind(record.strike)
            .bind(&record.expiry)
            .bind(record.quantity)
            .bind(record.market_price)
            .bind(record.market_value)
            .bind(record.average_cost)
            .bind(record.unrealized_pnl)
            .bind(record.timestamp_us)
            .bind(&record.date)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(records.len() as u64)
    }

    /// Newest row per conid across the whole log.
    ///
    /// SQLite guarantees that bare columns in a `GROUP BY` query with a
    /// single `MAX` aggregate come from the max row, so this returns whole
    /// rows, not mixed columns.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn latest_rows(&self) -> Result<Vec<PositionRecord>> {
        let records = sqlx::query_as::<_, PositionRecord>(
            r"
            SELECT conid, symbol, option_right, strike, expiry, quantity,
                   market_price, market_value, average_cost, unrealized_pnl,
                   MAX(timestamp_us) AS timestamp_us, date
            FROM position_log
            GROUP BY conid
            ORDER BY conid ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Newest row per conid, restricted to the given conids.
    ///
    /// An empty slice returns no rows without touching the database.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn latest_rows_for_conids(&self, conids: &[Conid]) -> Result<Vec<PositionRecord>> {
        if conids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; conids.len()].join(", ");
        let sql = format!(
            r"
            SELECT conid, symbol, option_right, strike, expiry, quantity,
                   market_price, market_value, average_cost, unrealized_pnl,
                   MAX(timestamp_us) AS timestamp_us, date
            FROM position_log
            WHERE conid IN ({placeholders})
            GROUP BY conid
            ORDER BY conid ASC
            "
        );

        let mut query = sqlx::query_as::<_, PositionRecord>(&sql);
        for conid in conids {
            query = query.bind(*conid);
        }
        let records = query.fetch_all(&self.pool).await?;

        Ok(records)
    }

    /// Newest row per conid, restricted to one symbol.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn latest_rows_for_symbol(&self, symbol: &str) -> Result<Vec<PositionRecord>> {
        let records = sqlx::query_as::<_, PositionRecord>(
            r"
            SELECT conid, symbol, option_right, strike, expiry, quantity,
                   market_price, market_value, average_cost, unrealized_pnl,
                   MAX(timestamp_us) AS timestamp_us, date
            FROM position_log
            WHERE symbol = ?1
            GROUP BY conid
            ORDER BY conid ASC
            ",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Full history for one conid within a timestamp range, oldest first.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn fetch_conid_range(
        &self,
        conid: Conid,
        start_us: i64,
        end_us: i64,
    ) -> Result<Vec<PositionRecord>> {
        let records = sqlx::query_as::<_, PositionRecord>(
            r"
            SELECT conid, symbol, option_right, strike, expiry, quantity,
                   market_price, market_value, average_cost, unrealized_pnl,
                   timestamp_us, date
            FROM position_log
            WHERE conid = ?1 AND timestamp_us >= ?2 AND timestamp_us <= ?3
            ORDER BY timestamp_us ASC
            ",
        )
        .bind(conid)
        .bind(start_us)
        .bind(end_us)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Full history for one symbol within a timestamp range, oldest first.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn fetch_symbol_range(
        &self,
        symbol: &str,
        start_us: i64,
        end_us: i64,
    ) -> Result<Vec<PositionRecord>> {
        let records = sqlx::query_as::<_, PositionRecord>(
            r"
            SELECT conid, symbol, option_right, strike, expiry, quantity,
                   market_price, market_value, average_cost, unrealized_pnl,
                   timestamp_us, date
            FROM position_log
            WHERE symbol = ?1 AND timestamp_us >= ?2 AND timestamp_us <= ?3
            ORDER BY timestamp_us ASC, conid ASC
            ",
        )
        .bind(symbol)
        .bind(start_us)
        .bind(end_us)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Total number of rows ever appended.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM position_log")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

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

    async fn test_repo() -> PositionLogRepository {
        let db = Database::new_in_memory().await.unwrap();
        PositionLogRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_insert_batch_and_count() {
        let repo = test_repo().await;

        let n = repo
            .insert_batch(&[record(1, 5.0, 1_000), record(2, 3.0, 1_001)])
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(repo.count().await.unwrap(), 2);

        // Empty batch is a no-op.
        assert_eq!(repo.insert_batch(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_latest_rows_picks_max_timestamp() {
        let repo = test_repo().await;

        repo.insert_batch(&[
            record(1, 5.0, 1_000),
            record(1, 7.0, 3_000),
            record(1, 6.0, 2_000),
            record(2, 1.0, 500),
        ])
        .await
        .unwrap();

        let latest = repo.latest_rows().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].conid, 1);
        assert_eq!(latest[0].quantity, 7.0);
        assert_eq!(latest[0].timestamp_us, 3_000);
        assert_eq!(latest[1].conid, 2);
        assert_eq!(latest[1].quantity, 1.0);
    }

    #[tokio::test]
    async fn test_latest_rows_for_conids_restricts_to_given_conids() {
        let repo = test_repo().await;

        repo.insert_batch(&[
            record(1, 5.0, 1_000),
            record(1, 7.0, 3_000),
            record(2, 1.0, 500),
            record(3, 2.0, 2_000),
        ])
        .await
        .unwrap();

        let rows = repo.latest_rows_for_conids(&[1, 3]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].conid, 1);
        assert_eq!(rows[0].timestamp_us, 3_000);
        assert_eq!(rows[1].conid, 3);

        // Unknown conids simply match nothing.
        let rows = repo.latest_rows_for_conids(&[2, 99]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].conid, 2);

        assert!(repo.latest_rows_for_conids(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_rows_for_symbol_filters() {
        let repo = test_repo().await;

        let mut spy = record(3, 2.0, 2_000);
        spy.symbol = "SPY".to_string();
        repo.insert_batch(&[record(1, 5.0, 1_000), spy]).await.unwrap();

        let nvda = repo.latest_rows_for_symbol("NVDA").await.unwrap();
        assert_eq!(nvda.len(), 1);
        assert_eq!(nvda[0].conid, 1);
    }

    #[tokio::test]
    async fn test_fetch_conid_range_bounds_inclusive() {
        let repo = test_repo().await;

        repo.insert_batch(&[
            record(1, 1.0, 1_000),
            record(1, 2.0, 2_000),
            record(1, 3.0, 3_000),
        ])
        .await
        .unwrap();

        let rows = repo.fetch_conid_range(1, 1_000, 2_000).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp_us, 1_000);
        assert_eq!(rows[1].timestamp_us, 2_000);
    }

    #[tokio::test]
    async fn test_fetch_symbol_range_orders_by_time() {
        let repo = test_repo().await;

        repo.insert_batch(&[record(2, 2.0, 3_000), record(1, 1.0, 1_000)])
            .await
            .unwrap();

        let rows = repo.fetch_symbol_range("NVDA", 0, 10_000).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].conid, 1);
        assert_eq!(rows[1].conid, 2);
    }
}
