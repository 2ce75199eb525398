//! Database row models.
//!
//! Enum-like columns (`option_right`, `status`) are stored as their canonical
//! text and converted at the boundaries via the core parse/display impls.

use chrono::{DateTime, TimeZone, Utc};
use possync_core::types::{BrokerPosition, Conid, OptionRight, PositionUpdate, QueueStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row in the `active_contracts` history table.
///
/// A contract is active while `removed_at` is null. Removal is a soft
/// delete; the row itself is never dropped.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ActiveContractRecord {
    pub id: i64,
    pub conid: Conid,
    pub symbol: String,
    #[sqlx(rename = "option_right")]
    pub right: String,
    pub strike: f64,
    pub expiry: String,
    pub strategy_id: i64,
    pub added_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl ActiveContractRecord {
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    /// Parsed contract right, if the stored text is valid.
    #[must_use]
    pub fn option_right(&self) -> Option<OptionRight> {
        self.right.parse().ok()
    }
}

/// Row in the `position_queue` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueuedPositionRecord {
    pub request_id: String,
    pub conid: Conid,
    pub symbol: String,
    pub priority: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl QueuedPositionRecord {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == QueueStatus::Pending.as_str()
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.status == QueueStatus::Processing.as_str()
    }

    /// Parsed status, if the stored text is valid.
    #[must_use]
    pub fn queue_status(&self) -> Option<QueueStatus> {
        self.status.parse().ok()
    }
}

/// Row in the append-only `position_log` table.
///
/// `timestamp_us` is microseconds since the Unix epoch; it alone defines
/// last-write-wins ordering, independent of arrival order.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PositionRecord {
    pub conid: Conid,
    pub symbol: String,
    #[sqlx(rename = "option_right")]
    pub right: String,
    pub strike: f64,
    pub expiry: String,
    pub quantity: f64,
    pub market_price: f64,
    pub market_value: f64,
    pub average_cost: f64,
    pub unrealized_pnl: f64,
    pub timestamp_us: i64,
    /// Partition column, `YYYY-MM-DD`, derived from the record timestamp.
    pub date: String,
}

impl PositionRecord {
    /// Builds a record from a streamed update.
    #[must_use]
    pub fn from_update(update: &PositionUpdate) -> Self {
        Self::from_position(&update.position, update.timestamp)
    }

    /// Builds a record from a snapshot position observed at `at`.
    #[must_use]
    pub fn from_position(position: &BrokerPosition, at: DateTime<Utc>) -> Self {
        Self {
            conid: position.conid,
            symbol: position.symbol.clone(),
            right: position.right.to_string(),
            strike: position.strike,
            expiry: position.expiry.clone(),
            quantity: position.quantity,
            market_price: position.market_price,
            market_value: position.market_value,
            average_cost: position.average_cost,
            unrealized_pnl: position.unrealized_pnl,
            timestamp_us: at.timestamp_micros(),
            date: at.date_naive().to_string(),
        }
    }

    /// The record timestamp as a `DateTime`, if within chrono's range.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_micros(self.timestamp_us).single()
    }
}
