//! Core types for brokerage position tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broker-assigned contract identifier. Immutable, never reused for a
/// different instrument.
pub type Conid = i64;

/// Queue priority for contracts that should be resolved ahead of the
/// regular batch.
pub const PRIORITY_HIGH: i64 = 1;

/// Queue priority for positions refreshed by the periodic batch worker.
pub const PRIORITY_LOW: i64 = 2;

/// Options contract right (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "C"),
            Self::Put => write!(f, "P"),
        }
    }
}

impl std::str::FromStr for OptionRight {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "C" | "CALL" | "Call" | "call" => Ok(Self::Call),
            "P" | "PUT" | "Put" | "put" => Ok(Self::Put),
            other => anyhow::bail!("unknown option right: {other}"),
        }
    }
}

/// An open option position as reported by the brokerage account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub conid: Conid,
    pub symbol: String,
    pub right: OptionRight,
    pub strike: f64,
    /// Contract expiry in `YYYYMMDD` form, as the brokerage reports it.
    pub expiry: String,
    pub quantity: f64,
    pub market_price: f64,
    pub market_value: f64,
    pub average_cost: f64,
    pub unrealized_pnl: f64,
}

impl BrokerPosition {
    /// Creates a position with zeroed market fields.
    #[must_use]
    pub fn new(
        conid: Conid,
        symbol: &str,
        right: OptionRight,
        strike: f64,
        expiry: &str,
        quantity: f64,
    ) -> Self {
        Self {
            conid,
            symbol: symbol.to_uppercase(),
            right,
            strike,
            expiry: expiry.to_string(),
            quantity,
            market_price: 0.0,
            market_value: 0.0,
            average_cost: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    /// Sets the market-data fields.
    #[must_use]
    pub fn with_market_data(
        mut self,
        market_price: f64,
        market_value: f64,
        average_cost: f64,
        unrealized_pnl: f64,
    ) -> Self {
        self.market_price = market_price;
        self.market_value = market_value;
        self.average_cost = average_cost;
        self.unrealized_pnl = unrealized_pnl;
        self
    }

    /// Human-readable contract description (e.g., "NVDA 140C 20260320").
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}{} {}", self.symbol, self.strike, self.right, self.expiry)
    }

    /// True when the brokerage reports no open quantity.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }
}

/// A streamed market-data update for a subscribed contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub position: BrokerPosition,
    /// Event time assigned at ingestion, microsecond precision.
    pub timestamp: DateTime<Utc>,
}

impl PositionUpdate {
    /// Creates an update stamped with the current time.
    #[must_use]
    pub fn now(position: BrokerPosition) -> Self {
        Self {
            position,
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle status of a queued position request.
///
/// Transitions are monotonic: PENDING -> PROCESSING -> SUCCESS or FAILED.
/// The only backwards arc is the explicit stuck-row requeue, which moves
/// PROCESSING rows back to PENDING when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl QueueStatus {
    /// Canonical text stored in the queue table.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// True for SUCCESS and FAILED, which no dispatch path leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => anyhow::bail!("unknown queue status: {other}"),
        }
    }
}
