use crate::types::{BrokerPosition, Conid, PositionUpdate};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// The brokerage connection consumed by the subsystem.
///
/// Implementations own the wire protocol, heartbeats, and reconnects.
/// `updates` delivers incremental changes only for subscribed contracts.
#[async_trait]
pub trait Brokerage: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn is_connected(&self) -> bool;
    async fn fetch_positions(&self) -> Result<Vec<BrokerPosition>>;
    async fn subscribe_market_data(&self, position: &BrokerPosition) -> Result<()>;
    async fn unsubscribe_market_data(&self, conid: Conid) -> Result<()>;
    fn updates(&self) -> broadcast::Receiver<PositionUpdate>;
}

/// Receives each streamed position update.
///
/// Handlers run as independent tasks; a slow handler only delays its own
/// deliveries, never ingestion or other handlers.
#[async_trait]
pub trait PositionHandler: Send + Sync {
    async fn on_position_update(&self, update: &PositionUpdate) -> Result<()>;
}

/// Delivery channel for critical consistency findings.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send_critical(&self, message: &str) -> Result<()>;
}
