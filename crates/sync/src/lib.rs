//! Position synchronization engine.
//!
//! This crate provides:
//! - Shared brokerage session with a single-synchronizer guard
//! - Active contract registry with durable add/remove history
//! - Durable work queue with exactly-once batch dispatch
//! - Buffered append-only position log
//! - Startup synchronizer that routes snapshot positions to streaming or
//!   the queue
//! - Batch worker and periodic reconciliation

pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod synchronizer;
pub mod worker;
pub mod writer;

pub use queue::WorkQueue;
pub use reconciler::{
    Discrepancy, DiscrepancyKind, LogAlerter, ReconciliationReport, ReconciliationService,
    Reconciler,
};
pub use registry::{ContractRegistry, NewActiveContract};
pub use session::{BrokerageSession, SessionError};
pub use synchronizer::{PositionSynchronizer, StartReport};
pub use worker::{QueueWorker, WorkerStats};
pub use writer::{PositionLog, PositionLogHandler};
