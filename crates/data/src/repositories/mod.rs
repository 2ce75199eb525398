//! Database repositories for the position sync engine.
//!
//! Each repository provides typed access to a specific table.

pub mod contract_repo;
pub mod position_log_repo;
pub mod queue_repo;

pub use contract_repo::ContractRepository;
pub use position_log_repo::PositionLogRepository;
pub use queue_repo::QueueRepository;

use sqlx::SqlitePool;

/// Creates all repositories from a single database pool.
pub struct Repositories {
    pub contracts: ContractRepository,
    pub queue: QueueRepository,
    pub position_log: PositionLogRepository,
}

impl Repositories {
    /// Creates a new set of repositories from a database pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            contracts: ContractRepository::new(pool.clone()),
            queue: QueueRepository::new(pool.clone()),
            position_log: PositionLogRepository::new(pool),
        }
    }
}
