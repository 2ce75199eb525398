//! Data storage for the position sync engine.
//!
//! This crate provides:
//! - `SQLite` database client with embedded migrations
//! - Data models for contracts, the position queue, and the position log
//! - Repositories for typed database access

pub mod database;
pub mod models;
pub mod repositories;

pub use database::Database;

// Re-export models
pub use models::{ActiveContractRecord, PositionRecord, QueuedPositionRecord};

// Re-export repositories
pub use repositories::{
    ContractRepository, PositionLogRepository, QueueRepository, Repositories,
};
