pub mod config;
pub mod config_loader;
pub mod traits;
pub mod types;

pub use config::{
    AppConfig, BrokerageConfig, DatabaseConfig, PositionLogConfig, QueueWorkerConfig,
    ReconciliationConfig, SynchronizerConfig,
};
pub use config_loader::ConfigLoader;
pub use traits::{Alerter, Brokerage, PositionHandler};
pub use types::{
    BrokerPosition, Conid, OptionRight, PositionUpdate, QueueStatus, PRIORITY_HIGH, PRIORITY_LOW,
};
