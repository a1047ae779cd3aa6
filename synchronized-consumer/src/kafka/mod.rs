// Kafka module - broker client seam, rebalance context and client configuration
pub mod broker;
pub mod config;
pub mod context;
pub mod errors;
pub mod types;

// Public API
pub use broker::{BrokerConsumer, KafkaBrokerConsumer};
pub use config::ConsumerConfigBuilder;
pub use types::{AssignedPartition, PartitionKey, RebalanceEvent};
