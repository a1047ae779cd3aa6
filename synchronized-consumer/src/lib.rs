//! Watermark-gated Kafka consumer.
//!
//! `SynchronizedConsumer` reads a set of topics on behalf of one consumer
//! group but never hands out a message before a second group (the
//! "synchronize group") has committed past it. The second group's commits are
//! observed on a commit-log topic, keyed `"{topic}:{partition}:{group}"` with
//! the next offset to read as value.
//!
//! ## Error logging
//!
//! Errors carrying a cause chain (`ConsumerError`, callback `anyhow::Error`s)
//! are logged as `error = ?e` or `{e:#}` so the root cause stays visible.
//! Callbacks should build errors with `.context()` rather than formatting the
//! source into a new message.

pub mod commit_log;
pub mod config;
pub mod consumer;
pub mod error;
pub mod kafka;
pub mod metrics_consts;
pub mod partition_state;
pub mod test_utils;
pub mod watermark_tracker;

// Re-export commonly used types for convenience
pub use commit_log::{CommitLogError, CommitLogRecord};
pub use config::{Config, OffsetReset, SynchronizedConsumerOptions};
pub use consumer::{CloseHandle, SynchronizedConsumer};
pub use error::ConsumerError;
pub use kafka::{AssignedPartition, BrokerConsumer, KafkaBrokerConsumer, PartitionKey};
pub use partition_state::{PartitionState, PartitionStatus};
