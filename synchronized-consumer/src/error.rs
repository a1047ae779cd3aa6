use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::kafka::types::PartitionKey;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer is closed")]
    Closed,

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("partition assignment callback failed")]
    AssignCallback(#[source] anyhow::Error),

    #[error("partition revocation callback failed")]
    RevokeCallback(#[source] anyhow::Error),

    #[error("failed to resolve starting offset for {partition}")]
    OffsetResolution {
        partition: PartitionKey,
        #[source]
        source: KafkaError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConsumerError {
    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            ConsumerError::Closed => "closed",
            ConsumerError::Kafka(_) => "kafka",
            ConsumerError::AssignCallback(_) => "assign_callback",
            ConsumerError::RevokeCallback(_) => "revoke_callback",
            ConsumerError::OffsetResolution { .. } => "offset_resolution",
            ConsumerError::Config(_) => "config",
        }
    }
}
