use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use uuid::Uuid;

use crate::error::ConsumerError;
use crate::kafka::config::ConsumerConfigBuilder;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Group of the caller-visible consumer
    pub kafka_consumer_group: String,

    // client.id of both Kafka consumers, librdkafka's default when unset
    pub kafka_client_id: Option<String>,

    // earliest, latest - only applies to partitions without a committed offset
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "60000")]
    pub kafka_session_timeout_ms: u32,

    // Bound on blocking broker calls (committed offsets, watermarks, seeks)
    #[envconfig(default = "5000")]
    pub kafka_operation_timeout_ms: u64,

    // Topic on which the synchronize group publishes its committed offsets
    pub commit_log_topic: String,

    #[envconfig(default = "earliest")]
    pub commit_log_offset_reset: String,

    #[envconfig(default = "1000")]
    pub commit_log_poll_timeout_ms: u64,

    // Group whose progress gates delivery
    pub synchronize_commit_group: String,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_operation_timeout_ms)
    }

    pub fn commit_log_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_log_poll_timeout_ms)
    }

    pub fn offset_reset(&self) -> Result<OffsetReset, ConsumerError> {
        self.kafka_consumer_offset_reset.parse()
    }

    /// Every instance reads the commit log through a group of its own, so
    /// it sees all commit-log partitions regardless of how many peers run.
    pub fn commit_log_group_id(&self) -> String {
        format!("{}:sync:{}", self.kafka_consumer_group, Uuid::now_v7().simple())
    }

    pub fn primary_consumer_config(&self) -> Result<ClientConfig, ConsumerError> {
        let offset_reset = self.offset_reset()?;
        Ok(
            ConsumerConfigBuilder::for_primary_consumer(
                &self.kafka_hosts,
                &self.kafka_consumer_group,
            )
            .with_tls(self.kafka_tls)
            .with_offset_reset(offset_reset.as_str())
            .with_session_timeout_ms(self.kafka_session_timeout_ms)
            .with_client_id(self.kafka_client_id.as_deref())
            .build(),
        )
    }

    pub fn commit_log_consumer_config(&self, group_id: &str) -> Result<ClientConfig, ConsumerError> {
        let offset_reset: OffsetReset = self.commit_log_offset_reset.parse()?;
        Ok(
            ConsumerConfigBuilder::for_commit_log_consumer(&self.kafka_hosts, group_id)
                .with_tls(self.kafka_tls)
                .with_offset_reset(offset_reset.as_str())
                .with_client_id(self.kafka_client_id.as_deref())
                .build(),
        )
    }

    pub fn to_options(&self) -> Result<SynchronizedConsumerOptions, ConsumerError> {
        Ok(
            SynchronizedConsumerOptions::new(&self.synchronize_commit_group)
                .with_offset_reset(self.offset_reset()?)
                .with_operation_timeout(self.operation_timeout())
                .with_commit_log_poll_timeout(self.commit_log_poll_timeout()),
        )
    }
}

/// Where a partition with no committed offset starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "earliest" | "smallest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "largest" | "end" => Ok(OffsetReset::Latest),
            _ => Err(ConsumerError::Config(format!(
                "unknown offset reset policy {s:?}, must be earliest or latest"
            ))),
        }
    }
}

/// Settings of a `SynchronizedConsumer` that are independent of the broker client.
#[derive(Debug, Clone)]
pub struct SynchronizedConsumerOptions {
    pub synchronize_commit_group: String,
    pub offset_reset: OffsetReset,
    pub operation_timeout: Duration,
    pub commit_log_poll_timeout: Duration,
}

impl SynchronizedConsumerOptions {
    pub fn new(synchronize_commit_group: &str) -> Self {
        Self {
            synchronize_commit_group: synchronize_commit_group.to_string(),
            offset_reset: OffsetReset::Earliest,
            operation_timeout: Duration::from_secs(5),
            commit_log_poll_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.offset_reset = offset_reset;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_commit_log_poll_timeout(mut self, timeout: Duration) -> Self {
        self.commit_log_poll_timeout = timeout;
        self
    }
}
