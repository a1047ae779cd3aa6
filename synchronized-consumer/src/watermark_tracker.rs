//! Watermark Tracker - follows the commit log in the background
//!
//! The tracker consumes the commit-log topic through its own group and turns
//! every record published by the synchronize group into a watermark update
//! on the shared `PartitionStateTable`. It never talks to the primary
//! consumer's broker handle: when an update makes a partition eligible it
//! only wakes the primary reader, which issues the resume itself.
//!
//! Nothing the tracker reads can stop it. Malformed records are skipped,
//! read errors are retried with backoff, and only cancellation ends the loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commit_log::CommitLogRecord;
use crate::kafka::context::CommitLogConsumerContext;
use crate::kafka::errors::{record_kafka_error, retry_backoff};
use crate::metrics_consts::{COMMIT_LOG_RECORDS, WATERMARK_ADVANCES};
use crate::partition_state::{PartitionStateTable, PartitionStatus};

const COMPONENT: &str = "watermark_tracker";

/// Source of raw commit-log messages.
#[async_trait]
pub trait CommitLogSource: Send {
    /// Wait up to `timeout` for the next commit-log message.
    async fn recv(&mut self, timeout: Duration) -> KafkaResult<Option<OwnedMessage>>;
}

pub struct KafkaCommitLogSource {
    consumer: StreamConsumer<CommitLogConsumerContext>,
}

impl KafkaCommitLogSource {
    pub fn new(config: &ClientConfig, commit_log_topic: &str) -> KafkaResult<Self> {
        let consumer: StreamConsumer<CommitLogConsumerContext> =
            config.create_with_context(CommitLogConsumerContext)?;
        consumer.subscribe(&[commit_log_topic])?;

        info!(topic = commit_log_topic, "Subscribed to commit log");
        Ok(Self { consumer })
    }
}

#[async_trait]
impl CommitLogSource for KafkaCommitLogSource {
    async fn recv(&mut self, wait: Duration) -> KafkaResult<Option<OwnedMessage>> {
        match tokio::time::timeout(wait, self.consumer.recv()).await {
            Ok(Ok(message)) => Ok(Some(message.detach())),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }
}

/// What happened to one commit-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Watermark merged, partition is now in the given status
    Applied(PartitionStatus),
    /// Published by a group other than the synchronize group
    OtherGroup,
    /// Partition is not assigned to this consumer
    Unassigned,
    /// Record could not be parsed
    Malformed,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Applied(_) => "applied",
            RecordOutcome::OtherGroup => "other_group",
            RecordOutcome::Unassigned => "unassigned",
            RecordOutcome::Malformed => "malformed",
        }
    }
}

pub struct WatermarkTracker<S: CommitLogSource> {
    source: S,
    state: Arc<PartitionStateTable>,
    synchronize_commit_group: String,
    poll_timeout: Duration,
}

impl<S: CommitLogSource> WatermarkTracker<S> {
    pub fn new(
        source: S,
        state: Arc<PartitionStateTable>,
        synchronize_commit_group: impl Into<String>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            source,
            state,
            synchronize_commit_group: synchronize_commit_group.into(),
            poll_timeout,
        }
    }

    pub fn handle_message<M: Message>(&self, message: &M) -> RecordOutcome {
        let outcome = match CommitLogRecord::from_message(message) {
            Ok(record) => self.apply_record(&record),
            Err(e) => {
                warn!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    error_type = e.error_type(),
                    "Skipping malformed commit log record: {e}"
                );
                RecordOutcome::Malformed
            }
        };

        metrics::counter!(COMMIT_LOG_RECORDS, "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    pub fn apply_record(&self, record: &CommitLogRecord) -> RecordOutcome {
        if record.group() != self.synchronize_commit_group {
            return RecordOutcome::OtherGroup;
        }

        let partition = record.partition();
        let before = self.state.status(partition);
        match self.state.apply_watermark(partition, record.offset()) {
            Some(status) => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = record.offset(),
                    status = status.as_str(),
                    "Applied watermark"
                );
                if status == PartitionStatus::Eligible && before != Some(PartitionStatus::Eligible)
                {
                    metrics::counter!(WATERMARK_ADVANCES).increment(1);
                }
                RecordOutcome::Applied(status)
            }
            None => RecordOutcome::Unassigned,
        }
    }

    /// Follow the commit log until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            synchronize_commit_group = self.synchronize_commit_group.as_str(),
            "Starting watermark tracker"
        );

        let mut consecutive_errors: u64 = 0;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break;
                }

                result = self.source.recv(self.poll_timeout) => {
                    match result {
                        Ok(Some(message)) => {
                            consecutive_errors = 0;
                            self.handle_message(&message);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            consecutive_errors += 1;
                            let class = record_kafka_error(COMPONENT, &e);
                            if class.is_fatal() {
                                error!("Commit log read failed, retrying: {e}");
                            }

                            let backoff = retry_backoff(class, consecutive_errors);
                            if !backoff.is_zero() {
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    _ = tokio::time::sleep(backoff) => {}
                                }
                            }
                        }
                    }
                }
            }
        }

        info!("Watermark tracker stopped");
    }
}

impl<S: CommitLogSource + 'static> WatermarkTracker<S> {
    /// Run the tracker on the current tokio runtime until `cancel` fires or
    /// the returned handle is stopped.
    pub fn spawn(self, cancel: CancellationToken) -> TrackerHandle {
        let join = tokio::spawn(self.run(cancel.clone()));
        TrackerHandle {
            cancel,
            join: Some(join),
        }
    }
}

/// Owner of a running tracker task.
pub struct TrackerHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TrackerHandle {
    /// Ask the tracker to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the tracker and wait for its task to finish. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!("Watermark tracker task failed: {e}");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
