use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::CommitMode;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, OffsetReset, SynchronizedConsumerOptions};
use crate::error::ConsumerError;
use crate::kafka::broker::{next_offset_of, BrokerConsumer, KafkaBrokerConsumer};
use crate::kafka::errors::record_kafka_error;
use crate::kafka::types::{AssignedPartition, PartitionKey, RebalanceEvent};
use crate::metrics_consts::{
    LATE_FETCH_REWINDS, MESSAGES_DELIVERED, PARTITION_FLOW_CONTROL, PAUSED_PARTITIONS,
    REBALANCE_CALLBACK_ERRORS, REBALANCE_EVENTS, RESUMED_PARTITIONS,
};
use crate::partition_state::{Assignment, PartitionState, PartitionStateTable, PartitionStatus};
use crate::watermark_tracker::{
    CommitLogSource, KafkaCommitLogSource, TrackerHandle, WatermarkTracker,
};

const COMPONENT: &str = "primary_reader";

/// Called with the newly assigned partitions and their starting offsets.
pub type AssignCallback = Box<dyn FnMut(&[AssignedPartition]) -> anyhow::Result<()> + Send>;

/// Called with the partitions being taken away.
pub type RevokeCallback = Box<dyn FnMut(&[PartitionKey]) -> anyhow::Result<()> + Send>;

/// Requests shutdown of a `SynchronizedConsumer` from another task.
#[derive(Clone)]
pub struct CloseHandle {
    shutdown: CancellationToken,
}

impl CloseHandle {
    /// Stops the watermark tracker and makes every in-flight and later
    /// `poll` return `ConsumerError::Closed`.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Consumer that never delivers a message before another consumer group has
/// committed past it.
///
/// The other group's progress is read from a commit-log topic by a
/// background `WatermarkTracker`. Assigned partitions stay paused at the
/// broker until their watermark is ahead of the local position, and are
/// paused again as soon as delivery catches up.
pub struct SynchronizedConsumer<B: BrokerConsumer = KafkaBrokerConsumer> {
    broker: B,
    state: Arc<PartitionStateTable>,
    tracker: TrackerHandle,
    shutdown: CancellationToken,
    on_assign: Option<AssignCallback>,
    on_revoke: Option<RevokeCallback>,
    /// Rebalances drained from the broker but not yet handled
    pending_rebalances: VecDeque<RebalanceEvent>,
    /// Partitions resumed at the broker, everything else assigned is paused
    resumed: HashSet<PartitionKey>,
    options: SynchronizedConsumerOptions,
    closed: bool,
}

impl SynchronizedConsumer<KafkaBrokerConsumer> {
    /// Create both Kafka consumers from `config` and start the tracker.
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self, ConsumerError> {
        let options = config.to_options()?;
        let broker = KafkaBrokerConsumer::from_config(&config.primary_consumer_config()?)?;

        let commit_log_group = config.commit_log_group_id();
        let commit_log = KafkaCommitLogSource::new(
            &config.commit_log_consumer_config(&commit_log_group)?,
            &config.commit_log_topic,
        )?;

        info!(
            consumer_group = config.kafka_consumer_group.as_str(),
            commit_log_group = commit_log_group.as_str(),
            commit_log_topic = config.commit_log_topic.as_str(),
            synchronize_commit_group = config.synchronize_commit_group.as_str(),
            "Created synchronized consumer"
        );

        Ok(Self::new(broker, commit_log, options))
    }
}

impl<B: BrokerConsumer> SynchronizedConsumer<B> {
    /// Wrap `broker` and start following `commit_log` on the current tokio runtime.
    pub fn new<S: CommitLogSource + 'static>(
        broker: B,
        commit_log: S,
        options: SynchronizedConsumerOptions,
    ) -> Self {
        let state = Arc::new(PartitionStateTable::new());
        let shutdown = CancellationToken::new();

        let tracker = WatermarkTracker::new(
            commit_log,
            state.clone(),
            options.synchronize_commit_group.as_str(),
            options.commit_log_poll_timeout,
        )
        .spawn(shutdown.child_token());

        Self {
            broker,
            state,
            tracker,
            shutdown,
            on_assign: None,
            on_revoke: None,
            pending_rebalances: VecDeque::new(),
            resumed: HashSet::new(),
            options,
            closed: false,
        }
    }

    /// Subscribe to `topics`. The callbacks run inside the `poll` call that
    /// observes the rebalance, and their errors are returned from it.
    pub fn subscribe<A, R>(
        &mut self,
        topics: &[&str],
        on_assign: A,
        on_revoke: R,
    ) -> Result<(), ConsumerError>
    where
        A: FnMut(&[AssignedPartition]) -> anyhow::Result<()> + Send + 'static,
        R: FnMut(&[PartitionKey]) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_open()?;

        self.on_assign = Some(Box::new(on_assign));
        self.on_revoke = Some(Box::new(on_revoke));
        self.broker.subscribe(topics)?;

        info!(topics = ?topics, "Subscribed");
        Ok(())
    }

    /// Wait up to `timeout` for the next deliverable message.
    ///
    /// Returns `Ok(None)` when nothing is ready, which includes every
    /// partition being gated and transient broker errors.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<OwnedMessage>, ConsumerError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;

        loop {
            if !self.handle_rebalances()? {
                return Ok(None);
            }
            self.sync_flow_control();

            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    return Err(ConsumerError::Closed);
                }

                _ = self.state.watermark_advanced() => None,

                result = self.broker.recv(remaining) => Some(result),
            };

            match received {
                // A partition became eligible, go resume it
                None => {}
                Some(Ok(Some(message))) => {
                    if let Some(message) = self.admit(message) {
                        return Ok(Some(message));
                    }
                }
                Some(Ok(None)) => {
                    self.handle_rebalances()?;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    let class = record_kafka_error(COMPONENT, &e);
                    if class.is_fatal() {
                        return Err(ConsumerError::Kafka(e));
                    }
                    return Ok(None);
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Commit offsets for this consumer's own group.
    pub fn commit(
        &self,
        offsets: &[(PartitionKey, i64)],
        mode: CommitMode,
    ) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        self.broker.commit(offsets, mode)?;
        Ok(())
    }

    /// Commit the offset following `message`.
    pub fn commit_message<M: Message>(
        &self,
        message: &M,
        mode: CommitMode,
    ) -> Result<(), ConsumerError> {
        self.commit(&[next_offset_of(message)], mode)
    }

    pub fn position(&self) -> Result<HashMap<PartitionKey, Option<i64>>, ConsumerError> {
        self.ensure_open()?;
        Ok(self.broker.position()?)
    }

    pub fn assignment(&self) -> Assignment {
        self.state.assignment()
    }

    pub fn partition_state(&self, partition: &PartitionKey) -> Option<PartitionState> {
        self.state.get(partition)
    }

    pub fn partition_status(&self, partition: &PartitionKey) -> Option<PartitionStatus> {
        self.state.status(partition)
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.shutdown.is_cancelled()
    }

    /// Underlying broker client, for diagnostics and tests. Pausing,
    /// resuming or seeking through it bypasses the watermark gating.
    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Stop the tracker and leave the group. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        info!("Closing synchronized consumer");
        self.shutdown.cancel();
        self.tracker.stop().await;
        self.broker.unsubscribe();

        self.pending_rebalances.clear();
        self.resumed.clear();
        info!("Synchronized consumer closed");
    }

    fn ensure_open(&self) -> Result<(), ConsumerError> {
        if self.is_closed() {
            return Err(ConsumerError::Closed);
        }
        Ok(())
    }

    /// Apply queued rebalances in order. Returns false when a transient broker
    /// error left an assignment queued for the next `poll`.
    fn handle_rebalances(&mut self) -> Result<bool, ConsumerError> {
        self.pending_rebalances
            .extend(self.broker.drain_rebalance_events());

        while let Some(event) = self.pending_rebalances.pop_front() {
            let result = match &event {
                RebalanceEvent::Assign(partitions) => self.handle_assign(partitions),
                RebalanceEvent::Revoke(partitions) => self.handle_revoke(partitions),
            };

            let source = match &result {
                Ok(()) => None,
                Err(ConsumerError::OffsetResolution { source, .. }) => Some(source),
                Err(ConsumerError::Kafka(source)) => Some(source),
                Err(_) => None,
            };

            // Nothing was applied yet, so the assignment can be retried
            if let Some(source) = source {
                let class = record_kafka_error(COMPONENT, source);
                self.pending_rebalances.push_front(event);
                if class.is_fatal() {
                    result?;
                }
                return Ok(false);
            }

            metrics::counter!(REBALANCE_EVENTS, "event_type" => event.event_type()).increment(1);
            result?;
        }

        Ok(true)
    }

    fn handle_assign(&mut self, partitions: &[PartitionKey]) -> Result<(), ConsumerError> {
        let assigned = self.resolve_starting_offsets(partitions)?;
        let generation = self.state.assign(&assigned);
        for partition in partitions {
            self.resumed.remove(partition);
        }

        for partition in &assigned {
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                starting_offset = partition.starting_offset(),
                generation,
                "Partition assigned, paused until watermark is known"
            );
        }

        if let Some(on_assign) = self.on_assign.as_mut() {
            if let Err(e) = on_assign(&assigned) {
                error!(error = ?e, "Partition assignment callback failed");
                metrics::counter!(REBALANCE_CALLBACK_ERRORS, "event_type" => "assign").increment(1);
                return Err(ConsumerError::AssignCallback(e));
            }
        }

        Ok(())
    }

    fn handle_revoke(&mut self, partitions: &[PartitionKey]) -> Result<(), ConsumerError> {
        let generation = self.state.revoke(partitions);
        for partition in partitions {
            self.resumed.remove(partition);
        }

        info!(
            partitions = partitions.len(),
            generation, "Partitions revoked, watermarks discarded"
        );

        if let Some(on_revoke) = self.on_revoke.as_mut() {
            if let Err(e) = on_revoke(partitions) {
                error!(error = ?e, "Partition revocation callback failed");
                metrics::counter!(REBALANCE_CALLBACK_ERRORS, "event_type" => "revoke").increment(1);
                return Err(ConsumerError::RevokeCallback(e));
            }
        }

        Ok(())
    }

    fn resolve_starting_offsets(
        &self,
        partitions: &[PartitionKey],
    ) -> Result<Vec<AssignedPartition>, ConsumerError> {
        if partitions.is_empty() {
            return Ok(Vec::new());
        }

        let timeout = self.options.operation_timeout;
        let committed = self.broker.committed(partitions, timeout)?;

        partitions
            .iter()
            .map(|partition| {
                let watermarks = self.broker.watermarks(partition, timeout).map_err(|source| {
                    ConsumerError::OffsetResolution {
                        partition: partition.clone(),
                        source,
                    }
                })?;
                let committed = committed.get(partition).copied().flatten();
                let offset = starting_offset(committed, watermarks, self.options.offset_reset);
                Ok(AssignedPartition::new(partition.clone(), offset))
            })
            .collect()
    }

    /// Bring the broker's paused set in line with the state table.
    fn sync_flow_control(&mut self) {
        let snapshot = self.state.snapshot_ready_partitions();

        let to_pause: Vec<PartitionKey> = snapshot
            .ineligible
            .iter()
            .filter(|p| self.resumed.contains(*p))
            .cloned()
            .collect();
        let to_resume: Vec<PartitionKey> = snapshot
            .ready
            .iter()
            .filter(|p| !self.resumed.contains(*p))
            .cloned()
            .collect();

        if !to_pause.is_empty() {
            match self.broker.pause(&to_pause) {
                Ok(()) => {
                    debug!(partitions = to_pause.len(), "Paused caught-up partitions");
                    metrics::counter!(PARTITION_FLOW_CONTROL, "action" => "pause")
                        .increment(to_pause.len() as u64);
                    for partition in &to_pause {
                        self.resumed.remove(partition);
                    }
                }
                Err(e) => warn!("Failed to pause {} partitions: {e}", to_pause.len()),
            }
        }

        if !to_resume.is_empty() {
            match self.broker.resume(&to_resume) {
                Ok(()) => {
                    debug!(partitions = to_resume.len(), "Resumed eligible partitions");
                    metrics::counter!(PARTITION_FLOW_CONTROL, "action" => "resume")
                        .increment(to_resume.len() as u64);
                    self.resumed.extend(to_resume);
                }
                Err(e) => warn!("Failed to resume {} partitions: {e}", to_resume.len()),
            }
        }

        let assigned = snapshot.ready.len() + snapshot.ineligible.len();
        metrics::gauge!(RESUMED_PARTITIONS).set(self.resumed.len() as f64);
        metrics::gauge!(PAUSED_PARTITIONS).set(assigned.saturating_sub(self.resumed.len()) as f64);
    }

    /// Decide whether a received message may be handed to the caller,
    /// recording the next offset to deliver when it may.
    fn admit(&mut self, message: OwnedMessage) -> Option<OwnedMessage> {
        let partition = PartitionKey::new(message.topic(), message.partition());
        let offset = message.offset();

        let Some(state) = self.state.get(&partition) else {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                "Dropping message for unassigned partition"
            );
            return None;
        };

        if !state.may_deliver(offset) {
            // Fetched ahead of the watermark before the pause took effect, or
            // the log has a gap. Nothing below `offset` is left to fetch.
            if offset > state.local_offset() {
                self.state.record_local_offset(&partition, offset);
            }
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                remote_offset = ?state.remote_offset(),
                "Message is past the watermark, rewinding"
            );
            metrics::counter!(LATE_FETCH_REWINDS).increment(1);

            if let Err(e) = self.broker.pause(std::slice::from_ref(&partition)) {
                warn!("Failed to pause {partition}: {e}");
            }
            self.resumed.remove(&partition);
            if let Err(e) = self
                .broker
                .seek(&partition, offset, self.options.operation_timeout)
            {
                error!("Failed to rewind {partition} to {offset}: {e}");
            }
            return None;
        }

        self.state.record_local_offset(&partition, offset + 1);
        metrics::counter!(MESSAGES_DELIVERED).increment(1);
        Some(message)
    }
}

/// Offset delivery starts from: the committed offset while it is still in
/// the log, otherwise the reset policy's end of the log.
fn starting_offset(committed: Option<i64>, (low, high): (i64, i64), offset_reset: OffsetReset) -> i64 {
    match committed {
        Some(offset) if (low..=high).contains(&offset) => offset,
        _ => match offset_reset {
            OffsetReset::Earliest => low,
            OffsetReset::Latest => high,
        },
    }
}
