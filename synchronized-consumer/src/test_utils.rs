//! In-memory Kafka stand-in for tests.
//!
//! `MemoryCluster` keeps partition logs, committed offsets per group and
//! group membership. Consumers created from it implement `BrokerConsumer`
//! with the behavior the primary reader relies on: an eager rebalance on
//! every subscribe/unsubscribe, newly assigned partitions start paused, and
//! fetch positions come from the group's committed offset or the consumer's
//! reset policy. Commit-log readers implement `CommitLogSource` and read
//! every partition of their topic from the start.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::CommitMode;
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{OwnedMessage, Timestamp};
use tokio::time::Instant;

use crate::commit_log::CommitLogRecord;
use crate::config::OffsetReset;
use crate::kafka::broker::BrokerConsumer;
use crate::kafka::types::{PartitionKey, RebalanceEvent};
use crate::watermark_tracker::CommitLogSource;

const IDLE_WAIT: Duration = Duration::from_millis(2);

#[derive(Default)]
struct PartitionLog {
    base_offset: i64,
    records: Vec<(Option<String>, Option<String>)>,
}

impl PartitionLog {
    fn end_offset(&self) -> i64 {
        self.base_offset + self.records.len() as i64
    }

    fn message(&self, topic: &str, partition: i32, offset: i64) -> Option<OwnedMessage> {
        let index = usize::try_from(offset - self.base_offset).ok()?;
        let (key, payload) = self.records.get(index)?;
        Some(OwnedMessage::new(
            payload.as_ref().map(|p| p.as_bytes().to_vec()),
            key.as_ref().map(|k| k.as_bytes().to_vec()),
            topic.to_string(),
            Timestamp::NotAvailable,
            partition,
            offset,
            None,
        ))
    }
}

#[derive(Default)]
struct Member {
    group: String,
    offset_reset: OffsetReset,
    topics: Vec<String>,
    assignment: BTreeSet<PartitionKey>,
    paused: HashSet<PartitionKey>,
    positions: HashMap<PartitionKey, i64>,
    events: VecDeque<RebalanceEvent>,
    errors: VecDeque<KafkaError>,
    committed_errors: VecDeque<KafkaError>,
    seeks: u64,
}

#[derive(Default)]
struct ClusterInner {
    topics: HashMap<String, Vec<PartitionLog>>,
    committed: HashMap<String, HashMap<PartitionKey, i64>>,
    members: BTreeMap<u64, Member>,
    next_member_id: u64,
}

impl ClusterInner {
    fn log(&self, partition: &PartitionKey) -> Option<&PartitionLog> {
        let index = usize::try_from(partition.partition_number()).ok()?;
        self.topics.get(partition.topic())?.get(index)
    }

    fn log_mut(&mut self, partition: &PartitionKey) -> Option<&mut PartitionLog> {
        let index = usize::try_from(partition.partition_number()).ok()?;
        self.topics.get_mut(partition.topic())?.get_mut(index)
    }

    fn reset_position(&self, partition: &PartitionKey, offset_reset: OffsetReset) -> i64 {
        let Some(log) = self.log(partition) else {
            return 0;
        };
        match offset_reset {
            OffsetReset::Earliest => log.base_offset,
            OffsetReset::Latest => log.end_offset(),
        }
    }

    /// Eager rebalance: every member of `group` loses its assignment, then
    /// each topic's partitions are dealt round-robin across its subscribers.
    fn rebalance(&mut self, group: &str) {
        let partition_counts: HashMap<String, i32> = self
            .topics
            .iter()
            .map(|(topic, logs)| (topic.clone(), logs.len() as i32))
            .collect();

        let mut subscribers: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (id, member) in self.members.iter_mut().filter(|(_, m)| m.group == group) {
            if !member.assignment.is_empty() {
                let revoked = std::mem::take(&mut member.assignment);
                member
                    .events
                    .push_back(RebalanceEvent::Revoke(revoked.into_iter().collect()));
            }
            member.paused.clear();
            member.positions.clear();

            for topic in &member.topics {
                subscribers.entry(topic.clone()).or_default().push(*id);
            }
        }

        let mut assignments: HashMap<u64, Vec<PartitionKey>> = HashMap::new();
        for (topic, ids) in &subscribers {
            let count = partition_counts.get(topic).copied().unwrap_or(0);
            for partition in 0..count {
                let owner = ids[partition as usize % ids.len()];
                assignments
                    .entry(owner)
                    .or_default()
                    .push(PartitionKey::new(topic.as_str(), partition));
            }
        }

        // Fetch positions are fixed at assignment time, like librdkafka does
        let resolved: Vec<(u64, Vec<PartitionKey>, HashMap<PartitionKey, i64>)> = self
            .members
            .iter()
            .filter(|(_, m)| m.group == group && !m.topics.is_empty())
            .map(|(id, member)| {
                let assigned = assignments.remove(id).unwrap_or_default();
                let positions = assigned
                    .iter()
                    .map(|p| (p.clone(), self.initial_position(group, p, member.offset_reset)))
                    .collect();
                (*id, assigned, positions)
            })
            .collect();

        for (id, assigned, positions) in resolved {
            let Some(member) = self.members.get_mut(&id) else {
                continue;
            };
            member.assignment = assigned.iter().cloned().collect();
            member.paused = assigned.iter().cloned().collect();
            member.positions = positions;
            member.events.push_back(RebalanceEvent::Assign(assigned));
        }
    }

    fn initial_position(&self, group: &str, partition: &PartitionKey, offset_reset: OffsetReset) -> i64 {
        self.committed
            .get(group)
            .and_then(|offsets| offsets.get(partition))
            .copied()
            .unwrap_or_else(|| self.reset_position(partition, offset_reset))
    }

    /// Next message of a resumed partition assigned to `member_id`.
    fn fetch(&mut self, member_id: u64) -> KafkaResult<Option<OwnedMessage>> {
        let Some(member) = self.members.get_mut(&member_id) else {
            return Ok(None);
        };
        if let Some(e) = member.errors.pop_front() {
            return Err(e);
        }

        let group = member.group.clone();
        let offset_reset = member.offset_reset;
        let candidates: Vec<(PartitionKey, Option<i64>)> = member
            .assignment
            .iter()
            .filter(|p| !member.paused.contains(*p))
            .map(|p| (p.clone(), member.positions.get(p).copied()))
            .collect();

        for (partition, position) in candidates {
            let Some(log) = self.log(&partition) else {
                continue;
            };
            let mut position = position
                .unwrap_or_else(|| self.initial_position(&group, &partition, offset_reset));
            // Out of range, reset the way auto.offset.reset does
            if position < log.base_offset || position > log.end_offset() {
                position = self.reset_position(&partition, offset_reset);
            }

            let message =
                log.message(partition.topic(), partition.partition_number(), position);
            let next = if message.is_some() { position + 1 } else { position };
            if let Some(member) = self.members.get_mut(&member_id) {
                member.positions.insert(partition, next);
            }
            if message.is_some() {
                return Ok(message);
            }
        }

        Ok(None)
    }
}

/// Shared in-memory cluster. Clones refer to the same cluster.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Mutex<ClusterInner>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut inner = self.inner.lock();
        inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| (0..partitions).map(|_| PartitionLog::default()).collect());
    }

    /// Append a record, returning its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        payload: Option<&str>,
    ) -> i64 {
        let mut inner = self.inner.lock();
        let log = inner
            .log_mut(&PartitionKey::new(topic, partition))
            .unwrap_or_else(|| panic!("unknown partition {topic}:{partition}"));
        log.records
            .push((key.map(str::to_string), payload.map(str::to_string)));
        log.end_offset() - 1
    }

    /// Publish a commit-log record on partition 0 of `commit_log_topic`.
    pub fn publish_commit(&self, commit_log_topic: &str, record: &CommitLogRecord) -> i64 {
        self.produce(
            commit_log_topic,
            0,
            Some(&record.key()),
            Some(&record.value()),
        )
    }

    /// Drop every record below `offset`, as retention would.
    pub fn truncate_before(&self, topic: &str, partition: i32, offset: i64) {
        let mut inner = self.inner.lock();
        let Some(log) = inner.log_mut(&PartitionKey::new(topic, partition)) else {
            return;
        };
        let offset = offset.clamp(log.base_offset, log.end_offset());
        let dropped = (offset - log.base_offset) as usize;
        log.records = log.records.split_off(dropped);
        log.base_offset = offset;
    }

    /// Commit `offset` for `group` directly, bypassing any consumer.
    pub fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        self.inner
            .lock()
            .committed
            .entry(group.to_string())
            .or_default()
            .insert(PartitionKey::new(topic, partition), offset);
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .lock()
            .committed
            .get(group)
            .and_then(|offsets| offsets.get(&PartitionKey::new(topic, partition)))
            .copied()
    }

    pub fn consumer(&self, group: &str) -> MemoryConsumer {
        self.consumer_with_offset_reset(group, OffsetReset::Earliest)
    }

    pub fn consumer_with_offset_reset(&self, group: &str, offset_reset: OffsetReset) -> MemoryConsumer {
        let mut inner = self.inner.lock();
        inner.next_member_id += 1;
        let member_id = inner.next_member_id;
        inner.members.insert(
            member_id,
            Member {
                group: group.to_string(),
                offset_reset,
                ..Member::default()
            },
        );

        MemoryConsumer {
            cluster: self.inner.clone(),
            member_id,
        }
    }

    pub fn commit_log_reader(&self, topic: &str) -> MemoryCommitLog {
        MemoryCommitLog {
            cluster: self.inner.clone(),
            topic: topic.to_string(),
            positions: HashMap::new(),
            errors: VecDeque::new(),
        }
    }
}

/// Group member of a `MemoryCluster`.
pub struct MemoryConsumer {
    cluster: Arc<Mutex<ClusterInner>>,
    member_id: u64,
}

impl MemoryConsumer {
    /// Fail the next `recv` with `error`.
    pub fn inject_error(&self, error: KafkaError) {
        if let Some(member) = self.cluster.lock().members.get_mut(&self.member_id) {
            member.errors.push_back(error);
        }
    }

    /// Fail the next `committed` lookup with `error`.
    pub fn inject_committed_error(&self, error: KafkaError) {
        if let Some(member) = self.cluster.lock().members.get_mut(&self.member_id) {
            member.committed_errors.push_back(error);
        }
    }

    /// Number of seeks issued through this consumer.
    pub fn seek_count(&self) -> u64 {
        self.cluster
            .lock()
            .members
            .get(&self.member_id)
            .map_or(0, |m| m.seeks)
    }

    pub fn paused_partitions(&self) -> HashSet<PartitionKey> {
        self.cluster
            .lock()
            .members
            .get(&self.member_id)
            .map(|m| m.paused.clone())
            .unwrap_or_default()
    }

    fn with_member<T>(&self, f: impl FnOnce(&mut Member) -> T) -> KafkaResult<T> {
        let mut inner = self.cluster.lock();
        let member = inner
            .members
            .get_mut(&self.member_id)
            .ok_or(KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::UnknownMemberId))?;
        Ok(f(member))
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    fn subscribe(&self, topics: &[&str]) -> KafkaResult<()> {
        let mut inner = self.cluster.lock();
        let member = inner
            .members
            .get_mut(&self.member_id)
            .ok_or_else(|| KafkaError::Subscription("consumer left the group".to_string()))?;
        member.topics = topics.iter().map(|t| t.to_string()).collect();
        let group = member.group.clone();
        inner.rebalance(&group);
        Ok(())
    }

    fn unsubscribe(&self) {
        let mut inner = self.cluster.lock();
        let Some(member) = inner.members.get_mut(&self.member_id) else {
            return;
        };
        if member.topics.is_empty() {
            return;
        }
        member.topics.clear();
        let group = member.group.clone();
        inner.rebalance(&group);
    }

    async fn recv(&self, timeout: Duration) -> KafkaResult<Option<OwnedMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.cluster.lock().fetch(self.member_id)? {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(IDLE_WAIT.min(deadline - now)).await;
        }
    }

    fn drain_rebalance_events(&self) -> Vec<RebalanceEvent> {
        self.with_member(|m| m.events.drain(..).collect())
            .unwrap_or_default()
    }

    fn pause(&self, partitions: &[PartitionKey]) -> KafkaResult<()> {
        self.with_member(|m| {
            for partition in partitions {
                if m.assignment.contains(partition) {
                    m.paused.insert(partition.clone());
                }
            }
        })
    }

    fn resume(&self, partitions: &[PartitionKey]) -> KafkaResult<()> {
        self.with_member(|m| {
            for partition in partitions {
                m.paused.remove(partition);
            }
        })
    }

    fn seek(&self, partition: &PartitionKey, offset: i64, _timeout: Duration) -> KafkaResult<()> {
        self.with_member(|m| {
            m.seeks += 1;
            if m.assignment.contains(partition) {
                m.positions.insert(partition.clone(), offset);
                Ok(())
            } else {
                Err(KafkaError::Seek(format!("{partition} is not assigned")))
            }
        })?
    }

    fn commit(&self, offsets: &[(PartitionKey, i64)], _mode: CommitMode) -> KafkaResult<()> {
        let mut inner = self.cluster.lock();
        let group = inner
            .members
            .get(&self.member_id)
            .map(|m| m.group.clone())
            .ok_or(KafkaError::ConsumerCommit(RDKafkaErrorCode::UnknownMemberId))?;
        let committed = inner.committed.entry(group).or_default();
        for (partition, offset) in offsets {
            committed.insert(partition.clone(), *offset);
        }
        Ok(())
    }

    fn committed(
        &self,
        partitions: &[PartitionKey],
        _timeout: Duration,
    ) -> KafkaResult<HashMap<PartitionKey, Option<i64>>> {
        let mut inner = self.cluster.lock();
        let group = match inner.members.get_mut(&self.member_id) {
            Some(member) => {
                if let Some(e) = member.committed_errors.pop_front() {
                    return Err(e);
                }
                member.group.clone()
            }
            None => String::new(),
        };
        let committed = inner.committed.get(&group);
        Ok(partitions
            .iter()
            .map(|p| (p.clone(), committed.and_then(|c| c.get(p)).copied()))
            .collect())
    }

    fn position(&self) -> KafkaResult<HashMap<PartitionKey, Option<i64>>> {
        self.with_member(|m| {
            m.assignment
                .iter()
                .map(|p| (p.clone(), m.positions.get(p).copied()))
                .collect()
        })
    }

    fn watermarks(&self, partition: &PartitionKey, _timeout: Duration) -> KafkaResult<(i64, i64)> {
        let inner = self.cluster.lock();
        let log = inner.log(partition).ok_or(KafkaError::MetadataFetch(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ))?;
        Ok((log.base_offset, log.end_offset()))
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let mut inner = self.cluster.lock();
        if let Some(member) = inner.members.remove(&self.member_id) {
            if !member.topics.is_empty() {
                inner.rebalance(&member.group);
            }
        }
    }
}

/// Reader of every partition of a commit-log topic, from the start.
pub struct MemoryCommitLog {
    cluster: Arc<Mutex<ClusterInner>>,
    topic: String,
    positions: HashMap<i32, i64>,
    errors: VecDeque<KafkaError>,
}

impl MemoryCommitLog {
    /// Fail the next `recv` with `error`. Errors are returned in order.
    pub fn inject_error(&mut self, error: KafkaError) {
        self.errors.push_back(error);
    }

    fn next_message(&mut self) -> Option<OwnedMessage> {
        let inner = self.cluster.lock();
        let logs = inner.topics.get(&self.topic)?;
        for (index, log) in logs.iter().enumerate() {
            let partition = index as i32;
            let position = self.positions.entry(partition).or_insert(log.base_offset);
            if *position < log.base_offset {
                *position = log.base_offset;
            }
            if let Some(message) = log.message(&self.topic, partition, *position) {
                *position += 1;
                return Some(message);
            }
        }
        None
    }
}

#[async_trait]
impl CommitLogSource for MemoryCommitLog {
    async fn recv(&mut self, timeout: Duration) -> KafkaResult<Option<OwnedMessage>> {
        if let Some(e) = self.errors.pop_front() {
            return Err(e);
        }
        if let Some(message) = self.next_message() {
            return Ok(Some(message));
        }
        tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Message;

    #[test]
    fn test_subscribe_assigns_paused_partitions_round_robin() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("events", 2);

        let first = cluster.consumer("group");
        first.subscribe(&["events"]).unwrap();
        assert_eq!(
            first.drain_rebalance_events(),
            vec![RebalanceEvent::Assign(vec![
                PartitionKey::new("events", 0),
                PartitionKey::new("events", 1),
            ])]
        );
        assert_eq!(first.paused_partitions().len(), 2);

        let second = cluster.consumer("group");
        second.subscribe(&["events"]).unwrap();

        assert_eq!(
            first.drain_rebalance_events(),
            vec![
                RebalanceEvent::Revoke(vec![
                    PartitionKey::new("events", 0),
                    PartitionKey::new("events", 1),
                ]),
                RebalanceEvent::Assign(vec![PartitionKey::new("events", 0)]),
            ]
        );
        assert_eq!(
            second.drain_rebalance_events(),
            vec![RebalanceEvent::Assign(vec![PartitionKey::new("events", 1)])]
        );

        drop(second);
        assert_eq!(
            first.drain_rebalance_events(),
            vec![
                RebalanceEvent::Revoke(vec![PartitionKey::new("events", 0)]),
                RebalanceEvent::Assign(vec![
                    PartitionKey::new("events", 0),
                    PartitionKey::new("events", 1),
                ]),
            ]
        );
    }

    #[tokio::test]
    async fn test_recv_reads_resumed_partitions_from_committed_offset() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("events", 1);
        for i in 0..3 {
            cluster.produce("events", 0, None, Some(&format!("m{i}")));
        }
        cluster.commit("group", "events", 0, 1);

        let consumer = cluster.consumer("group");
        consumer.subscribe(&["events"]).unwrap();
        let key = PartitionKey::new("events", 0);

        let paused = consumer.recv(Duration::from_millis(10)).await.unwrap();
        assert!(paused.is_none());

        consumer.resume(&[key.clone()]).unwrap();
        let message = consumer
            .recv(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.offset(), 1);
        assert_eq!(consumer.position().unwrap()[&key], Some(2));
    }

    #[tokio::test]
    async fn test_commit_log_reader_reads_all_partitions() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("commit-log", 2);
        cluster.produce("commit-log", 1, Some("a"), Some("1"));
        cluster.produce("commit-log", 0, Some("b"), Some("2"));

        let mut reader = cluster.commit_log_reader("commit-log");
        let mut seen = Vec::new();
        while let Some(message) = reader.recv(Duration::from_millis(1)).await.unwrap() {
            seen.push(message.partition());
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn test_truncate_moves_low_watermark() {
        let cluster = MemoryCluster::new();
        cluster.create_topic("events", 1);
        for _ in 0..5 {
            cluster.produce("events", 0, None, Some("x"));
        }
        cluster.truncate_before("events", 0, 3);

        let consumer = cluster.consumer("group");
        let key = PartitionKey::new("events", 0);
        assert_eq!(
            consumer.watermarks(&key, Duration::from_secs(1)).unwrap(),
            (3, 5)
        );
    }
}
