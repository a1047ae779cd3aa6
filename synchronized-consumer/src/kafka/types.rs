use std::fmt;

use rdkafka::error::KafkaResult;
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::{Offset, TopicPartitionList};

/// One ordered shard of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    topic: String,
    partition_number: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for PartitionKey {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// Partition handed to this consumer by a rebalance, with the offset
/// delivery starts from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssignedPartition {
    partition: PartitionKey,
    starting_offset: i64,
}

impl AssignedPartition {
    pub fn new(partition: PartitionKey, starting_offset: i64) -> Self {
        Self {
            partition,
            starting_offset,
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn starting_offset(&self) -> i64 {
        self.starting_offset
    }
}

/// Rebalance notifications queued by the broker client and drained by
/// `SynchronizedConsumer::poll` on the caller's task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assign(Vec<PartitionKey>),
    Revoke(Vec<PartitionKey>),
}

impl RebalanceEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RebalanceEvent::Assign(_) => "assign",
            RebalanceEvent::Revoke(_) => "revoke",
        }
    }

    pub fn partitions(&self) -> &[PartitionKey] {
        match self {
            RebalanceEvent::Assign(partitions) | RebalanceEvent::Revoke(partitions) => partitions,
        }
    }
}

pub fn partitions_from_list(list: &TopicPartitionList) -> Vec<PartitionKey> {
    list.elements().into_iter().map(PartitionKey::from).collect()
}

pub fn to_partition_list(partitions: &[PartitionKey]) -> TopicPartitionList {
    let mut list = TopicPartitionList::with_capacity(partitions.len());
    for partition in partitions {
        list.add_partition(partition.topic(), partition.partition_number());
    }
    list
}

pub fn to_offset_list(offsets: &[(PartitionKey, i64)]) -> KafkaResult<TopicPartitionList> {
    let mut list = TopicPartitionList::with_capacity(offsets.len());
    for (partition, offset) in offsets {
        list.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(*offset),
        )?;
    }
    Ok(list)
}
