use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::OwnedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::time::timeout;
use tracing::debug;

use crate::kafka::context::{RebalanceEventReceiver, SynchronizedConsumerContext};
use crate::kafka::types::{to_offset_list, to_partition_list, PartitionKey, RebalanceEvent};

/// The broker client capabilities the primary reader relies on.
///
/// `KafkaBrokerConsumer` is the production implementation. Implementations
/// must start newly assigned partitions paused and report every rebalance
/// through `drain_rebalance_events`.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    fn subscribe(&self, topics: &[&str]) -> KafkaResult<()>;

    fn unsubscribe(&self);

    /// Wait up to `timeout` for the next message of a resumed partition.
    async fn recv(&self, timeout: Duration) -> KafkaResult<Option<OwnedMessage>>;

    /// Rebalance events observed since the last call, oldest first.
    fn drain_rebalance_events(&self) -> Vec<RebalanceEvent>;

    fn pause(&self, partitions: &[PartitionKey]) -> KafkaResult<()>;

    fn resume(&self, partitions: &[PartitionKey]) -> KafkaResult<()>;

    fn seek(&self, partition: &PartitionKey, offset: i64, timeout: Duration) -> KafkaResult<()>;

    fn commit(&self, offsets: &[(PartitionKey, i64)], mode: CommitMode) -> KafkaResult<()>;

    /// Offsets committed by this consumer's group, `None` where nothing was committed.
    fn committed(
        &self,
        partitions: &[PartitionKey],
        timeout: Duration,
    ) -> KafkaResult<HashMap<PartitionKey, Option<i64>>>;

    /// Current fetch position of every assigned partition.
    fn position(&self) -> KafkaResult<HashMap<PartitionKey, Option<i64>>>;

    /// Low and high watermark of a partition.
    fn watermarks(&self, partition: &PartitionKey, timeout: Duration) -> KafkaResult<(i64, i64)>;
}

fn offsets_by_partition(list: &TopicPartitionList) -> HashMap<PartitionKey, Option<i64>> {
    list.elements()
        .into_iter()
        .map(|elem| {
            let offset = match elem.offset() {
                Offset::Offset(offset) if offset >= 0 => Some(offset),
                _ => None,
            };
            (PartitionKey::from(elem), offset)
        })
        .collect()
}

pub struct KafkaBrokerConsumer {
    consumer: StreamConsumer<SynchronizedConsumerContext>,
    rebalance_rx: Mutex<RebalanceEventReceiver>,
}

impl KafkaBrokerConsumer {
    pub fn from_config(config: &ClientConfig) -> KafkaResult<Self> {
        let (context, rebalance_rx) = SynchronizedConsumerContext::new();
        let consumer: StreamConsumer<SynchronizedConsumerContext> =
            config.create_with_context(context)?;

        Ok(Self {
            consumer,
            rebalance_rx: Mutex::new(rebalance_rx),
        })
    }
}

#[async_trait]
impl BrokerConsumer for KafkaBrokerConsumer {
    fn subscribe(&self, topics: &[&str]) -> KafkaResult<()> {
        self.consumer.subscribe(topics)
    }

    fn unsubscribe(&self) {
        self.consumer.unsubscribe();
    }

    async fn recv(&self, wait: Duration) -> KafkaResult<Option<OwnedMessage>> {
        match timeout(wait, self.consumer.recv()).await {
            Ok(Ok(message)) => Ok(Some(message.detach())),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!("Consumer poll timeout");
                Ok(None)
            }
        }
    }

    fn drain_rebalance_events(&self) -> Vec<RebalanceEvent> {
        let mut rx = self.rebalance_rx.lock();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn pause(&self, partitions: &[PartitionKey]) -> KafkaResult<()> {
        self.consumer.pause(&to_partition_list(partitions))
    }

    fn resume(&self, partitions: &[PartitionKey]) -> KafkaResult<()> {
        self.consumer.resume(&to_partition_list(partitions))
    }

    fn seek(&self, partition: &PartitionKey, offset: i64, timeout: Duration) -> KafkaResult<()> {
        self.consumer.seek(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset),
            timeout,
        )
    }

    fn commit(&self, offsets: &[(PartitionKey, i64)], mode: CommitMode) -> KafkaResult<()> {
        self.consumer.commit(&to_offset_list(offsets)?, mode)
    }

    fn committed(
        &self,
        partitions: &[PartitionKey],
        timeout: Duration,
    ) -> KafkaResult<HashMap<PartitionKey, Option<i64>>> {
        let committed = self
            .consumer
            .committed_offsets(to_partition_list(partitions), timeout)?;
        Ok(offsets_by_partition(&committed))
    }

    fn position(&self) -> KafkaResult<HashMap<PartitionKey, Option<i64>>> {
        Ok(offsets_by_partition(&self.consumer.position()?))
    }

    fn watermarks(&self, partition: &PartitionKey, timeout: Duration) -> KafkaResult<(i64, i64)> {
        self.consumer
            .fetch_watermarks(partition.topic(), partition.partition_number(), timeout)
    }
}

/// Convenience for callers holding a delivered message.
pub fn next_offset_of<M: Message>(message: &M) -> (PartitionKey, i64) {
    (
        PartitionKey::new(message.topic(), message.partition()),
        message.offset() + 1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_by_partition_maps_unset_offsets_to_none() {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset("events", 0, Offset::Offset(12))
            .unwrap();
        list.add_partition_offset("events", 1, Offset::Invalid)
            .unwrap();

        let offsets = offsets_by_partition(&list);
        assert_eq!(offsets[&PartitionKey::new("events", 0)], Some(12));
        assert_eq!(offsets[&PartitionKey::new("events", 1)], None);
    }
}
