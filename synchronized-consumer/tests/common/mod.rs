//! Shared helpers for the synchronized consumer integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::message::OwnedMessage;
use synchronized_consumer::{
    AssignedPartition, BrokerConsumer, ConsumerError, PartitionKey, SynchronizedConsumer,
};
use tracing_subscriber::EnvFilter;

pub const SYNC_GROUP: &str = "snuba-consumers";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Records every assignment and revocation handed to the callbacks.
#[derive(Clone, Default)]
pub struct RebalanceRecorder {
    assigned: Arc<Mutex<Vec<Vec<AssignedPartition>>>>,
    revoked: Arc<Mutex<Vec<Vec<PartitionKey>>>>,
}

impl RebalanceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_assign(&self) -> impl FnMut(&[AssignedPartition]) -> anyhow::Result<()> + Send {
        let assigned = self.assigned.clone();
        move |partitions| {
            assigned.lock().unwrap().push(partitions.to_vec());
            Ok(())
        }
    }

    pub fn on_revoke(&self) -> impl FnMut(&[PartitionKey]) -> anyhow::Result<()> + Send {
        let revoked = self.revoked.clone();
        move |partitions| {
            revoked.lock().unwrap().push(partitions.to_vec());
            Ok(())
        }
    }

    pub fn assignments(&self) -> Vec<Vec<AssignedPartition>> {
        self.assigned.lock().unwrap().clone()
    }

    pub fn revocations(&self) -> Vec<Vec<PartitionKey>> {
        self.revoked.lock().unwrap().clone()
    }

    pub fn last_assignment(&self) -> Option<Vec<AssignedPartition>> {
        self.assigned.lock().unwrap().last().cloned()
    }
}

/// Poll `attempts` times, asserting that nothing is delivered.
pub async fn assert_nothing_delivered<B: BrokerConsumer>(
    consumer: &mut SynchronizedConsumer<B>,
    attempts: usize,
    timeout: Duration,
) {
    for _ in 0..attempts {
        let polled = consumer.poll(timeout).await.unwrap();
        assert!(
            polled.is_none(),
            "unexpected delivery of offset {:?}",
            polled.map(|m| rdkafka::Message::offset(&m))
        );
    }
}

/// Poll until a message arrives or `attempts` polls came back empty.
pub async fn poll_for_message<B: BrokerConsumer>(
    consumer: &mut SynchronizedConsumer<B>,
    attempts: usize,
    timeout: Duration,
) -> Result<Option<OwnedMessage>, ConsumerError> {
    for _ in 0..attempts {
        if let Some(message) = consumer.poll(timeout).await? {
            return Ok(Some(message));
        }
    }
    Ok(None)
}

/// Poll until `partition` has observed a watermark of at least `offset`.
pub async fn poll_until_watermark<B: BrokerConsumer>(
    consumer: &mut SynchronizedConsumer<B>,
    partition: &PartitionKey,
    offset: i64,
    attempts: usize,
) {
    for _ in 0..attempts {
        let reached = consumer
            .partition_state(partition)
            .and_then(|s| s.remote_offset())
            .is_some_and(|remote| remote >= offset);
        if reached {
            return;
        }
        let polled = consumer.poll(Duration::from_millis(50)).await.unwrap();
        assert!(polled.is_none(), "delivered a message while waiting for the watermark");
    }
    panic!("{partition} never observed watermark {offset}");
}
