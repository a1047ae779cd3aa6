//! Scenarios against a real broker on localhost:9092.
//!
//! Run with `cargo test -- --ignored` while the dev Kafka is up.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use synchronized_consumer::{
    AssignedPartition, Config, KafkaBrokerConsumer, PartitionKey, SynchronizedConsumer,
};
use uuid::Uuid;

mod common;
use common::{
    assert_nothing_delivered, init_tracing, poll_for_message, poll_until_watermark,
    RebalanceRecorder, SYNC_GROUP,
};

const KAFKA_BROKERS: &str = "localhost:9092";
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

struct TestTopics {
    topic: String,
    commit_log: String,
    group: String,
}

impl TestTopics {
    fn new() -> Self {
        let id = Uuid::now_v7().simple().to_string();
        Self {
            topic: format!("synchronized-consumer-events-{id}"),
            commit_log: format!("synchronized-consumer-commit-log-{id}"),
            group: format!("synchronized-consumer-test-{id}"),
        }
    }

    fn key(&self, partition: i32) -> PartitionKey {
        PartitionKey::new(self.topic.as_str(), partition)
    }

    fn config(&self) -> Config {
        Config {
            kafka_hosts: KAFKA_BROKERS.to_string(),
            kafka_tls: false,
            kafka_consumer_group: self.group.clone(),
            kafka_client_id: None,
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_session_timeout_ms: 6000,
            kafka_operation_timeout_ms: 5000,
            commit_log_topic: self.commit_log.clone(),
            commit_log_offset_reset: "earliest".to_string(),
            commit_log_poll_timeout_ms: 100,
            synchronize_commit_group: SYNC_GROUP.to_string(),
        }
    }
}

async fn create_topics(topics: &TestTopics, partitions: i32) -> Result<()> {
    let admin_client: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", KAFKA_BROKERS)
        .create()?;

    let new_topics = [
        NewTopic::new(&topics.topic, partitions, TopicReplication::Fixed(1)),
        NewTopic::new(&topics.commit_log, 1, TopicReplication::Fixed(1)),
    ];
    admin_client
        .create_topics(&new_topics, &AdminOptions::new())
        .await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}

async fn produce(topic: &str, partition: i32, key: Option<&str>, payload: &str) -> Result<()> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", KAFKA_BROKERS)
        .set("message.timeout.ms", "5000")
        .create()?;

    let mut record = FutureRecord::to(topic).partition(partition).payload(payload);
    if let Some(key) = key {
        record = record.key(key);
    }
    producer
        .send(record, Timeout::After(Duration::from_secs(5)))
        .await
        .map_err(|(e, _)| anyhow::anyhow!("Failed to send message: {e}"))?;
    Ok(())
}

async fn publish_watermark(topics: &TestTopics, partition: i32, offset: i64) -> Result<()> {
    produce(
        &topics.commit_log,
        0,
        Some(&format!("{}:{partition}:{SYNC_GROUP}", topics.topic)),
        &offset.to_string(),
    )
    .await
}

async fn wait_for_assignment(
    consumer: &mut SynchronizedConsumer<KafkaBrokerConsumer>,
    recorder: &RebalanceRecorder,
) {
    for _ in 0..60 {
        if recorder.last_assignment().is_some_and(|a| !a.is_empty()) {
            return;
        }
        assert!(consumer.poll(POLL_TIMEOUT).await.unwrap().is_none());
    }
    panic!("consumer was never assigned partitions");
}

#[tokio::test]
#[ignore = "requires a Kafka broker on localhost:9092"]
async fn test_kafka_consumes_from_partition_start() -> Result<()> {
    init_tracing();
    let topics = TestTopics::new();
    create_topics(&topics, 1).await?;
    for payload in ["0", "1", "2"] {
        produce(&topics.topic, 0, None, payload).await?;
    }

    let recorder = RebalanceRecorder::new();
    let mut consumer = SynchronizedConsumer::from_config(&topics.config())?;
    consumer.subscribe(
        &[topics.topic.as_str()],
        recorder.on_assign(),
        recorder.on_revoke(),
    )?;

    wait_for_assignment(&mut consumer, &recorder).await;
    assert_eq!(
        recorder.last_assignment(),
        Some(vec![AssignedPartition::new(topics.key(0), 0)])
    );
    assert_nothing_delivered(&mut consumer, 3, POLL_TIMEOUT).await;

    publish_watermark(&topics, 0, 1).await?;
    let message = poll_for_message(&mut consumer, 60, POLL_TIMEOUT)
        .await?
        .expect("offset 0 should be released by watermark 1");
    assert_eq!(message.offset(), 0);
    assert_nothing_delivered(&mut consumer, 3, POLL_TIMEOUT).await;

    consumer.commit_message(&message, CommitMode::Sync)?;
    consumer.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Kafka broker on localhost:9092"]
async fn test_kafka_consumes_from_committed_offset() -> Result<()> {
    init_tracing();
    let topics = TestTopics::new();
    create_topics(&topics, 1).await?;
    for payload in ["0", "1", "2"] {
        produce(&topics.topic, 0, None, payload).await?;
    }

    // Mark offset 0 as consumed by the caller's group
    let committer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", KAFKA_BROKERS)
        .set("group.id", &topics.group)
        .create()?;
    let mut offsets = TopicPartitionList::new();
    offsets.add_partition_offset(&topics.topic, 0, Offset::Offset(1))?;
    committer.commit(&offsets, CommitMode::Sync)?;
    drop(committer);

    let recorder = RebalanceRecorder::new();
    let mut consumer = SynchronizedConsumer::from_config(&topics.config())?;
    consumer.subscribe(
        &[topics.topic.as_str()],
        recorder.on_assign(),
        recorder.on_revoke(),
    )?;

    wait_for_assignment(&mut consumer, &recorder).await;
    assert_eq!(
        recorder.last_assignment(),
        Some(vec![AssignedPartition::new(topics.key(0), 1)])
    );

    publish_watermark(&topics, 0, 1).await?;
    poll_until_watermark(&mut consumer, &topics.key(0), 1, 60).await;
    assert_nothing_delivered(&mut consumer, 3, POLL_TIMEOUT).await;

    publish_watermark(&topics, 0, 2).await?;
    let message = poll_for_message(&mut consumer, 60, POLL_TIMEOUT)
        .await?
        .expect("offset 1 should be released by watermark 2");
    assert_eq!(message.offset(), 1);

    consumer.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Kafka broker on localhost:9092"]
async fn test_kafka_rebalance_between_instances() -> Result<()> {
    init_tracing();
    let topics = TestTopics::new();
    create_topics(&topics, 2).await?;

    let first_recorder = RebalanceRecorder::new();
    let mut first = SynchronizedConsumer::from_config(&topics.config())?;
    first.subscribe(
        &[topics.topic.as_str()],
        first_recorder.on_assign(),
        first_recorder.on_revoke(),
    )?;
    wait_for_assignment(&mut first, &first_recorder).await;
    assert_eq!(first.assignment().len(), 2);

    let second_recorder = RebalanceRecorder::new();
    let mut second = SynchronizedConsumer::from_config(&topics.config())?;
    second.subscribe(
        &[topics.topic.as_str()],
        second_recorder.on_assign(),
        second_recorder.on_revoke(),
    )?;

    // Both members have to keep polling for the group to settle
    for _ in 0..60 {
        if first.assignment().len() == 1 && second.assignment().len() == 1 {
            break;
        }
        assert!(first.poll(POLL_TIMEOUT).await?.is_none());
        assert!(second.poll(POLL_TIMEOUT).await?.is_none());
    }

    let first_assignment = first_recorder.last_assignment().unwrap_or_default();
    let second_assignment = second_recorder.last_assignment().unwrap_or_default();
    assert_eq!(first_assignment.len(), 1);
    assert_eq!(second_assignment.len(), 1);

    let union: HashSet<PartitionKey> = first_assignment
        .iter()
        .chain(second_assignment.iter())
        .map(|p| p.partition().clone())
        .collect();
    assert_eq!(union, HashSet::from([topics.key(0), topics.key(1)]));

    first.close().await;
    second.close().await;
    Ok(())
}
