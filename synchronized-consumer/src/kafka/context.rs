use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kafka::types::{partitions_from_list, RebalanceEvent};
use crate::metrics_consts::REBALANCE_EMPTY_SKIPPED;

/// Sender for rebalance events - held by the consumer context
pub type RebalanceEventSender = mpsc::UnboundedSender<RebalanceEvent>;
/// Receiver for rebalance events - drained by the primary reader on every poll
pub type RebalanceEventReceiver = mpsc::UnboundedReceiver<RebalanceEvent>;

/// Context of the primary consumer.
///
/// librdkafka invokes the rebalance hooks from inside a consumer poll. The
/// hooks only do the work that must happen before messages can flow:
/// newly assigned partitions are paused on the spot, then the event is
/// queued. The caller-visible callbacks run later, when
/// `SynchronizedConsumer::poll` drains the queue.
pub struct SynchronizedConsumerContext {
    rebalance_tx: RebalanceEventSender,
}

impl SynchronizedConsumerContext {
    pub fn new() -> (Self, RebalanceEventReceiver) {
        let (rebalance_tx, rebalance_rx) = mpsc::unbounded_channel();
        (Self { rebalance_tx }, rebalance_rx)
    }

    fn send(&self, event: RebalanceEvent) {
        if let Err(e) = self.rebalance_tx.send(event) {
            error!("Failed to queue rebalance event: {}", e);
        }
    }
}

impl ClientContext for SynchronizedConsumerContext {}

impl ConsumerContext for SynchronizedConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);

        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky sends these whenever group membership changes
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED).increment(1);
                    return;
                }

                info!("Revoking {} partitions", partitions.count());
                self.send(RebalanceEvent::Revoke(partitions_from_list(partitions)));
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance event: {:?}", rebalance);

        match rebalance {
            Rebalance::Assign(partitions) => {
                // Nothing may be fetched before the commit log has been
                // consulted, so pause before librdkafka starts fetching.
                if partitions.count() > 0 {
                    if let Err(e) = base_consumer.pause(partitions) {
                        error!(
                            "Failed to pause {} newly assigned partitions: {}",
                            partitions.count(),
                            e
                        );
                    } else {
                        info!(
                            "Paused {} newly assigned partitions until their watermark is known",
                            partitions.count()
                        );
                    }
                }

                self.send(RebalanceEvent::Assign(partitions_from_list(partitions)));
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}

/// Context of the commit-log consumer. Its rebalances are internal to the
/// watermark tracker and never reach the caller.
#[derive(Default)]
pub struct CommitLogConsumerContext;

impl ClientContext for CommitLogConsumerContext {}

impl ConsumerContext for CommitLogConsumerContext {
    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(
                    "Commit log consumer assigned {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Revoke(partitions) => {
                info!(
                    "Commit log consumer revoked {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Commit log consumer rebalance error: {}", e);
            }
        }
    }
}
