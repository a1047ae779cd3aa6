//! Partition State Table - per-partition gating bookkeeping
//!
//! The table is the only state shared between the primary reader and the
//! watermark tracker. Every operation takes the single table lock, so any
//! interleaving of assign / revoke / apply_watermark / record_local_offset
//! leaves the table consistent. Reads are bounded by poll cadence rather than
//! message throughput, so one lock is enough.
//!
//! Entries are recreated on every assignment: a watermark observed before a
//! revoke is never carried over to a later assignment of the same partition.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::kafka::types::{AssignedPartition, PartitionKey};

/// Gating status of an assigned partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionStatus {
    /// No commit-log record seen for this partition since it was assigned
    AwaitingWatermark,
    /// Local position has caught up with the synchronize group
    Gated,
    /// There are messages below the watermark left to deliver
    Eligible,
}

impl PartitionStatus {
    pub fn is_paused(&self) -> bool {
        !matches!(self, PartitionStatus::Eligible)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionStatus::AwaitingWatermark => "awaiting_watermark",
            PartitionStatus::Gated => "gated",
            PartitionStatus::Eligible => "eligible",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionState {
    /// Next offset this consumer will deliver
    local_offset: i64,
    /// Next offset the synchronize group will read, as reported by the commit log
    remote_offset: Option<i64>,
    /// Assignment generation that created this entry
    generation: u64,
}

impl PartitionState {
    fn new(local_offset: i64, generation: u64) -> Self {
        Self {
            local_offset,
            remote_offset: None,
            generation,
        }
    }

    pub fn local_offset(&self) -> i64 {
        self.local_offset
    }

    pub fn remote_offset(&self) -> Option<i64> {
        self.remote_offset
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> PartitionStatus {
        match self.remote_offset {
            None => PartitionStatus::AwaitingWatermark,
            Some(remote) if self.local_offset < remote => PartitionStatus::Eligible,
            Some(_) => PartitionStatus::Gated,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.status().is_paused()
    }

    pub fn may_deliver(&self, offset: i64) -> bool {
        self.remote_offset.is_some_and(|remote| offset < remote)
    }
}

/// Current set of owned partitions, tagged with the generation that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    generation: u64,
    partitions: BTreeSet<PartitionKey>,
}

impl Assignment {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn partitions(&self) -> &BTreeSet<PartitionKey> {
        &self.partitions
    }

    pub fn contains(&self, partition: &PartitionKey) -> bool {
        self.partitions.contains(partition)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Split of the assignment into partitions that may be consumed and those
/// that must stay paused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadySnapshot {
    pub ready: HashSet<PartitionKey>,
    pub ineligible: HashSet<PartitionKey>,
}

#[derive(Default)]
struct TableInner {
    partitions: HashMap<PartitionKey, PartitionState>,
    generation: u64,
}

#[derive(Default)]
pub struct PartitionStateTable {
    inner: Mutex<TableInner>,
    /// Signalled when a watermark update makes a partition eligible
    watermark_advanced: Notify,
}

impl PartitionStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create fresh entries for newly assigned partitions. Existing entries
    /// for the same keys are replaced. Returns the new generation.
    pub fn assign(&self, partitions: &[AssignedPartition]) -> u64 {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let generation = inner.generation;

        for assigned in partitions {
            let previous = inner.partitions.insert(
                assigned.partition().clone(),
                PartitionState::new(assigned.starting_offset(), generation),
            );
            if previous.is_some() {
                debug!(
                    topic = assigned.topic(),
                    partition = assigned.partition_number(),
                    "Discarding state from previous assignment"
                );
            }
        }

        generation
    }

    /// Drop entries for revoked partitions. Returns the new generation.
    pub fn revoke(&self, partitions: &[PartitionKey]) -> u64 {
        let mut inner = self.inner.lock();
        inner.generation += 1;

        for partition in partitions {
            inner.partitions.remove(partition);
        }

        inner.generation
    }

    /// Advance the next offset to deliver. Returns false when the partition is
    /// no longer assigned.
    pub fn record_local_offset(&self, partition: &PartitionKey, offset: i64) -> bool {
        let mut inner = self.inner.lock();
        let Some(state) = inner.partitions.get_mut(partition) else {
            return false;
        };

        if offset < state.local_offset {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                current = state.local_offset,
                requested = offset,
                "Ignoring attempt to move local offset backwards"
            );
        } else {
            state.local_offset = offset;
        }
        true
    }

    /// Merge a watermark reported by the commit log. Returns the resulting
    /// status, or `None` when the partition is not assigned.
    pub fn apply_watermark(&self, partition: &PartitionKey, offset: i64) -> Option<PartitionStatus> {
        let (before, after) = {
            let mut inner = self.inner.lock();
            let state = inner.partitions.get_mut(partition)?;

            let before = state.status();
            let remote = state.remote_offset.unwrap_or(0).max(offset);
            state.remote_offset = Some(remote);
            (before, state.status())
        };

        if before != PartitionStatus::Eligible && after == PartitionStatus::Eligible {
            self.watermark_advanced.notify_one();
        }

        Some(after)
    }

    pub fn snapshot_ready_partitions(&self) -> ReadySnapshot {
        let inner = self.inner.lock();
        let mut snapshot = ReadySnapshot::default();

        for (partition, state) in &inner.partitions {
            if state.is_paused() {
                snapshot.ineligible.insert(partition.clone());
            } else {
                snapshot.ready.insert(partition.clone());
            }
        }

        snapshot
    }

    /// Whether a message at `offset` is below the partition's watermark.
    pub fn may_deliver(&self, partition: &PartitionKey, offset: i64) -> bool {
        self.inner
            .lock()
            .partitions
            .get(partition)
            .is_some_and(|state| state.may_deliver(offset))
    }

    pub fn get(&self, partition: &PartitionKey) -> Option<PartitionState> {
        self.inner.lock().partitions.get(partition).cloned()
    }

    pub fn status(&self, partition: &PartitionKey) -> Option<PartitionStatus> {
        self.inner
            .lock()
            .partitions
            .get(partition)
            .map(PartitionState::status)
    }

    pub fn assignment(&self) -> Assignment {
        let inner = self.inner.lock();
        Assignment {
            generation: inner.generation,
            partitions: inner.partitions.keys().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().partitions.is_empty()
    }

    /// Resolves once a watermark update has made some partition eligible.
    /// A notification sent while nobody is waiting is kept for the next waiter.
    pub fn watermark_advanced(&self) -> Notified<'_> {
        self.watermark_advanced.notified()
    }
}
