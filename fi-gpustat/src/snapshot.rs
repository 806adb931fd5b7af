use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::aggregate::{Aggregate, ClusterTotals, GpuTypeSummary, Leaderboards, PartitionSummary};
use crate::jobs::JobRecord;
use crate::nodes::NodeRecord;
use crate::parser::Parsed;
use crate::poller::PollerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum CollectionStatus {
    /// Nothing has been collected yet
    Placeholder,
    Complete,
    /// Published, but some lines of command output were skipped
    Partial {
        node_warnings: usize,
        job_warnings: usize,
    },
}

/// Everything known about the cluster as of one successful poll cycle.
///
/// Never modified after it is built; a newer cycle produces a new Snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Increments by one for every published Snapshot, starting at 1.
    /// The placeholder is generation 0
    pub generation: u64,
    pub collected_at: DateTime<Utc>,
    pub status: CollectionStatus,
    pub nodes: Vec<NodeRecord>,
    pub jobs: Vec<JobRecord>,
    pub partitions: Vec<PartitionSummary>,
    pub gpu_types: Vec<GpuTypeSummary>,
    pub cluster: ClusterTotals,
    pub leaderboards: Leaderboards,
    pub occupancy: BTreeMap<String, Vec<String>>,
}

impl Snapshot {
    pub fn placeholder() -> Self {
        Self::assemble(
            0,
            Utc::now(),
            CollectionStatus::Placeholder,
            Vec::new(),
            Vec::new(),
            Aggregate::empty(),
        )
    }

    pub fn from_parts(
        generation: u64,
        collected_at: DateTime<Utc>,
        nodes: Parsed<NodeRecord>,
        jobs: Parsed<JobRecord>,
        aggregate: Aggregate,
    ) -> Self {
        let status = match (nodes.warning_count(), jobs.warning_count()) {
            (0, 0) => CollectionStatus::Complete,
            (node_warnings, job_warnings) => CollectionStatus::Partial {
                node_warnings,
                job_warnings,
            },
        };
        Self::assemble(
            generation,
            collected_at,
            status,
            nodes.records,
            jobs.records,
            aggregate,
        )
    }

    fn assemble(
        generation: u64,
        collected_at: DateTime<Utc>,
        status: CollectionStatus,
        nodes: Vec<NodeRecord>,
        jobs: Vec<JobRecord>,
        aggregate: Aggregate,
    ) -> Self {
        let Aggregate {
            partitions,
            gpu_types,
            cluster,
            leaderboards,
            occupancy,
        } = aggregate;
        Self {
            generation,
            collected_at,
            status,
            nodes,
            jobs,
            partitions,
            gpu_types,
            cluster,
            leaderboards,
            occupancy,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.status == CollectionStatus::Placeholder
    }

    /// How old the data is; zero if the clock went backwards
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        (now - self.collected_at).max(TimeDelta::zero())
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionSummary> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// A node's record from whichever partition lists it first; capacity and
    /// state are the same in all of them
    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Users with running jobs on a node, sorted
    pub fn users_on(&self, node: &str) -> &[String] {
        self.occupancy.get(node).map(Vec::as_slice).unwrap_or_default()
    }
}

/// A cycle that ended without publishing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleFailure {
    pub at: DateTime<Utc>,
    /// The generation the failed cycle would have published
    pub generation: u64,
    pub stage: PollerState,
    pub message: String,
}

/// Holds the current Snapshot and hands out shared, read-only references to it.
///
/// Publishing replaces the whole `Arc`, so a reader holding a Snapshot keeps a
/// consistent view while newer ones are published. Cloning the store gives
/// another handle to the same slot
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    current: Arc<watch::Sender<Arc<Snapshot>>>,
    last_failure: Arc<watch::Sender<Option<Arc<CycleFailure>>>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    /// A store holding the placeholder Snapshot
    pub fn new() -> Self {
        let (current, _) = watch::channel(Arc::new(Snapshot::placeholder()));
        let (last_failure, _) = watch::channel(None);
        Self {
            current: Arc::new(current),
            last_failure: Arc::new(last_failure),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.current.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.borrow())
    }

    /// Notified on every publish. Mark the value seen with
    /// `borrow_and_update` to wait for the next one
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.current.subscribe()
    }

    pub fn record_failure(&self, failure: CycleFailure) {
        self.last_failure.send_replace(Some(Arc::new(failure)));
    }

    pub fn last_failure(&self) -> Option<Arc<CycleFailure>> {
        self.last_failure.borrow().clone()
    }

    /// Notified on every recorded failure
    pub fn subscribe_failures(&self) -> watch::Receiver<Option<Arc<CycleFailure>>> {
        self.last_failure.subscribe()
    }
}
