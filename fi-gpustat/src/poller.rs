use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::aggregate::aggregate;
use crate::error::CycleError;
use crate::jobs::parse_jobs;
use crate::nodes::parse_nodes;
use crate::parser::RecordKind;
use crate::runner::StatusSource;
use crate::snapshot::{CycleFailure, Snapshot, SnapshotStore};

/// Where the poller is within a collection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollerState {
    Idle,
    Collecting,
    Parsing,
    Aggregating,
    Published,
    Failed,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollerState::Idle => "idle",
            PollerState::Collecting => "collecting",
            PollerState::Parsing => "parsing",
            PollerState::Aggregating => "aggregating",
            PollerState::Published => "published",
            PollerState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

impl PollerState {
    pub fn can_transition_to(self, next: PollerState) -> bool {
        use PollerState::*;
        matches!(
            (self, next),
            (Idle, Collecting)
                | (Collecting, Parsing)
                | (Parsing, Aggregating)
                | (Aggregating, Published)
                | (Published, Idle)
                | (Failed, Idle)
                | (Collecting | Parsing | Aggregating, Failed)
        )
    }
}

/// Drives collection cycles and publishes their results to a [`SnapshotStore`].
///
/// Cycles run one after another on a single task. A failed cycle leaves the
/// last good Snapshot in place and is retried on the next tick
pub struct Poller<S> {
    source: S,
    store: SnapshotStore,
    interval: Duration,
    state: PollerState,
    /// Generation of the most recently published Snapshot
    generation: u64,
}

impl<S: StatusSource> Poller<S> {
    pub fn new(source: S, store: SnapshotStore, interval: Duration) -> Self {
        let generation = store.current().generation;
        Self {
            source,
            store,
            interval,
            state: PollerState::Idle,
            generation,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn transition(&mut self, next: PollerState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "poller transition");
        self.state = next;
    }

    /// Runs a single collect-parse-aggregate-publish cycle.
    ///
    /// A published cycle returns the poller to [`PollerState::Idle`]. On failure
    /// the store keeps its current Snapshot, the failure is recorded with
    /// [`SnapshotStore::record_failure`] and the poller stays in
    /// [`PollerState::Failed`] until the next cycle starts
    pub async fn run_cycle(&mut self) -> Result<Arc<Snapshot>, CycleError> {
        if self.state == PollerState::Failed {
            self.transition(PollerState::Idle);
        }

        let generation = self.generation + 1;
        match self.collect(generation).await {
            Ok(snapshot) => {
                let snapshot = self.store.publish(snapshot);
                self.generation = generation;
                self.transition(PollerState::Published);
                info!(
                    generation,
                    nodes = snapshot.nodes.len(),
                    jobs = snapshot.jobs.len(),
                    status = ?snapshot.status,
                    "published snapshot"
                );
                self.transition(PollerState::Idle);
                Ok(snapshot)
            }
            Err(err) => {
                let stage = err.stage();
                self.transition(PollerState::Failed);
                warn!(generation, %stage, error = %err, "poll cycle failed");
                self.store.record_failure(CycleFailure {
                    at: Utc::now(),
                    generation,
                    stage,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn collect(&mut self, generation: u64) -> Result<Snapshot, CycleError> {
        self.transition(PollerState::Collecting);
        let collected_at = Utc::now();
        let (nodes_out, jobs_out) = tokio::join!(
            self.source.fetch(RecordKind::Nodes),
            self.source.fetch(RecordKind::Jobs)
        );
        let nodes_out = nodes_out.map_err(|source| CycleError::Command {
            kind: RecordKind::Nodes,
            source,
        })?;
        let jobs_out = jobs_out.map_err(|source| CycleError::Command {
            kind: RecordKind::Jobs,
            source,
        })?;

        self.transition(PollerState::Parsing);
        let nodes = parse_nodes(&nodes_out)?;
        let jobs = parse_jobs(&jobs_out)?;
        for (kind, warnings) in [
            (RecordKind::Nodes, nodes.warning_count()),
            (RecordKind::Jobs, jobs.warning_count()),
        ] {
            if warnings > 0 {
                warn!(%kind, warnings, "skipped malformed lines");
            }
        }

        self.transition(PollerState::Aggregating);
        let aggregate = aggregate(&nodes.records, &jobs.records);

        Ok(Snapshot::from_parts(
            generation,
            collected_at,
            nodes,
            jobs,
            aggregate,
        ))
    }

    /// Runs a cycle on every tick of the poll interval until `shutdown`
    /// completes. The first cycle starts immediately; a cycle that outlasts the
    /// interval makes the poller skip the missed ticks instead of bunching them
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval = ?self.interval, "poller started");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    // errors are already logged and recorded in the store
                    let _ = self.run_cycle().await;
                }
            }
        }
        info!(generation = self.generation, "poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandError;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SINFO: &str = "\
gpu001|gpu|4/4/0/8|1000|500|gpu:a100:4|gpu:a100:2|mixed
gpu002|gpu|8/0/0/8|1000|1000|gpu:a100:4|gpu:a100:4|allocated
";
    const SQUEUE: &str =
        "1|alice|gpu|R|8|1|gres/gpu:2|100M|2024-05-01T08:00:00|2024-05-01T08:00:00|gpu001\n";

    type Reply = Result<String, CommandError>;

    /// Hands out canned outputs in order, one queue per command
    #[derive(Default)]
    struct Scripted {
        nodes: Mutex<VecDeque<Reply>>,
        jobs: Mutex<VecDeque<Reply>>,
    }

    impl Scripted {
        fn push(&self, nodes: Reply, jobs: Reply) {
            self.nodes.lock().unwrap().push_back(nodes);
            self.jobs.lock().unwrap().push_back(jobs);
        }
    }

    impl StatusSource for Scripted {
        async fn fetch(&self, kind: RecordKind) -> Result<String, CommandError> {
            let queue = match kind {
                RecordKind::Nodes => &self.nodes,
                RecordKind::Jobs => &self.jobs,
            };
            let reply = queue.lock().unwrap().pop_front();
            reply.unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn ok(s: &str) -> Reply {
        Ok(s.to_string())
    }

    fn poller(source: Scripted) -> Poller<Scripted> {
        Poller::new(source, SnapshotStore::new(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn successful_cycle_publishes() {
        let source = Scripted::default();
        source.push(ok(SINFO), ok(SQUEUE));
        let mut poller = poller(source);
        assert_eq!(poller.state(), PollerState::Idle);
        assert!(poller.store().current().is_placeholder());

        let snapshot = poller.run_cycle().await.unwrap();
        // back to waiting for the next tick
        assert_eq!(poller.state(), PollerState::Idle);
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.partitions[0].cpus.total, 16);
        assert_eq!(snapshot.partitions[0].cpus.allocated, 12);
        assert_eq!(snapshot.leaderboards.running.entries[0].user, "alice");
        assert!(Arc::ptr_eq(&snapshot, &poller.store().current()));
    }

    #[tokio::test]
    async fn failed_command_keeps_previous_snapshot() {
        let source = Scripted::default();
        source.push(ok(SINFO), ok(SQUEUE));
        source.push(
            Err(CommandError::NotFound {
                program: "sinfo".to_string(),
            }),
            ok(SQUEUE),
        );
        source.push(ok(SINFO), ok(""));
        let mut poller = poller(source);

        let first = poller.run_cycle().await.unwrap();

        let err = poller.run_cycle().await.unwrap_err();
        assert_eq!(err.stage(), PollerState::Collecting);
        assert_eq!(poller.state(), PollerState::Failed);
        assert!(Arc::ptr_eq(&first, &poller.store().current()));
        let failure = poller.store().last_failure().unwrap();
        assert_eq!(failure.generation, 2);
        assert_eq!(failure.stage, PollerState::Collecting);
        assert!(failure.message.contains("sinfo"));

        // the next cycle starts from Idle again and reuses the generation
        let third = poller.run_cycle().await.unwrap();
        assert_eq!(third.generation, 2);
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[tokio::test]
    async fn unreadable_job_output_keeps_previous_snapshot() {
        let source = Scripted::default();
        source.push(ok(SINFO), ok(SQUEUE));
        source.push(ok(SINFO), ok("squeue: error: Invalid user for SlurmUser\n"));
        let mut poller = poller(source);

        let first = poller.run_cycle().await.unwrap();

        let err = poller.run_cycle().await.unwrap_err();
        assert_eq!(err.stage(), PollerState::Parsing);
        assert_eq!(poller.state(), PollerState::Failed);
        assert!(Arc::ptr_eq(&first, &poller.store().current()));
        assert_eq!(poller.store().current().generation, 1);

        let failure = poller.store().last_failure().unwrap();
        assert_eq!(failure.stage, PollerState::Parsing);
        assert_eq!(failure.generation, 2);
    }

    #[tokio::test]
    async fn unrecognized_output_fails_in_parsing() {
        let source = Scripted::default();
        source.push(ok("sinfo: error: Unable to contact slurm controller\n"), ok(SQUEUE));
        let mut poller = poller(source);

        let err = poller.run_cycle().await.unwrap_err();
        assert_eq!(err.stage(), PollerState::Parsing);
        assert!(poller.store().current().is_placeholder());
    }

    #[tokio::test]
    async fn malformed_lines_still_publish() {
        let source = Scripted::default();
        source.push(ok(&format!("{SINFO}garbage\n")), ok(SQUEUE));
        let mut poller = poller(source);

        let snapshot = poller.run_cycle().await.unwrap();
        assert_eq!(
            snapshot.status,
            crate::snapshot::CollectionStatus::Partial {
                node_warnings: 1,
                job_warnings: 0
            }
        );
    }

    #[test]
    fn transitions() {
        use PollerState::*;
        assert!(Idle.can_transition_to(Collecting));
        assert!(Aggregating.can_transition_to(Published));
        assert!(Parsing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Idle));
        assert!(Published.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Published));
        assert!(!Published.can_transition_to(Collecting));
        assert!(!Idle.can_transition_to(Failed));
    }

    /// Takes longer than the poll interval on every fetch
    struct Slow {
        active: AtomicUsize,
        max_active: AtomicUsize,
        cycles: AtomicUsize,
    }

    impl StatusSource for Arc<Slow> {
        async fn fetch(&self, kind: RecordKind) -> Result<String, CommandError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if kind == RecordKind::Nodes {
                self.cycles.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_secs(25)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cycles_never_overlap() {
        let slow = Arc::new(Slow {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            cycles: AtomicUsize::new(0),
        });
        let store = SnapshotStore::new();
        let poller = Poller::new(Arc::clone(&slow), store.clone(), Duration::from_secs(10));

        poller
            .run(tokio::time::sleep(Duration::from_secs(90)))
            .await;

        // one node and one job fetch at a time, from the same cycle
        assert_eq!(slow.max_active.load(Ordering::SeqCst), 2);
        // 25s cycles on a 10s interval run back to back at 0, 25, 50 and 75
        // instead of catching up on the ticks they missed
        assert_eq!(slow.cycles.load(Ordering::SeqCst), 4);
        assert_eq!(store.current().generation, 4);
    }
}
