use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::jobs::{JobRecord, JobState};
use crate::nodes::{Capacity, NodeRecord};

// from https://developer.nvidia.com/cuda-gpus, used to list GPU types newest first
const CAPABILITY: &[(&str, f32)] = &[
    ("b200", 10.0),
    ("h200", 9.0),
    ("h100", 9.0),
    ("gh200", 9.0),
    ("l40s", 8.9),
    ("l40", 8.9),
    ("l4", 8.9),
    ("a100", 8.0),
    ("a40", 8.6),
    ("a30", 8.0),
    ("a10", 8.6),
    ("a16", 8.6),
    ("rtx6k", 7.5),
    ("rtx8k", 7.5),
    ("t4", 7.5),
    ("v100", 7.0),
    ("gv100gl", 7.0),
    ("p100", 6.0),
    ("p40", 6.1),
    ("m40", 5.2),
];

// types missing from the table sort ahead of the known ones, as they are most
// likely newer hardware
const UNKNOWN_CAPABILITY: f32 = 10.0;

/// Compute capability of a GPU type, matched on the leading model name so that
/// `a100-sxm4-80gb` and `h100_pcie` resolve to `a100` and `h100`
pub fn gpu_capability(gpu_type: &str) -> Option<f32> {
    let lowered = gpu_type.to_ascii_lowercase();
    let model = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .next()
        .unwrap_or_default();
    CAPABILITY
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, capability)| *capability)
}

/// Orders GPU types newest hardware first, by name within one capability
fn newest_first(a: &str, b: &str) -> Ordering {
    let a_cap = gpu_capability(a).unwrap_or(UNKNOWN_CAPABILITY);
    let b_cap = gpu_capability(b).unwrap_or(UNKNOWN_CAPABILITY);
    b_cap.total_cmp(&a_cap).then_with(|| a.cmp(b))
}

/// allocated / total, clamped into [0, 1]; zero capacity is zero utilization
pub fn ratio(allocated: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (allocated as f64 / total as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Utilization {
    pub cpu: f64,
    pub memory: f64,
    pub gpu: f64,
}

impl Utilization {
    fn of(cpus: Capacity, memory_mb: Capacity, gpus: Capacity) -> Self {
        Self {
            cpu: ratio(cpus.allocated, cpus.total),
            memory: ratio(memory_mb.allocated, memory_mb.total),
            gpu: ratio(gpus.allocated, gpus.total),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PartitionSummary {
    pub name: String,
    pub node_count: usize,
    pub cpus: Capacity,
    pub memory_mb: Capacity,
    pub gpus: Capacity,
    /// Free GPUs on nodes that can currently accept work
    pub available_gpus: u64,
    pub utilization: Utilization,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuTypeSummary {
    pub gpu_type: String,
    pub capability: Option<f32>,
    pub node_count: usize,
    pub gpus: Capacity,
    pub available_gpus: u64,
    pub nodes: Vec<String>,
}

/// Cluster-wide sums; each node is counted once however many partitions it is in
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterTotals {
    pub node_count: usize,
    pub accessible_nodes: usize,
    pub cpus: Capacity,
    pub memory_mb: Capacity,
    pub gpus: Capacity,
    pub available_gpus: u64,
    pub utilization: Utilization,
}

/// GPUs of one type held by one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeCount {
    pub gpu_type: String,
    pub gpus: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub user: String,
    pub gpus: u64,
    pub cpus: u64,
    pub memory_mb: u64,
    pub jobs: usize,
    /// `gpus` split by GPU type, newest hardware first. Requests that name no
    /// type are listed as `gpu`
    pub by_type: Vec<TypeCount>,
}

impl LeaderboardEntry {
    /// More GPUs first, then more CPUs, then username
    fn rank_order(&self, other: &Self) -> Ordering {
        other
            .gpus
            .cmp(&self.gpus)
            .then_with(|| other.cpus.cmp(&self.cpus))
            .then_with(|| self.user.cmp(&other.user))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Leaderboard {
    pub state: JobState,
    pub entries: Vec<LeaderboardEntry>,
}

impl Leaderboard {
    pub fn empty(state: JobState) -> Self {
        Self {
            state,
            entries: Vec::new(),
        }
    }

    /// 1-based rank of a user, if they are on the board
    pub fn rank_of(&self, user: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.user == user)
            .map(|idx| idx + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Leaderboards {
    pub running: Leaderboard,
    pub pending: Leaderboard,
}

/// Everything derived from one cycle's records
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub partitions: Vec<PartitionSummary>,
    pub gpu_types: Vec<GpuTypeSummary>,
    pub cluster: ClusterTotals,
    pub leaderboards: Leaderboards,
    /// Node name -> users with running jobs on it
    pub occupancy: BTreeMap<String, Vec<String>>,
}

impl Aggregate {
    pub fn empty() -> Self {
        Self {
            partitions: Vec::new(),
            gpu_types: Vec::new(),
            cluster: ClusterTotals::default(),
            leaderboards: Leaderboards {
                running: Leaderboard::empty(JobState::Running),
                pending: Leaderboard::empty(JobState::Pending),
            },
            occupancy: BTreeMap::new(),
        }
    }
}

/// Folds one cycle's node and job records into summaries and leaderboards.
///
/// Pure: the same records always give the same result, so two calls can be
/// compared for equality
pub fn aggregate(nodes: &[NodeRecord], jobs: &[JobRecord]) -> Aggregate {
    let distinct = distinct_nodes(nodes);

    let aggregate = Aggregate {
        partitions: summarize_partitions(nodes),
        gpu_types: summarize_gpu_types(&distinct),
        cluster: cluster_totals(&distinct),
        leaderboards: Leaderboards {
            running: build_leaderboard(jobs, JobState::Running),
            pending: build_leaderboard(jobs, JobState::Pending),
        },
        occupancy: occupancy(jobs),
    };

    debug_assert!(aggregate.cluster.node_count <= nodes.len());
    debug_assert_eq!(
        aggregate.partitions.iter().map(|p| p.node_count).sum::<usize>(),
        nodes.len()
    );

    aggregate
}

/// First record of every node name, so multi-partition nodes count once
fn distinct_nodes(nodes: &[NodeRecord]) -> Vec<&NodeRecord> {
    let mut by_name: BTreeMap<&str, &NodeRecord> = BTreeMap::new();
    for node in nodes {
        by_name.entry(node.name.as_str()).or_insert(node);
    }
    by_name.into_values().collect()
}

fn summarize_partitions(nodes: &[NodeRecord]) -> Vec<PartitionSummary> {
    let mut partitions: BTreeMap<&str, PartitionSummary> = BTreeMap::new();

    for node in nodes {
        let summary = partitions
            .entry(node.partition.as_str())
            .or_insert_with(|| PartitionSummary {
                name: node.partition.clone(),
                ..Default::default()
            });
        // full capacity goes to every partition the node belongs to
        summary.node_count += 1;
        summary.cpus.add(node.cpus);
        summary.memory_mb.add(node.memory_mb);
        summary.gpus.add(node.gpus);
        summary.available_gpus = summary.available_gpus.saturating_add(node.available_gpus());
        summary.nodes.push(node.name.clone());
    }

    partitions
        .into_values()
        .map(|mut summary| {
            summary.nodes.sort();
            summary.utilization = Utilization::of(summary.cpus, summary.memory_mb, summary.gpus);
            summary
        })
        .collect()
}

fn summarize_gpu_types(nodes: &[&NodeRecord]) -> Vec<GpuTypeSummary> {
    let mut types: BTreeMap<&str, GpuTypeSummary> = BTreeMap::new();

    for node in nodes.iter().filter(|n| n.gpus.total > 0) {
        let gpu_type = node.gpu_type.as_deref().unwrap_or("gpu");
        let summary = types.entry(gpu_type).or_insert_with(|| GpuTypeSummary {
            gpu_type: gpu_type.to_string(),
            capability: gpu_capability(gpu_type),
            node_count: 0,
            gpus: Capacity::default(),
            available_gpus: 0,
            nodes: Vec::new(),
        });
        summary.node_count += 1;
        summary.gpus.add(node.gpus);
        summary.available_gpus = summary.available_gpus.saturating_add(node.available_gpus());
        summary.nodes.push(node.name.clone());
    }

    let mut summaries: Vec<GpuTypeSummary> = types.into_values().collect();
    summaries.sort_by(|a, b| newest_first(&a.gpu_type, &b.gpu_type));
    summaries
}

fn cluster_totals(nodes: &[&NodeRecord]) -> ClusterTotals {
    let mut totals = ClusterTotals::default();
    for node in nodes {
        totals.node_count += 1;
        if node.is_accessible() {
            totals.accessible_nodes += 1;
        }
        totals.cpus.add(node.cpus);
        totals.memory_mb.add(node.memory_mb);
        totals.gpus.add(node.gpus);
        totals.available_gpus = totals.available_gpus.saturating_add(node.available_gpus());
    }
    totals.utilization = Utilization::of(totals.cpus, totals.memory_mb, totals.gpus);
    totals
}

/// Ranks users by the resources of their jobs in `state`: summed GPUs
/// descending, then summed CPUs descending, then username ascending.
///
/// Takes any iterator of records so callers can rank a filtered subset, such as
/// the jobs of a single partition
pub fn build_leaderboard<'a>(
    jobs: impl IntoIterator<Item = &'a JobRecord>,
    state: JobState,
) -> Leaderboard {
    let mut usage: BTreeMap<&str, (LeaderboardEntry, BTreeMap<&str, u64>)> = BTreeMap::new();

    for job in jobs.into_iter().filter(|job| job.state == state) {
        let (entry, by_type) = usage.entry(job.user.as_str()).or_insert_with(|| {
            let entry = LeaderboardEntry {
                user: job.user.clone(),
                gpus: 0,
                cpus: 0,
                memory_mb: 0,
                jobs: 0,
                by_type: Vec::new(),
            };
            (entry, BTreeMap::new())
        });
        entry.gpus = entry.gpus.saturating_add(job.gpus);
        entry.cpus = entry.cpus.saturating_add(job.cpus);
        entry.memory_mb = entry.memory_mb.saturating_add(job.memory_mb);
        entry.jobs += 1;
        if job.gpus > 0 {
            let count = by_type.entry(job.gpu_type.as_deref().unwrap_or("gpu")).or_default();
            *count = count.saturating_add(job.gpus);
        }
    }

    let mut entries: Vec<LeaderboardEntry> = usage
        .into_values()
        .map(|(mut entry, by_type)| {
            entry.by_type = by_type
                .into_iter()
                .map(|(gpu_type, gpus)| TypeCount {
                    gpu_type: gpu_type.to_string(),
                    gpus,
                })
                .collect();
            entry.by_type.sort_by(|a, b| newest_first(&a.gpu_type, &b.gpu_type));
            entry
        })
        .collect();
    entries.sort_by(LeaderboardEntry::rank_order);

    Leaderboard { state, entries }
}

fn occupancy(jobs: &[JobRecord]) -> BTreeMap<String, Vec<String>> {
    let mut users_by_node: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for job in jobs.iter().filter(|job| job.state == JobState::Running) {
        for node in &job.nodes {
            users_by_node
                .entry(node.as_str())
                .or_default()
                .insert(job.user.as_str());
        }
    }
    users_by_node
        .into_iter()
        .map(|(node, users)| {
            (
                node.to_string(),
                users.into_iter().map(str::to_string).collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::parse_jobs;
    use crate::nodes::parse_nodes;

    const SINFO: &str = "\
gpu001|gpu|4/4/0/8|1000|500|gpu:a100:4|gpu:a100:2|mixed
gpu002|gpu|8/0/0/8|1000|1000|gpu:a100:4|gpu:a100:4|allocated
gpu003|gpu,preempt|0/8/0/8|1000|0|gpu:v100:2|gpu:v100:0|idle
gpu004|gpu|0/8/0/8|1000|0|gpu:h100_pcie:8|gpu:h100_pcie:0|idle+drain
cpu001|cpu|0/0/0/0|0|0|(null)|(null)|down
";

    const SQUEUE: &str = "\
1|alice|gpu|R|8|1|gres/gpu:2|100M|2024-05-01T08:00:00|2024-05-01T08:00:00|gpu001
2|bob|gpu|R|4|1|gres/gpu:2|100M|2024-05-01T08:00:00|2024-05-01T08:00:00|gpu002
3|carol|gpu|R|16|1|gres/gpu:2|100M|2024-05-01T08:00:00|2024-05-01T08:00:00|gpu002
4|alice|gpu|R|1|1|N/A|100M|2024-05-01T08:00:00|2024-05-01T08:00:00|gpu001
5|dave|gpu|PD|4|1|gres/gpu:4|100M|2024-05-01T08:00:00|N/A|(Resources)
6|erin|gpu|PD|4|1|gres/gpu:4|100M|2024-05-01T08:00:00|N/A|(Priority)
7|frank|cpu|R|1|1|N/A|100M|2024-05-01T08:00:00|2024-05-01T08:00:00|cpu001
";

    fn fixture() -> (Vec<NodeRecord>, Vec<JobRecord>) {
        (
            parse_nodes(SINFO).unwrap().records,
            parse_jobs(SQUEUE).unwrap().records,
        )
    }

    #[test]
    fn partition_totals_sum_node_capacity() {
        let (nodes, jobs) = fixture();
        let result = aggregate(&nodes[..2], &jobs);

        let gpu = &result.partitions[0];
        assert_eq!(gpu.name, "gpu");
        assert_eq!(gpu.node_count, 2);
        assert_eq!(gpu.cpus, Capacity::new(16, 12));
        assert_eq!(gpu.utilization.cpu, 12.0 / 16.0);
        assert_eq!(gpu.gpus, Capacity::new(8, 6));
        assert_eq!(gpu.memory_mb, Capacity::new(2000, 1500));
    }

    #[test]
    fn multi_partition_nodes_count_fully_in_each() {
        let (nodes, jobs) = fixture();
        let result = aggregate(&nodes, &jobs);

        let names: Vec<&str> = result.partitions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["cpu", "gpu", "preempt"]);

        let preempt = &result.partitions[2];
        assert_eq!(preempt.cpus, Capacity::new(8, 0));
        assert_eq!(preempt.gpus, Capacity::new(2, 0));

        let gpu = &result.partitions[1];
        assert_eq!(gpu.node_count, 4);
        assert_eq!(gpu.cpus.total, 32);
        assert_eq!(gpu.nodes, vec!["gpu001", "gpu002", "gpu003", "gpu004"]);

        // the cluster view counts gpu003 once
        assert_eq!(result.cluster.node_count, 5);
        assert_eq!(result.cluster.cpus.total, 32);
        assert_eq!(result.cluster.gpus, Capacity::new(18, 6));
    }

    #[test]
    fn available_gpus_skip_inaccessible_nodes() {
        let (nodes, jobs) = fixture();
        let result = aggregate(&nodes, &jobs);

        // gpu001 has 2 free, gpu003 has 2 free, gpu004 is drained
        assert_eq!(result.partitions[1].available_gpus, 4);
        assert_eq!(result.cluster.available_gpus, 4);
        assert_eq!(result.cluster.accessible_nodes, 3);
    }

    #[test]
    fn zero_capacity_means_zero_utilization() {
        let (nodes, jobs) = fixture();
        let result = aggregate(&nodes, &jobs);
        let cpu = &result.partitions[0];
        assert_eq!(cpu.name, "cpu");
        assert_eq!(cpu.utilization, Utilization::default());

        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(5, 0), 0.0);
        assert_eq!(ratio(12, 8), 1.0);
        assert_eq!(ratio(4, 8), 0.5);
    }

    #[test]
    fn utilization_stays_in_unit_interval() {
        let (nodes, jobs) = fixture();
        let result = aggregate(&nodes, &jobs);
        for partition in &result.partitions {
            for value in [
                partition.utilization.cpu,
                partition.utilization.memory,
                partition.utilization.gpu,
            ] {
                assert!((0.0..=1.0).contains(&value));
            }
        }
    }

    #[test]
    fn gpu_types_are_listed_by_capability() {
        let (nodes, jobs) = fixture();
        let result = aggregate(&nodes, &jobs);

        let types: Vec<&str> = result.gpu_types.iter().map(|t| t.gpu_type.as_str()).collect();
        assert_eq!(types, vec!["h100_pcie", "a100", "v100"]);
        assert_eq!(result.gpu_types[0].available_gpus, 0);
        assert_eq!(result.gpu_types[1].gpus, Capacity::new(8, 6));
        assert_eq!(result.gpu_types[1].available_gpus, 2);
    }

    #[test]
    fn capability_lookup() {
        assert_eq!(gpu_capability("a100-sxm4-80gb"), Some(8.0));
        assert_eq!(gpu_capability("H100_PCIE"), Some(9.0));
        assert_eq!(gpu_capability("mystery"), None);
    }

    #[test]
    fn leaderboard_orders_by_gpus_then_cpus_then_name() {
        let (_, jobs) = fixture();
        let board = build_leaderboard(&jobs, JobState::Running);

        let users: Vec<&str> = board.entries.iter().map(|e| e.user.as_str()).collect();
        // carol and alice tie on GPUs but carol has more CPUs; bob has fewer CPUs
        assert_eq!(users, vec!["carol", "alice", "bob", "frank"]);
        assert_eq!(board.entries[1].cpus, 9);
        assert_eq!(board.entries[1].jobs, 2);
        assert_eq!(board.rank_of("bob"), Some(3));
        assert_eq!(board.rank_of("dave"), None);

        let pending = build_leaderboard(&jobs, JobState::Pending);
        let users: Vec<&str> = pending.entries.iter().map(|e| e.user.as_str()).collect();
        // full tie falls back to the username
        assert_eq!(users, vec!["dave", "erin"]);
    }

    #[test]
    fn leaderboard_of_a_partition_subset() {
        let (_, jobs) = fixture();
        let board = build_leaderboard(
            jobs.iter().filter(|job| job.partition == "cpu"),
            JobState::Running,
        );
        assert_eq!(board.entries.len(), 1);
        assert_eq!(board.entries[0].user, "frank");
    }

    #[test]
    fn leaderboard_splits_gpus_by_type() {
        let jobs = parse_jobs(
            "\
1|alice|gpu|R|1|1|gres/gpu:v100:1|1G|2024-05-01T08:00:00|2024-05-01T08:00:00|gpu001
2|alice|gpu|R|1|1|gres/gpu:a100:2|1G|2024-05-01T08:00:00|2024-05-01T08:00:00|gpu002
3|alice|gpu|R|1|2|gres/gpu:a100:1|1G|2024-05-01T08:00:00|2024-05-01T08:00:00|gpu[003-004]
4|alice|gpu|R|1|1|gres/gpu:mystery:1|1G|2024-05-01T08:00:00|2024-05-01T08:00:00|gpu005
5|alice|gpu|R|1|1|gres/gpu:1|1G|2024-05-01T08:00:00|2024-05-01T08:00:00|gpu006
6|alice|cpu|R|1|1|N/A|1G|2024-05-01T08:00:00|2024-05-01T08:00:00|cpu001
",
        )
        .unwrap()
        .records;
        let board = build_leaderboard(&jobs, JobState::Running);
        let alice = &board.entries[0];
        assert_eq!(alice.gpus, 7);

        let by_type: Vec<(&str, u64)> = alice
            .by_type
            .iter()
            .map(|t| (t.gpu_type.as_str(), t.gpus))
            .collect();
        // unknown types sort first, known ones by capability
        assert_eq!(
            by_type,
            vec![("gpu", 1), ("mystery", 1), ("a100", 4), ("v100", 1)]
        );
        assert_eq!(by_type.iter().map(|(_, n)| n).sum::<u64>(), alice.gpus);
    }

    #[test]
    fn totals_saturate_instead_of_wrapping() {
        let nodes = parse_nodes(
            "\
gpu001|gpu|0/8/0/8|1000|0|gpu:a100:18446744073709551615|gpu:a100:0|idle
gpu002|gpu|0/8/0/8|1000|0|gpu:a100:8|gpu:a100:0|idle
",
        )
        .unwrap()
        .records;
        let result = aggregate(&nodes, &[]);
        assert_eq!(result.cluster.gpus.total, u64::MAX);
        assert_eq!(result.cluster.available_gpus, u64::MAX);
        assert_eq!(result.partitions[0].gpus.total, u64::MAX);
        assert_eq!(result.gpu_types[0].available_gpus, u64::MAX);
    }

    #[test]
    fn occupancy_lists_users_per_node() {
        let (nodes, jobs) = fixture();
        let result = aggregate(&nodes, &jobs);
        assert_eq!(result.occupancy["gpu001"], vec!["alice"]);
        assert_eq!(result.occupancy["gpu002"], vec!["bob", "carol"]);
        assert!(!result.occupancy.contains_key("gpu003"));
    }

    #[test]
    fn aggregation_is_deterministic() {
        let (nodes, jobs) = fixture();
        assert_eq!(aggregate(&nodes, &jobs), aggregate(&nodes, &jobs));
    }

    #[test]
    fn empty_input_gives_empty_summaries() {
        let result = aggregate(&[], &[]);
        assert_eq!(result, Aggregate::empty());
    }
}
