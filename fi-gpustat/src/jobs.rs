use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::ParseError;
use crate::parser::{
    MemoryPer, Parsed, RecordKind, is_absent, parse_count, parse_gpu_gres,
    parse_memory_request, parse_slurm_hostlist, parse_table, parse_timestamp,
};

/// Number of `|`-separated columns in a job line:
/// `JOBID|USER|PARTITION|STATE|CPUS|NODES|TRES_PER_NODE|MIN_MEMORY|SUBMIT|START|NODELIST`
pub const JOB_COLUMNS: usize = 11;

/// Job states tracked in a snapshot; completed jobs are not part of the queue view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Pending,
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            // completing and configuring jobs still hold their allocation
            "RUNNING" | "R" | "COMPLETING" | "CG" | "CONFIGURING" | "CF" => Ok(JobState::Running),
            "PENDING" | "PD" => Ok(JobState::Pending),
            other => Err(format!("unsupported job state `{}`", other)),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Pending => write!(f, "pending"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    /// Kept as text so array tasks (`1234_7`) survive
    pub job_id: String,
    pub user: String,
    pub partition: String,
    pub state: JobState,
    pub cpus: u64,
    pub node_count: u64,
    pub gpus: u64,
    pub gpu_type: Option<String>,
    pub memory_mb: u64,
    pub submitted: NaiveDateTime,
    pub started: Option<NaiveDateTime>,
    pub nodes: Vec<String>,
}

fn parse_job_row(fields: &[&str]) -> Result<Vec<JobRecord>, String> {
    let [
        job_id,
        user,
        partition,
        state,
        cpus,
        node_count,
        tres_per_node,
        min_memory,
        submitted,
        started,
        node_list,
    ] = fields
    else {
        return Err(format!("expected {} columns", JOB_COLUMNS));
    };

    if job_id.is_empty() || user.is_empty() {
        return Err("missing job id or user".to_string());
    }

    let state: JobState = state.parse()?;
    let cpus = parse_count(cpus, "CPU count")?;

    // pending jobs may show a range such as `1-4`; the lower bound is what is guaranteed
    let node_count = if is_absent(node_count) {
        1
    } else {
        let lower = node_count.split('-').next().unwrap_or_default();
        parse_count(lower, "node count")?.max(1)
    };

    let per_node = parse_gpu_gres(tres_per_node)?;
    let gpus = per_node
        .count
        .checked_mul(node_count)
        .ok_or_else(|| "GPU request overflows".to_string())?;

    let (memory, per) = parse_memory_request(min_memory)?;
    let memory_mb = match per {
        MemoryPer::Node => memory.checked_mul(node_count),
        MemoryPer::Cpu => memory.checked_mul(cpus),
    }
    .ok_or_else(|| "memory request overflows".to_string())?;

    let submitted = parse_timestamp(submitted)?.ok_or_else(|| "missing submit time".to_string())?;
    let started = parse_timestamp(started)?;

    // pending jobs print a reason like `(Resources)` where running ones list nodes
    let nodes = if is_absent(node_list) || node_list.starts_with('(') {
        Vec::new()
    } else {
        parse_slurm_hostlist(node_list)
    };

    Ok(vec![JobRecord {
        job_id: job_id.to_string(),
        user: user.to_string(),
        partition: partition.to_string(),
        state,
        cpus,
        node_count,
        gpus,
        gpu_type: per_node.gpu_type,
        memory_mb,
        submitted,
        started,
        nodes,
    }])
}

/// Parses job-queue output (one job per line, see [`JOB_COLUMNS`]).
///
/// GPU requests are per node and are multiplied by the job's node count, as is
/// memory unless it is requested per CPU (`2Gc`). Jobs that are neither running
/// nor pending, and requests too large to total, are reported as warnings
pub fn parse_jobs(input: &str) -> Result<Parsed<JobRecord>, ParseError> {
    parse_table(input, RecordKind::Jobs, JOB_COLUMNS, parse_job_row)
}
