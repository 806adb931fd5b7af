use serde::Serialize;

use crate::error::ParseError;
use crate::parser::{
    Parsed, RecordKind, parse_count, parse_gpu_gres, parse_memory_mb, parse_table,
};
use crate::states::{NodeState, NodeStateFlags};

/// Number of `|`-separated columns in a node line:
/// `NODE|PARTITION|CPUS(A/I/O/T)|MEMORY|ALLOC_MEM|GRES|GRES_USED|STATE`
pub const NODE_COLUMNS: usize = 8;

/// A total and the part of it that is currently allocated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub total: u64,
    pub allocated: u64,
}

impl Capacity {
    pub fn new(total: u64, allocated: u64) -> Self {
        Self { total, allocated }
    }

    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.allocated)
    }

    /// Sums saturate at `u64::MAX` rather than wrapping
    pub fn add(&mut self, other: Capacity) {
        self.total = self.total.saturating_add(other.total);
        self.allocated = self.allocated.saturating_add(other.allocated);
    }
}

/// One node as seen from one partition. A node that belongs to several
/// partitions produces one record per partition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    pub name: String,
    pub partition: String,
    pub cpus: Capacity,
    pub memory_mb: Capacity,
    pub gpus: Capacity,
    pub gpu_type: Option<String>,
    pub state: NodeState,
    pub flags: NodeStateFlags,
}

impl NodeRecord {
    pub fn is_accessible(&self) -> bool {
        self.state.is_accessible(self.flags)
    }

    /// GPUs that could be handed to a new job right now
    pub fn available_gpus(&self) -> u64 {
        if self.is_accessible() {
            self.gpus.free()
        } else {
            0
        }
    }
}

/// `allocated/idle/other/total`, as printed by `%C` / `CPUsState`
fn parse_cpu_state(field: &str) -> Result<Capacity, String> {
    let parts: Vec<&str> = field.split('/').collect();
    let [allocated, _idle, _other, total] = parts.as_slice() else {
        return Err(format!("invalid CPU state `{}`", field));
    };
    Ok(Capacity::new(
        parse_count(total, "CPU total")?,
        parse_count(allocated, "allocated CPU count")?,
    ))
}

fn parse_node_row(fields: &[&str]) -> Result<Vec<NodeRecord>, String> {
    let [name, partitions, cpus, memory, alloc_memory, gres, gres_used, state] = fields else {
        return Err(format!("expected {} columns", NODE_COLUMNS));
    };

    if name.is_empty() {
        return Err("missing node name".to_string());
    }

    let partitions: Vec<&str> = partitions
        .split(',')
        .map(|p| p.trim().trim_end_matches('*'))
        .filter(|p| !p.is_empty())
        .collect();
    if partitions.is_empty() {
        return Err("missing partition".to_string());
    }

    let cpus = parse_cpu_state(cpus)?;
    let memory_mb = Capacity::new(
        parse_count(memory, "memory size")?,
        parse_memory_mb(alloc_memory)?,
    );

    let configured = parse_gpu_gres(gres)?;
    let used = parse_gpu_gres(gres_used)?;
    let gpus = Capacity::new(configured.count, used.count);

    let (state, flags) = NodeState::parse(state).ok_or_else(|| "missing node state".to_string())?;

    Ok(partitions
        .into_iter()
        .map(|partition| NodeRecord {
            name: name.to_string(),
            partition: partition.to_string(),
            cpus,
            memory_mb,
            gpus,
            gpu_type: configured.gpu_type.clone(),
            state: state.clone(),
            flags,
        })
        .collect())
}

/// Parses node-status output (one node per line, see [`NODE_COLUMNS`]).
///
/// The allocated-memory and GRES columns are optional: empty, `N/A` or `(null)`
/// mean zero. A line whose partition column lists several partitions yields one
/// record per partition
pub fn parse_nodes(input: &str) -> Result<Parsed<NodeRecord>, ParseError> {
    parse_table(input, RecordKind::Nodes, NODE_COLUMNS, parse_node_row)
}
