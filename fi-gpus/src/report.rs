use std::fmt::Write;

use chrono::Utc;
use colored::*;
use fi_gpustat::aggregate::{
    GpuTypeSummary, Leaderboard, LeaderboardEntry, PartitionSummary, build_leaderboard, ratio,
};
use fi_gpustat::jobs::{JobRecord, JobState};
use fi_gpustat::nodes::Capacity;
use fi_gpustat::parser::compress_hostlist;
use fi_gpustat::snapshot::{CollectionStatus, CycleFailure, Snapshot};
use fi_gpustat::states::describe_state;
use fi_gpustat::utils::{count_blocks, format_age, format_local, format_mb};

const BAR_WIDTH: usize = 20;

/// What the user asked to see
#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    /// Leaderboard rows per board
    pub top: usize,
    /// Restrict the partition table and leaderboards to one partition
    pub partition: Option<String>,
    pub names: bool,
    /// List every node under its GPU type, with its load and users
    pub nodes: bool,
    pub no_color: bool,
    /// Highlighted in the leaderboards, and always listed even outside the top rows
    pub current_user: Option<String>,
}

fn paint(text: String, color: Color, no_color: bool) -> ColoredString {
    if no_color {
        text.normal()
    } else {
        text.color(color)
    }
}

/// `│████▍     │`, filled to `ratio`
fn bar(ratio: f64, color: Color, no_color: bool) -> String {
    let (full, empty, partial) = count_blocks(BAR_WIDTH, ratio);
    let filled = paint("█".repeat(full), color, no_color);
    let partial = paint(partial.unwrap_or_default().to_string(), color, no_color);
    format!("│{}{}{}│", filled, partial, " ".repeat(empty))
}

fn used_of(capacity: Capacity) -> String {
    format!("{}/{}", capacity.allocated, capacity.total)
}

/// Utilization bars go from green to red as a resource fills up
fn load_color(ratio: f64) -> Color {
    if ratio >= 0.9 {
        Color::Red
    } else if ratio >= 0.6 {
        Color::Yellow
    } else {
        Color::Green
    }
}

fn job_in_partition(job: &JobRecord, partition: &str) -> bool {
    job.partition.split(',').any(|p| p == partition)
}

/// Builds the full text report for one Snapshot
pub fn render_report(
    snapshot: &Snapshot,
    failure: Option<&CycleFailure>,
    opts: &ReportOptions,
) -> String {
    let mut out = String::new();

    render_header(&mut out, snapshot, failure, opts);
    if snapshot.is_placeholder() {
        return out;
    }

    render_gpu_types(&mut out, snapshot, opts);

    let partitions: Vec<&PartitionSummary> = match &opts.partition {
        Some(name) => snapshot.partition(name).into_iter().collect(),
        None => snapshot.partitions.iter().collect(),
    };
    if partitions.is_empty() {
        if let Some(name) = &opts.partition {
            let _ = writeln!(out, "\nNo partition named '{}'", name);
        }
    } else {
        render_partitions(&mut out, &partitions, opts);
    }

    let (running, pending) = match &opts.partition {
        Some(name) => {
            let jobs = || snapshot.jobs.iter().filter(move |job| job_in_partition(job, name));
            (
                build_leaderboard(jobs(), JobState::Running),
                build_leaderboard(jobs(), JobState::Pending),
            )
        }
        None => (
            snapshot.leaderboards.running.clone(),
            snapshot.leaderboards.pending.clone(),
        ),
    };
    render_leaderboard(&mut out, "Running", &running, opts);
    render_leaderboard(&mut out, "Waiting", &pending, opts);

    out
}

fn render_header(
    out: &mut String,
    snapshot: &Snapshot,
    failure: Option<&CycleFailure>,
    opts: &ReportOptions,
) {
    if snapshot.is_placeholder() {
        let _ = writeln!(out, "{}", "No cluster data has been collected yet".bold());
    } else {
        let cluster = &snapshot.cluster;
        let _ = writeln!(
            out,
            "{} GPUs available of {} on {}/{} accessible nodes",
            paint(cluster.available_gpus.to_string(), Color::Green, opts.no_color).bold(),
            cluster.gpus.total,
            cluster.accessible_nodes,
            cluster.node_count,
        );
        let _ = writeln!(
            out,
            "Updated {} ({} ago)",
            format_local(snapshot.collected_at),
            format_age(snapshot.age(Utc::now())),
        );
        if let CollectionStatus::Partial {
            node_warnings,
            job_warnings,
        } = snapshot.status
        {
            let _ = writeln!(
                out,
                "{}",
                paint(
                    format!(
                        "Skipped {} node and {} job lines that could not be read",
                        node_warnings, job_warnings
                    ),
                    Color::Yellow,
                    opts.no_color,
                )
            );
        }
    }

    // a failure older than the data has already been recovered from
    if let Some(failure) = failure.filter(|f| f.at > snapshot.collected_at) {
        let _ = writeln!(
            out,
            "{}",
            paint(
                format!(
                    "Last update failed at {} while {}: {}",
                    format_local(failure.at),
                    failure.stage,
                    failure.message
                ),
                Color::Red,
                opts.no_color,
            )
        );
    }
}

fn render_gpu_types(out: &mut String, snapshot: &Snapshot, opts: &ReportOptions) {
    if snapshot.gpu_types.is_empty() {
        return;
    }

    let type_width = snapshot
        .gpu_types
        .iter()
        .map(|t| t.gpu_type.len())
        .max()
        .unwrap_or(0)
        .max("GPU Type".len());

    let _ = writeln!(
        out,
        "\n{:<type_width$}  {:>5}  {:>9}  {:<w$}  {:>4}",
        "GPU Type".bold(),
        "Nodes".bold(),
        "Free".bold(),
        "Available".bold(),
        "CC".bold(),
        w = BAR_WIDTH + 2,
    );
    for summary in &snapshot.gpu_types {
        let ratio = if summary.gpus.total == 0 {
            0.0
        } else {
            summary.available_gpus as f64 / summary.gpus.total as f64
        };
        let capability = summary
            .capability
            .map(|c| format!("{:.1}", c))
            .unwrap_or_else(|| "?".to_string());
        let _ = writeln!(
            out,
            "{:<type_width$}  {:>5}  {:>9}  {}  {:>4}",
            summary.gpu_type,
            summary.node_count,
            format!("{}/{}", summary.available_gpus, summary.gpus.total),
            bar(ratio, Color::Green, opts.no_color),
            capability,
        );
        if opts.nodes {
            render_gpu_nodes(out, snapshot, summary, opts);
        }
    }
}

/// One row per node of a GPU type: free GPUs, CPU and memory load, and who is on it
fn render_gpu_nodes(
    out: &mut String,
    snapshot: &Snapshot,
    summary: &GpuTypeSummary,
    opts: &ReportOptions,
) {
    let name_width = summary.nodes.iter().map(|n| n.len()).max().unwrap_or(0);

    for name in &summary.nodes {
        let Some(node) = snapshot.node(name) else {
            continue;
        };
        let free = if node.is_accessible() {
            paint(
                format!("{}/{} free", node.available_gpus(), node.gpus.total),
                Color::Green,
                opts.no_color,
            )
        } else {
            paint(describe_state(&node.state, node.flags), Color::Red, opts.no_color)
        };
        let cpu = ratio(node.cpus.allocated, node.cpus.total);
        let memory = ratio(node.memory_mb.allocated, node.memory_mb.total);

        let _ = write!(
            out,
            "  {:<name_width$}  {:>12}  CPU {:>9} {}  Mem {:>13} {}",
            name,
            free,
            used_of(node.cpus),
            bar(cpu, load_color(cpu), opts.no_color),
            format!(
                "{}/{}",
                format_mb(node.memory_mb.allocated),
                format_mb(node.memory_mb.total)
            ),
            bar(memory, load_color(memory), opts.no_color),
        );
        let users = snapshot.users_on(name);
        if users.is_empty() {
            let _ = writeln!(out);
        } else {
            let _ = writeln!(out, "  user: {}", users.join(","));
        }
    }
}

fn render_partitions(out: &mut String, partitions: &[&PartitionSummary], opts: &ReportOptions) {
    let name_width = partitions
        .iter()
        .map(|p| p.name.len())
        .max()
        .unwrap_or(0)
        .max("Partition".len());
    let cpu_width = partitions
        .iter()
        .map(|p| used_of(p.cpus).len())
        .max()
        .unwrap_or(0)
        .max("CPUs".len());
    let gpu_width = partitions
        .iter()
        .map(|p| used_of(p.gpus).len())
        .max()
        .unwrap_or(0)
        .max("GPUs".len());

    let _ = writeln!(
        out,
        "\n{:<name_width$}  {:>5}  {:>cpu_width$}  {:<bw$}  {:>gpu_width$}  {:<bw$}  {:>13}",
        "Partition".bold(),
        "Nodes".bold(),
        "CPUs".bold(),
        "CPU Load".bold(),
        "GPUs".bold(),
        "GPU Load".bold(),
        "Memory".bold(),
        bw = BAR_WIDTH + 2,
    );

    for partition in partitions {
        let utilization = partition.utilization;
        let _ = writeln!(
            out,
            "{:<name_width$}  {:>5}  {:>cpu_width$}  {}  {:>gpu_width$}  {}  {:>13}",
            partition.name,
            partition.node_count,
            used_of(partition.cpus),
            bar(utilization.cpu, load_color(utilization.cpu), opts.no_color),
            used_of(partition.gpus),
            bar(utilization.gpu, load_color(utilization.gpu), opts.no_color),
            format!(
                "{}/{}",
                format_mb(partition.memory_mb.allocated),
                format_mb(partition.memory_mb.total)
            ),
        );
        if opts.names {
            let _ = writeln!(
                out,
                "  {}",
                paint(compress_hostlist(&partition.nodes), Color::Cyan, opts.no_color)
            );
        }
    }
}

/// `a100=4 v100=1`, newest GPU type first
fn gpus_by_type(entry: &LeaderboardEntry) -> String {
    entry
        .by_type
        .iter()
        .map(|t| format!("{}={}", t.gpu_type, t.gpus))
        .collect::<Vec<_>>()
        .join(" ")
}

fn leaderboard_row(rank: usize, entry: &LeaderboardEntry, user_width: usize) -> String {
    format!(
        "{:>4}  {:<user_width$}  {:>5}  {:>6}  {:>8}  {:>5}  {}",
        rank,
        entry.user,
        entry.gpus,
        entry.cpus,
        format_mb(entry.memory_mb),
        entry.jobs,
        gpus_by_type(entry),
    )
    .trim_end()
    .to_string()
}

fn render_leaderboard(
    out: &mut String,
    title: &str,
    board: &Leaderboard,
    opts: &ReportOptions,
) {
    let _ = writeln!(out, "\n{} ({} users)", title.bold(), board.entries.len());
    if board.entries.is_empty() {
        let _ = writeln!(out, "  none");
        return;
    }

    let user_width = board
        .entries
        .iter()
        .map(|e| e.user.len())
        .max()
        .unwrap_or(0)
        .max("User".len());
    let _ = writeln!(
        out,
        "{}",
        format!(
            "{:>4}  {:<user_width$}  {:>5}  {:>6}  {:>8}  {:>5}  {}",
            "Rank", "User", "GPUs", "CPUs", "Memory", "Jobs", "By Type"
        )
        .bold()
    );

    let is_me = |entry: &LeaderboardEntry| opts.current_user.as_deref() == Some(entry.user.as_str());

    for (idx, entry) in board.entries.iter().enumerate().take(opts.top) {
        let row = leaderboard_row(idx + 1, entry, user_width);
        if is_me(entry) {
            let _ = writeln!(out, "{}", paint(row, Color::Green, opts.no_color).bold());
        } else {
            let _ = writeln!(out, "{}", row);
        }
    }

    // the current user always sees where they stand
    if let Some((idx, entry)) = board
        .entries
        .iter()
        .enumerate()
        .skip(opts.top)
        .find(|(_, entry)| is_me(entry))
    {
        let _ = writeln!(out, "{:>4}", "...");
        let row = leaderboard_row(idx + 1, entry, user_width);
        let _ = writeln!(out, "{}", paint(row, Color::Green, opts.no_color).bold());
    }
}

pub fn print_report(snapshot: &Snapshot, failure: Option<&CycleFailure>, opts: &ReportOptions) {
    print!("{}", render_report(snapshot, failure, opts));
}
