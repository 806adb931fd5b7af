use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::ParseError;

/// Which of the two resource-manager queries a piece of text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Nodes,
    Jobs,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Nodes => write!(f, "node"),
            RecordKind::Jobs => write!(f, "job"),
        }
    }
}

/// A line that was skipped because it did not fit the column layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseWarning {
    pub line_no: usize,
    pub line: String,
    pub reason: String,
}

/// The result of parsing one command's output: the records built from the
/// well-formed lines and one warning for every line that was skipped
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub records: Vec<T>,
    /// Number of well-formed lines. Equal to `records.len()` unless a line fans out
    /// into several records (a node listed under more than one partition)
    pub accepted_lines: usize,
    pub warnings: Vec<ParseWarning>,
}

impl<T> Parsed<T> {
    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

/// Splits `|`-delimited output into rows of trimmed fields and hands each row to
/// `parse_row`. Rows that fail are recorded as warnings rather than aborting the
/// parse; only input in which no line at all could be parsed is an error
pub(crate) fn parse_table<T>(
    input: &str,
    kind: RecordKind,
    columns: usize,
    mut parse_row: impl FnMut(&[&str]) -> Result<Vec<T>, String>,
) -> Result<Parsed<T>, ParseError> {
    let mut parsed = Parsed {
        records: Vec::new(),
        accepted_lines: 0,
        warnings: Vec::new(),
    };
    let mut non_empty_lines = 0;

    for (idx, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        non_empty_lines += 1;

        let mut fields: Vec<&str> = line.split('|').map(str::trim).collect();
        // `--Format` suffixes leave a dangling delimiter after the last column
        if fields.len() == columns + 1 && fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }

        let row = if fields.len() == columns {
            parse_row(&fields)
        } else {
            Err(format!(
                "expected {} columns, found {}",
                columns,
                fields.len()
            ))
        };

        match row {
            Ok(records) => {
                parsed.accepted_lines += 1;
                parsed.records.extend(records);
            }
            Err(reason) => {
                debug!(%kind, line_no = idx + 1, %reason, "skipping malformed line");
                parsed.warnings.push(ParseWarning {
                    line_no: idx + 1,
                    line: line.to_string(),
                    reason,
                });
            }
        }
    }

    if non_empty_lines > 0 && parsed.accepted_lines == 0 {
        return Err(ParseError::UnrecognizedFormat {
            kind,
            lines: non_empty_lines,
            first_reason: parsed
                .warnings
                .first()
                .map(|w| w.reason.clone())
                .unwrap_or_default(),
        });
    }

    Ok(parsed)
}

/// Whether a field holds one of Slurm's spellings of "nothing here"
pub(crate) fn is_absent(field: &str) -> bool {
    field.is_empty()
        || field == "-"
        || field.eq_ignore_ascii_case("n/a")
        || field.eq_ignore_ascii_case("(null)")
        || field.eq_ignore_ascii_case("none")
}

pub(crate) fn parse_count(field: &str, what: &str) -> Result<u64, String> {
    field
        .parse::<u64>()
        .map_err(|_| format!("invalid {} `{}`", what, field))
}

/// Parses a memory size such as `4000`, `4000M` or `8G` into megabytes.
/// A bare number is already in megabytes; an absent field is zero
pub(crate) fn parse_memory_mb(field: &str) -> Result<u64, String> {
    if is_absent(field) {
        return Ok(0);
    }

    let numeric_end = field
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(field.len());
    let (numeric_part, unit_part) = field.split_at(numeric_end);

    let value: f64 = numeric_part
        .parse()
        .map_err(|_| format!("invalid memory size `{}`", field))?;

    let multiplier = match unit_part.to_ascii_uppercase().as_str() {
        "" | "M" => 1.0,
        "K" => 1.0 / 1024.0,
        "G" => 1024.0,
        "T" => 1024.0 * 1024.0,
        "P" => 1024.0 * 1024.0 * 1024.0,
        _ => return Err(format!("invalid memory unit in `{}`", field)),
    };

    // float to int casts saturate, so an absurd size can't wrap
    Ok((value * multiplier).round() as u64)
}

/// What a job's minimum-memory figure is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemoryPer {
    Node,
    Cpu,
}

/// Parses a `%m` job memory request: a size optionally followed by `n`
/// (per node, the default) or `c` (per CPU), as in `16G`, `4000n` or `2Gc`
pub(crate) fn parse_memory_request(field: &str) -> Result<(u64, MemoryPer), String> {
    if let Some(size) = field.strip_suffix(['c', 'C']) {
        return Ok((parse_memory_mb(size)?, MemoryPer::Cpu));
    }
    let size = field.strip_suffix(['n', 'N']).unwrap_or(field);
    Ok((parse_memory_mb(size)?, MemoryPer::Node))
}

/// GPUs found in a GRES string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuGres {
    pub count: u64,
    pub gpu_type: Option<String>,
}

/// Splits on top-level commas, leaving commas inside `(IDX:0,2)` metadata alone
fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in input.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Sums the GPU entries of a GRES or TRES-per-node string.
///
/// Handles node forms (`gpu:a100:4(S:0-1)`, `gpu:a100:2(IDX:0-1),shard:8`) as well
/// as job request forms (`gres/gpu:2`, `gres:gpu:v100:1`, `gres/gpu=2`). An entry
/// without a count (`gpu`, `gpu:a100`) requests one GPU. Non-GPU entries are
/// ignored and an absent field means no GPUs. A GPU entry whose count is not a
/// number is an error
pub fn parse_gpu_gres(field: &str) -> Result<GpuGres, String> {
    let mut gres = GpuGres::default();
    if is_absent(field) {
        return Ok(gres);
    }

    for raw_entry in split_top_level(field) {
        // drop (S:0-1) / (IDX:0-3) metadata
        let entry = raw_entry.split('(').next().unwrap_or_default().trim();
        let entry = entry
            .strip_prefix("gres/")
            .or_else(|| entry.strip_prefix("gres:"))
            .unwrap_or(entry);

        let (name, explicit_count) = match entry.split_once('=') {
            Some((name, count)) => (name, Some(count)),
            None => (entry, None),
        };

        let mut segments = name.split(':');
        if segments.next() != Some("gpu") {
            continue;
        }
        let rest: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();

        let (gpu_type, count_str) = match (explicit_count, rest.as_slice()) {
            (Some(count), rest) => (rest.first().copied(), Some(count)),
            (None, []) => (None, None),
            (None, [single]) if single.starts_with(|c: char| c.is_ascii_digit()) => {
                (None, Some(*single))
            }
            (None, [single]) => (Some(*single), None),
            (None, [gpu_type, .., count]) => (Some(*gpu_type), Some(*count)),
        };

        let count = match count_str {
            Some(count) => count
                .parse::<u64>()
                .map_err(|_| format!("unparseable GPU count in `{}`", raw_entry.trim()))?,
            None => 1,
        };

        gres.count = gres
            .count
            .checked_add(count)
            .ok_or_else(|| format!("GPU count overflows in `{}`", field))?;
        if gres.gpu_type.is_none() {
            gres.gpu_type = gpu_type.map(str::to_string);
        }
    }

    Ok(gres)
}

/// Parses `%V`/`%S` style timestamps; `N/A`, `Unknown` and empty mean "not set"
pub(crate) fn parse_timestamp(field: &str) -> Result<Option<NaiveDateTime>, String> {
    if is_absent(field) || field.eq_ignore_ascii_case("unknown") {
        return Ok(None);
    }
    NaiveDateTime::parse_from_str(field, "%Y-%m-%dT%H:%M:%S")
        .map(Some)
        .map_err(|_| format!("invalid timestamp `{}`", field))
}

/// Expands a Slurm hostlist expression into individual hostnames
///
/// # Examples
///
/// * `"n01,n02"` -> `["n01", "n02"]`
/// * `"gpu[07-09,12]"` -> `["gpu07", "gpu08", "gpu09", "gpu12"]`
/// * `"rack[1-2]-n[1-2]"` -> `["rack1-n1", "rack1-n2", "rack2-n1", "rack2-n2"]`
pub fn parse_slurm_hostlist(hostlist: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, ch) in hostlist.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                expand_hostlist_expression(hostlist[start..i].trim(), &mut hosts);
                start = i + 1;
            }
            _ => {}
        }
    }
    expand_hostlist_expression(hostlist[start..].trim(), &mut hosts);
    hosts
}

fn expand_hostlist_expression(expression: &str, hosts: &mut Vec<String>) {
    if expression.is_empty() {
        return;
    }
    let Some(open) = expression.find('[') else {
        hosts.push(expression.to_string());
        return;
    };
    let Some(close) = expression[open..].find(']').map(|rel| open + rel) else {
        // unbalanced, keep it verbatim
        hosts.push(expression.to_string());
        return;
    };

    let prefix = &expression[..open];
    let suffix = &expression[close + 1..];

    for range in expression[open + 1..close].split(',') {
        let range = range.trim();
        match range.split_once('-') {
            Some((first, last)) => {
                if let (Ok(first_num), Ok(last_num)) = (first.parse::<u32>(), last.parse::<u32>())
                    && first_num <= last_num
                {
                    let width = first.len();
                    for n in first_num..=last_num {
                        // the suffix may hold further bracket groups
                        expand_hostlist_expression(
                            &format!("{}{:0width$}{}", prefix, n, suffix, width = width),
                            hosts,
                        );
                    }
                }
            }
            None if !range.is_empty() => {
                expand_hostlist_expression(&format!("{}{}{}", prefix, range, suffix), hosts);
            }
            None => {}
        }
    }
}

/// Compresses hostnames into a Slurm hostlist expression, the reverse of
/// [`parse_slurm_hostlist`]. Output groups are sorted for stable display
pub fn compress_hostlist(hosts: &[String]) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    // the last run of digits is the index; everything before it is the prefix
    let re = RE.get_or_init(|| {
        Regex::new(r"^(.*?)(\d+)(\D*)$").expect("Failed to compile hostname regex")
    });

    let mut groups: BTreeMap<(&str, &str), Vec<(u32, usize)>> = BTreeMap::new();
    let mut parts: Vec<String> = Vec::new();

    for host in hosts {
        let indexed = re.captures(host).and_then(|caps| {
            let digits = caps.get(2)?.as_str();
            let number = digits.parse::<u32>().ok()?;
            Some((
                caps.get(1)?.as_str(),
                caps.get(3)?.as_str(),
                number,
                digits.len(),
            ))
        });
        match indexed {
            Some((prefix, suffix, number, width)) => groups
                .entry((prefix, suffix))
                .or_default()
                .push((number, width)),
            None => parts.push(host.clone()),
        }
    }

    for ((prefix, suffix), mut numbers) in groups {
        numbers.sort_unstable();
        numbers.dedup();

        if let [(number, width)] = numbers.as_slice() {
            parts.push(format!("{}{:0w$}{}", prefix, number, suffix, w = *width));
            continue;
        }

        // consecutive numbers with the same zero padding collapse into one range
        let mut ranges: Vec<(u32, u32, usize)> = Vec::new();
        for (number, width) in numbers {
            match ranges.last_mut() {
                Some((_, last, w)) if *w == width && number == *last + 1 => *last = number,
                _ => ranges.push((number, number, width)),
            }
        }

        let inner: Vec<String> = ranges
            .into_iter()
            .map(|(first, last, w)| {
                if first == last {
                    format!("{:0w$}", first, w = w)
                } else {
                    format!("{:0w$}-{:0w$}", first, last, w = w)
                }
            })
            .collect();
        parts.push(format!("{}[{}]{}", prefix, inner.join(","), suffix));
    }

    parts.sort();
    parts.join(",")
}
