use chrono::{DateTime, Local, TimeDelta, Utc};

/// Time format used in reports, e.g. `2024.05.01 | 08:05:00`
pub const TIME_FORMAT: &str = "%Y.%m.%d | %H:%M:%S";

const PARTIAL_BLOCKS: [&str; 7] = ["▏", "▎", "▍", "▌", "▋", "▊", "▉"];

/// Splits a bar of `max_blocks` cells filled to `ratio` into
/// (full blocks, empty blocks, partial block), using eighth-block characters
/// for the partial cell. Ratios outside [0, 1] are clamped
pub fn count_blocks(max_blocks: usize, ratio: f64) -> (usize, usize, Option<&'static str>) {
    let ratio = if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled_eighths = (max_blocks as f64 * 8.0 * ratio).round() as usize;

    let full_blocks = filled_eighths / 8;
    let partial = match filled_eighths % 8 {
        0 => None,
        n => Some(PARTIAL_BLOCKS[n - 1]),
    };
    let used = full_blocks + usize::from(partial.is_some());

    (full_blocks, max_blocks.saturating_sub(used), partial)
}

/// Renders a bar as text, e.g. `████▌     `
pub fn render_bar(max_blocks: usize, ratio: f64) -> String {
    let (full, empty, partial) = count_blocks(max_blocks, ratio);
    let mut bar = "█".repeat(full);
    if let Some(partial) = partial {
        bar.push_str(partial);
    }
    bar.push_str(&" ".repeat(empty));
    bar
}

/// Memory in the largest binary unit that keeps the value at or above 1
pub fn format_mb(mb: u64) -> String {
    const UNITS: [&str; 3] = ["M", "G", "T"];
    let mut value = mb as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 || value >= 100.0 {
        format!("{:.0}{}", value, UNITS[unit])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

/// Short age such as `42s`, `5m 03s` or `2h 10m`
pub fn format_age(age: TimeDelta) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        0..60 => format!("{}s", secs),
        60..3600 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// A UTC instant in local time, formatted with [`TIME_FORMAT`]
pub fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_round_to_nearest_eighth() {
        assert_eq!(count_blocks(20, 0.95), (19, 1, None));
        assert_eq!(count_blocks(20, 0.92), (18, 1, Some("▍")));
        assert_eq!(count_blocks(10, 0.0), (0, 10, None));
        assert_eq!(count_blocks(10, 1.0), (10, 0, None));
    }

    #[test]
    fn blocks_clamp_out_of_range_ratios() {
        assert_eq!(count_blocks(4, 1.7), (4, 0, None));
        assert_eq!(count_blocks(4, -0.5), (0, 4, None));
        assert_eq!(count_blocks(4, f64::NAN), (0, 4, None));
    }

    #[test]
    fn bar_has_fixed_width() {
        for ratio in [0.0, 0.13, 0.5, 0.77, 1.0] {
            assert_eq!(render_bar(12, ratio).chars().count(), 12);
        }
        assert_eq!(render_bar(4, 0.5), "██  ");
    }

    #[test]
    fn memory_units() {
        assert_eq!(format_mb(512), "512M");
        assert_eq!(format_mb(2048), "2.0G");
        assert_eq!(format_mb(512_000), "500G");
        assert_eq!(format_mb(1536 * 1024), "1.5T");
    }

    #[test]
    fn ages() {
        assert_eq!(format_age(TimeDelta::seconds(42)), "42s");
        assert_eq!(format_age(TimeDelta::seconds(303)), "5m 03s");
        assert_eq!(format_age(TimeDelta::seconds(7800)), "2h 10m");
        assert_eq!(format_age(TimeDelta::seconds(-5)), "0s");
    }
}
