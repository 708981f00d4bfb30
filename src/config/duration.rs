//! Duration parsing utilities.

use anyhow::Context;
use std::time::Duration;

/// Parse a duration string like "1h", "30m", "300s", "1.5s" or "300".
/// Supports:
/// - Plain numbers (interpreted as seconds): "300", "0.5"
/// - Seconds suffix: "300s", "1.5s"
/// - Minutes suffix: "30m"
/// - Hours suffix: "1h"
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let secs = parse_duration_to_secs(s)?;
    Duration::try_from_secs_f64(secs).with_context(|| format!("Duration out of range: {s}"))
}

/// Like [`parse_duration`], but rejects a zero duration.
pub fn parse_interval(s: &str) -> anyhow::Result<Duration> {
    let interval = parse_duration(s)?;
    if interval.is_zero() {
        anyhow::bail!("Interval must be greater than zero: {s}");
    }
    Ok(interval)
}

/// Same as [`parse_duration`], returning fractional seconds.
pub fn parse_duration_to_secs(s: &str) -> anyhow::Result<f64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    let (num_str, scale) = if let Some(num_str) = s.strip_suffix('h') {
        (num_str, 3600.0)
    } else if let Some(num_str) = s.strip_suffix('m') {
        (num_str, 60.0)
    } else if let Some(num_str) = s.strip_suffix('s') {
        (num_str, 1.0)
    } else {
        // No suffix - treat as seconds
        (s, 1.0)
    };

    let value: f64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration value: {s}"))?;
    if !value.is_finite() || value < 0.0 {
        anyhow::bail!("Duration must be a non-negative number: {s}");
    }
    Ok(value * scale)
}
