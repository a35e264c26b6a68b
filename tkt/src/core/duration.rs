//! Human-friendly duration strings (`90s`, `15m`, `1h30m`).

use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Deserializer};

/// Parse a compound duration string. A bare number is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        let secs: u64 = s.parse().map_err(|_| anyhow!("invalid duration: {raw}"))?;
        return Ok(Duration::from_secs(secs));
    }

    let mut total_secs: u64 = 0;
    let mut current = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            current.push(c);
            continue;
        }
        let n: u64 = current
            .parse()
            .map_err(|_| anyhow!("invalid duration: {raw}"))?;
        current.clear();
        let unit = match c {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => bail!("unknown duration unit '{c}' in: {raw}"),
        };
        total_secs = n
            .checked_mul(unit)
            .and_then(|secs| total_secs.checked_add(secs))
            .ok_or_else(|| anyhow!("duration '{raw}' is too large"))?;
    }
    if !current.is_empty() {
        bail!("duration '{raw}' is missing a unit after {current}");
    }
    Ok(Duration::from_secs(total_secs))
}

/// Render a duration in the same compact form `parse_duration` accepts.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3_600, (secs % 3_600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 || out.is_empty() {
        out.push_str(&format!("{s}s"));
    }
    out
}

/// Serde adapter for optional duration fields written as strings.
pub fn deserialize_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}
