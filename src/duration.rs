// src/duration.rs

//! Duration strings in the form used by task files and pause requests.
//!
//! Accepts one or more `<number><unit>` pairs, e.g. `"3s"`, `"250ms"`,
//! `"1m30s"`, `"1.5h"`. Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`.
//! A bare `"0"` is accepted and means zero.

use std::time::Duration;

/// Parse a duration string like `"3s"`, `"250ms"`, `"1m30s"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;

    while !rest.is_empty() {
        // Find the boundary between the number and its unit suffix.
        let idx = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("duration '{s}' missing unit suffix"))?;
        let (num_part, tail) = rest.split_at(idx);
        if num_part.is_empty() {
            return Err(format!("invalid duration '{s}': expected a number"));
        }
        let value: f64 = num_part
            .parse()
            .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);

        let nanos_per_unit: f64 = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => {
                return Err(format!(
                    "unsupported duration unit '{}'; expected ns, us, ms, s, m, or h",
                    unit
                ));
            }
        };

        total += Duration::from_nanos((value * nanos_per_unit).round() as u64);
        rest = next;
    }

    Ok(total)
}

/// Parse an optional duration string, treating `None` as "not set".
pub fn parse_optional(s: Option<&str>) -> Result<Option<Duration>, String> {
    s.map(parse_duration).transpose()
}
