//! Schedule-expression parsing and next-run computation.
//!
//! Two forms: `every <int><unit>` with unit in {m, h, d}, and
//! `daily HH:MM` in local time. Anything else parses to `None`, which
//! disables the task after its next fire.

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Timelike};

/// A parsed schedule expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Relative repeat from the firing instant.
    Every { interval_ms: u64 },
    /// Next occurrence of HH:MM local time.
    Daily { hour: u32, minute: u32 },
}

/// Parse a schedule expression. `None` for anything unrecognized.
#[must_use]
pub fn parse(expr: &str) -> Option<Schedule> {
    let trimmed = expr.trim();

    if let Some(rest) = trimmed.strip_prefix("every ") {
        let rest = rest.trim();
        let unit = rest.chars().last()?;
        let count: u64 = rest[..rest.len() - unit.len_utf8()].trim().parse().ok()?;
        if count == 0 {
            return None;
        }
        let unit_ms = match unit {
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            _ => return None,
        };
        return Some(Schedule::Every {
            interval_ms: count * unit_ms,
        });
    }

    if let Some(rest) = trimmed.strip_prefix("daily ") {
        let time = NaiveTime::parse_from_str(rest.trim(), "%H:%M").ok()?;
        return Some(Schedule::Daily {
            hour: time.hour(),
            minute: time.minute(),
        });
    }

    None
}

/// Next run in epoch millis for a schedule fired (or created) at `now_ms`,
/// evaluated in the local timezone. `None` when the expression is
/// unrecognized — the task is disabled after fire instead of rescheduled.
#[must_use]
pub fn calculate_next(expr: &str, now_ms: u64) -> Option<u64> {
    calculate_next_in(expr, now_ms, &Local)
}

/// [`calculate_next`] in an explicit timezone, for deterministic tests.
#[must_use]
pub fn calculate_next_in<Tz: TimeZone>(expr: &str, now_ms: u64, tz: &Tz) -> Option<u64> {
    match parse(expr)? {
        Schedule::Every { interval_ms } => Some(now_ms + interval_ms),
        Schedule::Daily { hour, minute } => {
            let now: DateTime<Tz> = tz
                .timestamp_millis_opt(now_ms as i64)
                .single()?;
            let today_at = now
                .clone()
                .with_hour(hour)?
                .with_minute(minute)?
                .with_second(0)?
                .with_nanosecond(0)?;
            let next = if today_at > now {
                today_at
            } else {
                today_at + Duration::days(1)
            };
            Some(next.timestamp_millis() as u64)
        },
    }
}

/// Validation entry point for task create/update: is the expression one of
/// the recognized forms?
#[must_use]
pub fn is_valid(expr: &str) -> bool {
    parse(expr).is_some()
}
