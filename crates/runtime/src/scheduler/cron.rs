//! Timezone-aware cron evaluator (5-field: min hour dom month dow).

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Parse a timezone string into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

/// Check that an expression has five parseable fields. `register_task`
/// rejects anything else up front.
pub fn validate_cron(cron: &str) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    fields.iter().all(|f| field_is_well_formed(f))
}

fn field_is_well_formed(field: &str) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return step.parse::<u32>().map(|n| n > 0).unwrap_or(false);
    }
    field.split(',').all(|part| {
        if let Some((start, end)) = part.split_once('-') {
            start.parse::<u32>().is_ok() && end.parse::<u32>().is_ok()
        } else {
            part.parse::<u32>().is_ok()
        }
    })
}

/// Parse a cron field and check if a value matches.
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    // */N (every N)
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    // Comma-separated values, each a plain number or an N-M range.
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Check if a **local** naive datetime matches a 5-field cron expression.
fn cron_matches_naive(cron: &str, dt: &chrono::NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Compute the next occurrence after `after` for a cron expression,
/// evaluated in the given timezone. Returns a UTC `DateTime`.
///
/// DST handling: local times inside a spring-forward gap are skipped;
/// fall-back overlaps resolve to the earliest (pre-transition) mapping.
pub fn cron_next_tz(cron: &str, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;

    // Advance to the next whole local minute.
    let local_after = after.with_timezone(&tz).naive_local();
    let next_min_secs = 60 - (local_after.second() as i64);
    let mut candidate = local_after + chrono::Duration::seconds(next_min_secs);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if cron_matches_naive(cron, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {
                    // DST gap — this local minute doesn't exist.
                }
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}
