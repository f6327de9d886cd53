//! Delay computation for absolute times and cron expressions.
//!
//! The broker only understands relative delays in whole seconds, so every
//! schedule is turned into "seconds from now", rounded up.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::ConfigError;

/// Whole seconds from `now` until `target`, rounded up; zero if `target` has passed.
pub fn seconds_until(target: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (target - now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis as u64).div_ceil(1000)
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parses a cron expression.
///
/// Classic five-field expressions (`min hour dom month dow`) are accepted
/// and run at second zero. Their day-of-week field counts from 0 = Sunday
/// (7 is Sunday too), as in crontab.
pub fn parse_cron(expression: &str) -> Result<Schedule, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidCron {
        expression: expression.to_string(),
        message,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = if let [minute, hour, dom, month, dow] = fields.as_slice() {
        let dow = crontab_days(dow).map_err(invalid)?;
        format!("0 {} {} {} {} {}", minute, hour, dom, month, dow)
    } else {
        fields.join(" ")
    };
    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// Rewrites a crontab day-of-week field with day names.
///
/// Numeric lists, ranges and steps are expanded; named days are kept as is.
fn crontab_days(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days: Vec<&str> = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(parse_day_number(step)?)),
            None => (part, None),
        };
        if !range.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '*') {
            days.push(part);
            continue;
        }

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((start, end)) = range.split_once('-') {
            (parse_day_number(start)?, parse_day_number(end)?)
        } else {
            let start = parse_day_number(range)?;
            (start, if step.is_some() { 6 } else { start })
        };
        if start > 7 || end > 7 || start > end {
            return Err(format!("invalid day of week '{}'", part));
        }
        let step = match step {
            Some(0) => return Err(format!("invalid step in '{}'", part)),
            Some(step) => step as usize,
            None => 1,
        };

        for day in (start..=end).step_by(step) {
            let name = DAY_NAMES[(day % 7) as usize];
            if !days.contains(&name) {
                days.push(name);
            }
        }
    }
    Ok(days.join(","))
}

fn parse_day_number(value: &str) -> Result<u32, String> {
    value
        .parse()
        .map_err(|_| format!("invalid day of week '{}'", value))
}

/// Seconds from `now` until the next occurrence of `expression`.
pub fn seconds_until_next(expression: &str, now: DateTime<Utc>) -> Result<u64, ConfigError> {
    let schedule = parse_cron(expression)?;
    let next = schedule
        .after(&now)
        .next()
        .ok_or_else(|| ConfigError::InvalidCron {
            expression: expression.to_string(),
            message: "no upcoming occurrence".to_string(),
        })?;
    Ok(seconds_until(next, now))
}
