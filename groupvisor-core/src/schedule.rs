//! Schedule parsing and next-run computation.
//!
//! Three kinds:
//! - `cron`: five-field (or six/seven-field with seconds) expression, evaluated
//!   in the configured timezone
//! - `interval`: positive integer milliseconds
//! - `once`: an absolute timestamp; no next run after it fires

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("unknown schedule type: {0}")]
    UnknownKind(String),
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("invalid interval {0:?}: expected a positive number of milliseconds")]
    InvalidInterval(String),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleKind::Cron => "cron",
            ScheduleKind::Interval => "interval",
            ScheduleKind::Once => "once",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleKind {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(ScheduleKind::Cron),
            "interval" => Ok(ScheduleKind::Interval),
            "once" => Ok(ScheduleKind::Once),
            other => Err(ScheduleError::UnknownKind(other.to_string())),
        }
    }
}

/// A validated schedule.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron { schedule: Box<cron::Schedule>, tz: Tz },
    Interval(chrono::Duration),
    Once(DateTime<Utc>),
}

impl Schedule {
    pub fn parse(kind: ScheduleKind, value: &str, tz: Tz) -> Result<Self, ScheduleError> {
        let value = value.trim();
        match kind {
            ScheduleKind::Cron => {
                let normalized = normalize_cron(value);
                let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
                    ScheduleError::InvalidCron {
                        expr: value.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Schedule::Cron {
                    schedule: Box::new(schedule),
                    tz,
                })
            }
            ScheduleKind::Interval => {
                let ms: i64 = value
                    .parse()
                    .map_err(|_| ScheduleError::InvalidInterval(value.to_string()))?;
                if ms <= 0 {
                    return Err(ScheduleError::InvalidInterval(value.to_string()));
                }
                Ok(Schedule::Interval(chrono::Duration::milliseconds(ms)))
            }
            ScheduleKind::Once => parse_instant(value, tz).map(Schedule::Once),
        }
    }

    pub fn parse_str(kind: &str, value: &str, tz: Tz) -> Result<Self, ScheduleError> {
        Self::parse(kind.parse()?, value, tz)
    }

    /// When a freshly created job should first run.
    pub fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once(at) => Some(*at),
            other => other.next_run_after(now),
        }
    }

    /// Next run after a completed run at `now`. `None` for one-shots.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { schedule, tz } => schedule
                .after(&now.with_timezone(tz))
                .next()
                .map(|dt| dt.with_timezone(&Utc)),
            Schedule::Interval(every) => Some(now + *every),
            Schedule::Once(_) => None,
        }
    }
}

/// RFC 3339, or a naive local timestamp interpreted in `tz`.
fn parse_instant(value: &str, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ScheduleError::InvalidTimestamp(value.to_string()))
}

/// Accept classic five-field cron by adding a seconds column and rewriting
/// numeric weekdays (0 and 7 are Sunday) into names.
fn normalize_cron(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    let dow = normalize_weekdays(fields[4]);
    format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], dow
    )
}

fn normalize_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|part| match part.split_once('/') {
            Some((base, step)) => format!("{}/{}", weekday_range(base), step),
            None => weekday_range(part),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn weekday_range(range: &str) -> String {
    range
        .split('-')
        .map(|token| match token {
            "0" | "7" => "Sun",
            "1" => "Mon",
            "2" => "Tue",
            "3" => "Wed",
            "4" => "Thu",
            "5" => "Fri",
            "6" => "Sat",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("-")
}
