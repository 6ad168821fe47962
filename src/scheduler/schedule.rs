//! Cron job definitions and their `HH:MM:SS` schedules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// One field of a schedule: a fixed value or `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Every,
    At(u32),
}

impl Field {
    fn parse(expr: &str, raw: &str, name: &str, max: u32) -> Result<Self, ScheduleError> {
        if raw == "*" {
            return Ok(Field::Every);
        }
        let invalid = |reason: String| ScheduleError::InvalidSchedule {
            expr: expr.to_string(),
            reason,
        };
        let value: u32 = raw
            .parse()
            .map_err(|_| invalid(format!("{name} '{raw}' is not a number or '*'")))?;
        if value >= max {
            return Err(invalid(format!("{name} {value} out of range (0..{max})")));
        }
        Ok(Field::At(value))
    }

    fn cron_token(&self) -> String {
        match self {
            Field::Every => "*".to_string(),
            Field::At(v) => v.to_string(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Every => write!(f, "*"),
            Field::At(v) => write!(f, "{v:02}"),
        }
    }
}

/// A daily schedule over hour, minute and second.
///
/// Written as `HH:MM:SS` where any field may be `*`:
/// `00:00:00` fires at midnight, `*:*:00` every minute,
/// `*:30:00` at half past every hour.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    pub hour: Field,
    pub minute: Field,
    pub second: Field,
    compiled: cron::Schedule,
}

impl CronSchedule {
    pub fn new(hour: Field, minute: Field, second: Field) -> Result<Self, ScheduleError> {
        let expr = format!(
            "{} {} {} * * *",
            second.cron_token(),
            minute.cron_token(),
            hour.cron_token()
        );
        let compiled = cron::Schedule::from_str(&expr).map_err(|e| ScheduleError::InvalidSchedule {
            expr: expr.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            hour,
            minute,
            second,
            compiled,
        })
    }

    /// Every day at `hour:minute:second` UTC.
    pub fn daily(hour: u32, minute: u32, second: u32) -> Result<Self, ScheduleError> {
        format!("{hour:02}:{minute:02}:{second:02}").parse()
    }

    /// First instant matching the schedule strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.compiled.after(&after).next()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.hour == other.hour && self.minute == other.minute && self.second == other.second
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let [h, m, sec] = parts.as_slice() else {
            return Err(ScheduleError::InvalidSchedule {
                expr: s.to_string(),
                reason: "expected HH:MM:SS".to_string(),
            });
        };
        Self::new(
            Field::parse(s, h, "hour", 24)?,
            Field::parse(s, m, "minute", 60)?,
            Field::parse(s, sec, "second", 60)?,
        )
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.hour, self.minute, self.second)
    }
}

/// A recurring job that enqueues `handler_type` on its schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct CronJobDefinition {
    pub name: String,
    pub handler_type: String,
    pub schedule: CronSchedule,
    /// Payload attached to every envelope this job fires.
    pub payload: serde_json::Value,
    pub last_fired_at: Option<DateTime<Utc>>,
    /// `None` once the schedule has no upcoming instant.
    pub next_fire_at: Option<DateTime<Utc>>,
}

impl CronJobDefinition {
    pub fn new(
        name: impl Into<String>,
        handler_type: impl Into<String>,
        schedule: CronSchedule,
    ) -> Self {
        Self {
            name: name.into(),
            handler_type: handler_type.into(),
            schedule,
            payload: serde_json::Value::Null,
            last_fired_at: None,
            next_fire_at: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_at.is_some_and(|next| next <= now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn parse_fixed_and_wildcards() {
        let s: CronSchedule = "00:00:00".parse().unwrap();
        assert_eq!(s.hour, Field::At(0));
        assert_eq!(s.to_string(), "00:00:00");

        let s: CronSchedule = "*:30:00".parse().unwrap();
        assert_eq!(s.hour, Field::Every);
        assert_eq!(s.minute, Field::At(30));
        assert_eq!(s.to_string(), "*:30:00");
    }

    #[test]
    fn parse_rejects_bad_input() {
        for bad in ["24:00:00", "00:60:00", "00:00:60", "12:00", "ab:00:00", "1:2:3:4", ""] {
            assert!(
                matches!(
                    bad.parse::<CronSchedule>(),
                    Err(ScheduleError::InvalidSchedule { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn daily_next_after_is_strict() {
        let s = CronSchedule::daily(0, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap();
        assert_eq!(s.next_after(at(12, 0, 0)), Some(midnight));
        assert_eq!(
            s.next_after(midnight),
            Some(midnight + chrono::Duration::days(1))
        );
    }

    #[test]
    fn hourly_and_minutely() {
        let half_past: CronSchedule = "*:30:00".parse().unwrap();
        assert_eq!(half_past.next_after(at(9, 30, 0)), Some(at(10, 30, 0)));
        assert_eq!(half_past.next_after(at(9, 10, 5)), Some(at(9, 30, 0)));

        let minutely: CronSchedule = "*:*:00".parse().unwrap();
        assert_eq!(minutely.next_after(at(9, 10, 5)), Some(at(9, 11, 0)));
    }

    #[test]
    fn due_only_with_next_fire() {
        let schedule = CronSchedule::daily(0, 0, 0).unwrap();
        let mut job = CronJobDefinition::new("nightly", "noop", schedule);
        assert!(!job.is_due(at(0, 0, 0)));
        job.next_fire_at = Some(at(0, 0, 0));
        assert!(job.is_due(at(0, 0, 0)));
        assert!(!job.is_due(at(0, 0, 0) - chrono::Duration::seconds(1)));
    }
}
