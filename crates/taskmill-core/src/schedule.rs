//! Schedule definitions and next-run arithmetic.
//!
//! A [`Schedule`] is the validated, typed form of the raw schedule columns on
//! a job row. Construction rejects any column combination that does not match
//! the schedule kind, so the scheduler never has to re-validate mid-cycle.
//!
//! All arithmetic is on timezone-aware UTC instants. A computed next run is
//! always strictly after the reference instant, never equal to it, so storing
//! the result immediately after a dispatch cannot re-fire the same tick.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// The six supported schedule kinds, as stored in `scheduled_jobs.schedule_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ScheduleKind {
    Interval,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Manual,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Interval => "interval",
            ScheduleKind::Hourly => "hourly",
            ScheduleKind::Daily => "daily",
            ScheduleKind::Weekly => "weekly",
            ScheduleKind::Monthly => "monthly",
            ScheduleKind::Manual => "manual",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wall-clock time of day in UTC, parsed from `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::InvalidTime(format!("{hour:02}:{minute:02}")));
        }
        Ok(Self { hour, minute })
    }
}

impl FromStr for TimeOfDay {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidTime(s.to_string()))?;
        let hour = h
            .parse::<u32>()
            .map_err(|_| Error::InvalidTime(s.to_string()))?;
        let minute = m
            .parse::<u32>()
            .map_err(|_| Error::InvalidTime(s.to_string()))?;
        TimeOfDay::new(hour, minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// A validated schedule, ready for next-run arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fire every `every_seconds` seconds.
    Interval { every_seconds: u32 },
    /// Fire when the minute hand reaches `minute` (0-59).
    Hourly { minute: u32 },
    /// Fire every day at the given UTC time.
    Daily { at: TimeOfDay },
    /// Fire every week on `weekday` (0 = Monday .. 6 = Sunday) at the given time.
    Weekly { weekday: u32, at: TimeOfDay },
    /// Fire monthly on day-of-month `day` (1-31), skipping months too short
    /// to contain it.
    Monthly { day: u32, at: TimeOfDay },
    /// Never fires on its own; runs only when the management layer requests it.
    Manual,
}

impl Schedule {
    /// Build a schedule from the raw job columns, rejecting combinations that
    /// do not match the kind.
    pub fn from_parts(
        kind: ScheduleKind,
        interval_seconds: Option<i64>,
        schedule_minute: Option<i16>,
        schedule_time: Option<&str>,
        schedule_day: Option<i16>,
    ) -> Result<Self> {
        match kind {
            ScheduleKind::Interval => {
                let secs = interval_seconds
                    .ok_or_else(|| Error::InvalidSchedule("interval_seconds is required".into()))?;
                let every_seconds = u32::try_from(secs)
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| {
                        Error::InvalidSchedule(format!("interval_seconds must be positive: {secs}"))
                    })?;
                Ok(Schedule::Interval { every_seconds })
            }
            ScheduleKind::Hourly => {
                let minute = schedule_minute
                    .ok_or_else(|| Error::InvalidSchedule("schedule_minute is required".into()))?;
                if !(0..=59).contains(&minute) {
                    return Err(Error::InvalidSchedule(format!(
                        "schedule_minute out of range: {minute}"
                    )));
                }
                Ok(Schedule::Hourly {
                    minute: minute as u32,
                })
            }
            ScheduleKind::Daily => Ok(Schedule::Daily {
                at: parse_time(schedule_time)?,
            }),
            ScheduleKind::Weekly => {
                let weekday = schedule_day
                    .ok_or_else(|| Error::InvalidSchedule("schedule_day is required".into()))?;
                if !(0..=6).contains(&weekday) {
                    return Err(Error::InvalidSchedule(format!(
                        "weekday out of range: {weekday}"
                    )));
                }
                Ok(Schedule::Weekly {
                    weekday: weekday as u32,
                    at: parse_time(schedule_time)?,
                })
            }
            ScheduleKind::Monthly => {
                let day = schedule_day
                    .ok_or_else(|| Error::InvalidSchedule("schedule_day is required".into()))?;
                if !(1..=31).contains(&day) {
                    return Err(Error::InvalidSchedule(format!(
                        "day of month out of range: {day}"
                    )));
                }
                Ok(Schedule::Monthly {
                    day: day as u32,
                    at: parse_time(schedule_time)?,
                })
            }
            ScheduleKind::Manual => Ok(Schedule::Manual),
        }
    }

    pub fn kind(&self) -> ScheduleKind {
        match self {
            Schedule::Interval { .. } => ScheduleKind::Interval,
            Schedule::Hourly { .. } => ScheduleKind::Hourly,
            Schedule::Daily { .. } => ScheduleKind::Daily,
            Schedule::Weekly { .. } => ScheduleKind::Weekly,
            Schedule::Monthly { .. } => ScheduleKind::Monthly,
            Schedule::Manual => ScheduleKind::Manual,
        }
    }

    /// The next instant strictly after `now` at which this schedule fires.
    ///
    /// Returns `None` for manual schedules: they are only ever triggered by
    /// the management layer writing `next_run` directly.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Schedule::Manual => None,
            Schedule::Interval { every_seconds } => {
                Some(now + Duration::seconds(i64::from(every_seconds)))
            }
            Schedule::Hourly { minute } => {
                let candidate = now.date_naive().and_hms_opt(now.hour(), minute, 0)?.and_utc();
                Some(if candidate <= now {
                    candidate + Duration::hours(1)
                } else {
                    candidate
                })
            }
            Schedule::Daily { at } => {
                let candidate = at_time(now.date_naive(), at)?;
                Some(if candidate <= now {
                    candidate + Duration::days(1)
                } else {
                    candidate
                })
            }
            Schedule::Weekly { weekday, at } => {
                let today = now.date_naive();
                let ahead = (i64::from(weekday)
                    - i64::from(today.weekday().num_days_from_monday()))
                .rem_euclid(7);
                let candidate = at_time(today + Duration::days(ahead), at)?;
                Some(if candidate <= now {
                    candidate + Duration::days(7)
                } else {
                    candidate
                })
            }
            Schedule::Monthly { day, at } => {
                let mut year = now.year();
                let mut month = now.month();
                // Day 31 recurs at most every other month; 48 iterations is
                // far beyond any gap between valid months.
                for _ in 0..48 {
                    if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                        let candidate = at_time(date, at)?;
                        if candidate > now {
                            return Some(candidate);
                        }
                    }
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                }
                None
            }
        }
    }
}

fn parse_time(schedule_time: Option<&str>) -> Result<TimeOfDay> {
    schedule_time
        .ok_or_else(|| Error::InvalidSchedule("schedule_time is required".into()))?
        .parse()
}

fn at_time(date: NaiveDate, at: TimeOfDay) -> Option<DateTime<Utc>> {
    Some(date.and_hms_opt(at.hour, at.minute, 0)?.and_utc())
}
