//! Display-timezone conversion for schedule fields.
//!
//! The database stores `schedule_time` (and the weekly/monthly `schedule_day`
//! it may shift) in UTC. When the management layer accepts a time entered in a
//! display zone, it must convert at save time using the zone's offset *at that
//! moment*, not a cached historical offset. Both directions live here so reads
//! can render the stored UTC values back in the user's zone.
//!
//! Only daily, weekly and monthly schedules carry an `HH:MM`; interval,
//! hourly and manual schedules have nothing zone-dependent to convert.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::schedule::{ScheduleKind, TimeOfDay};

/// Convert a display-zone schedule to its UTC representation.
///
/// Returns the UTC `HH:MM` string and the possibly day-shifted
/// `schedule_day`. `at` is the reference instant whose offset is used
/// (normally "now", when the user saves).
pub fn schedule_to_utc(
    kind: ScheduleKind,
    time: &str,
    day: Option<i16>,
    zone: &str,
    at: DateTime<Utc>,
) -> Result<(String, Option<i16>)> {
    let offset = zone_offset_seconds(zone, at)?;
    shift_schedule(kind, time, day, -offset)
}

/// Convert a stored UTC schedule to its display-zone representation.
pub fn schedule_from_utc(
    kind: ScheduleKind,
    time: &str,
    day: Option<i16>,
    zone: &str,
    at: DateTime<Utc>,
) -> Result<(String, Option<i16>)> {
    let offset = zone_offset_seconds(zone, at)?;
    shift_schedule(kind, time, day, offset)
}

fn zone_offset_seconds(zone: &str, at: DateTime<Utc>) -> Result<i64> {
    let tz: Tz = zone
        .parse()
        .map_err(|_| Error::InvalidTimezone(zone.to_string()))?;
    let offset = tz.offset_from_utc_datetime(&at.naive_utc()).fix();
    Ok(i64::from(offset.local_minus_utc()))
}

/// Shift an `HH:MM` (+ optional day) by a signed offset, wrapping the day
/// field within its domain: 0-6 for weekly, 1-31 for monthly.
///
/// The arithmetic runs on an anchor date chosen so the day field is
/// well-defined: January 2001 starts on a Monday and has 31 days, so weekday
/// `w` maps to 2001-01-(1+w) and day-of-month `d` maps to 2001-01-d.
fn shift_schedule(
    kind: ScheduleKind,
    time: &str,
    day: Option<i16>,
    offset_seconds: i64,
) -> Result<(String, Option<i16>)> {
    let at: TimeOfDay = time.parse()?;
    let anchor_day = match kind {
        ScheduleKind::Daily => 15,
        ScheduleKind::Weekly => {
            let weekday = require_day(day, 0..=6)?;
            1 + u32::from(weekday as u16)
        }
        ScheduleKind::Monthly => {
            let dom = require_day(day, 1..=31)?;
            u32::from(dom as u16)
        }
        // Nothing zone-dependent to shift.
        _ => return Ok((time.to_string(), day)),
    };

    let base = anchor_datetime(anchor_day, at);
    let shifted = base + Duration::seconds(offset_seconds);
    let day_delta = (shifted.date() - base.date()).num_days();

    let new_time = format!(
        "{:02}:{:02}",
        chrono::Timelike::hour(&shifted.time()),
        chrono::Timelike::minute(&shifted.time())
    );
    let new_day = match kind {
        ScheduleKind::Weekly => {
            let weekday = i64::from(day.unwrap_or(0));
            Some(((weekday + day_delta).rem_euclid(7)) as i16)
        }
        ScheduleKind::Monthly => {
            let dom = i64::from(day.unwrap_or(1));
            Some(((dom - 1 + day_delta).rem_euclid(31) + 1) as i16)
        }
        _ => None,
    };
    Ok((new_time, new_day))
}

fn require_day(day: Option<i16>, range: std::ops::RangeInclusive<i16>) -> Result<i16> {
    let value =
        day.ok_or_else(|| Error::InvalidSchedule("schedule_day is required".into()))?;
    if !range.contains(&value) {
        return Err(Error::InvalidSchedule(format!(
            "schedule_day out of range: {value}"
        )));
    }
    Ok(value)
}

fn anchor_datetime(day: u32, at: TimeOfDay) -> NaiveDateTime {
    // Valid by construction: January has 31 days and `at` is range-checked.
    NaiveDate::from_ymd_opt(2001, 1, day)
        .and_then(|d| d.and_hms_opt(at.hour, at.minute, 0))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const HKT: &str = "Asia/Hong_Kong"; // UTC+8, no DST

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap()
    }

    #[test]
    fn daily_morning_to_utc() {
        let (time, day) = schedule_to_utc(ScheduleKind::Daily, "09:00", None, HKT, at()).unwrap();
        assert_eq!(time, "01:00");
        assert_eq!(day, None);
    }

    #[test]
    fn daily_evening_to_utc_same_day() {
        let (time, _) = schedule_to_utc(ScheduleKind::Daily, "22:00", None, HKT, at()).unwrap();
        assert_eq!(time, "14:00");
    }

    #[test]
    fn daily_midnight_crosses_to_previous_utc_day() {
        // 00:30 local UTC+8 is 16:30 UTC of the previous day; the stored
        // string is what the scheduler's arithmetic consumes directly.
        let (time, _) = schedule_to_utc(ScheduleKind::Daily, "00:30", None, HKT, at()).unwrap();
        assert_eq!(time, "16:30");
    }

    #[test]
    fn daily_boundaries() {
        let (t, _) = schedule_to_utc(ScheduleKind::Daily, "23:00", None, HKT, at()).unwrap();
        assert_eq!(t, "15:00");
        let (t, _) = schedule_to_utc(ScheduleKind::Daily, "01:00", None, HKT, at()).unwrap();
        assert_eq!(t, "17:00");
    }

    #[test]
    fn weekly_same_day() {
        // Monday 09:00 local stays Monday in UTC.
        let (time, day) =
            schedule_to_utc(ScheduleKind::Weekly, "09:00", Some(0), HKT, at()).unwrap();
        assert_eq!(time, "01:00");
        assert_eq!(day, Some(0));
    }

    #[test]
    fn weekly_rolls_back_a_day() {
        // Sunday 02:00 local is Saturday 18:00 UTC.
        let (time, day) =
            schedule_to_utc(ScheduleKind::Weekly, "02:00", Some(6), HKT, at()).unwrap();
        assert_eq!(time, "18:00");
        assert_eq!(day, Some(5));
        // Monday 03:00 local wraps to Sunday.
        let (time, day) =
            schedule_to_utc(ScheduleKind::Weekly, "03:00", Some(0), HKT, at()).unwrap();
        assert_eq!(time, "19:00");
        assert_eq!(day, Some(6));
    }

    #[test]
    fn monthly_same_day_and_rollback() {
        let (time, day) =
            schedule_to_utc(ScheduleKind::Monthly, "09:00", Some(1), HKT, at()).unwrap();
        assert_eq!((time.as_str(), day), ("01:00", Some(1)));

        let (time, day) =
            schedule_to_utc(ScheduleKind::Monthly, "01:00", Some(15), HKT, at()).unwrap();
        assert_eq!((time.as_str(), day), ("17:00", Some(14)));

        // Day 1 early morning wraps to day 31.
        let (time, day) =
            schedule_to_utc(ScheduleKind::Monthly, "05:00", Some(1), HKT, at()).unwrap();
        assert_eq!((time.as_str(), day), ("21:00", Some(31)));
    }

    #[test]
    fn weekly_round_trip() {
        let (utc_time, utc_day) =
            schedule_to_utc(ScheduleKind::Weekly, "15:30", Some(3), HKT, at()).unwrap();
        let (local_time, local_day) =
            schedule_from_utc(ScheduleKind::Weekly, &utc_time, utc_day, HKT, at()).unwrap();
        assert_eq!(local_time, "15:30");
        assert_eq!(local_day, Some(3));
    }

    #[test]
    fn monthly_round_trip() {
        let (utc_time, utc_day) =
            schedule_to_utc(ScheduleKind::Monthly, "23:45", Some(20), HKT, at()).unwrap();
        let (local_time, local_day) =
            schedule_from_utc(ScheduleKind::Monthly, &utc_time, utc_day, HKT, at()).unwrap();
        assert_eq!(local_time, "23:45");
        assert_eq!(local_day, Some(20));
    }

    #[test]
    fn every_hour_round_trips_daily() {
        for hour in 0..24 {
            let entered = format!("{hour:02}:00");
            let (utc_time, _) =
                schedule_to_utc(ScheduleKind::Daily, &entered, None, HKT, at()).unwrap();
            let (back, _) =
                schedule_from_utc(ScheduleKind::Daily, &utc_time, None, HKT, at()).unwrap();
            assert_eq!(back, entered);
        }
    }

    #[test]
    fn every_weekday_round_trips() {
        for day in 0..7 {
            let (utc_time, utc_day) =
                schedule_to_utc(ScheduleKind::Weekly, "12:00", Some(day), HKT, at()).unwrap();
            assert!((0..=6).contains(&utc_day.unwrap()));
            let (back_time, back_day) =
                schedule_from_utc(ScheduleKind::Weekly, &utc_time, utc_day, HKT, at()).unwrap();
            assert_eq!(back_time, "12:00");
            assert_eq!(back_day, Some(day));
        }
    }

    #[test]
    fn interval_passes_through() {
        let (time, day) =
            schedule_to_utc(ScheduleKind::Interval, "09:00", None, HKT, at()).unwrap();
        assert_eq!((time.as_str(), day), ("09:00", None));
    }

    #[test]
    fn unknown_zone_is_rejected() {
        assert!(schedule_to_utc(ScheduleKind::Daily, "09:00", None, "Mars/Olympus", at()).is_err());
    }
}
