//! Photoperiod arithmetic in site-local time (fixed UTC offset).

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Timelike, Utc};

const MINUTES_PER_DAY: i64 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightSchedule {
    on: NaiveTime,
    off: NaiveTime,
    offset: FixedOffset,
}

/// Parse `"HH:MM"`.
pub fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").with_context(|| format!("invalid time of day '{s}' (expected HH:MM)"))
}

impl LightSchedule {
    pub fn new(on: NaiveTime, off: NaiveTime, utc_offset_minutes: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or_else(|| anyhow!("utc offset {utc_offset_minutes} min out of range"))?;
        if on == off {
            return Err(anyhow!("lights_on and lights_off are both {on}"));
        }
        Ok(Self { on, off, offset })
    }

    pub fn parse(on: &str, off: &str, utc_offset_minutes: i32) -> Result<Self> {
        Self::new(parse_hhmm(on)?, parse_hhmm(off)?, utc_offset_minutes)
    }

    pub fn local(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        now.with_timezone(&self.offset)
    }

    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local(now).date_naive()
    }

    pub fn is_on(&self, now: DateTime<Utc>) -> bool {
        let t = minute_of_day(self.local(now).time());
        let on = minute_of_day(self.on);
        let off = minute_of_day(self.off);
        if on < off {
            t >= on && t < off
        } else {
            t >= on || t < off
        }
    }

    /// Minutes until lights-off, `None` while dark.
    pub fn minutes_until_off(&self, now: DateTime<Utc>) -> Option<f64> {
        if !self.is_on(now) {
            return None;
        }
        Some(minutes_between(self.local(now).time(), self.off))
    }

    /// Minutes since lights-on, `None` while dark.
    pub fn minutes_since_on(&self, now: DateTime<Utc>) -> Option<f64> {
        if !self.is_on(now) {
            return None;
        }
        Some(minutes_between(self.on, self.local(now).time()))
    }

    /// Length of the dark period in minutes.
    pub fn dark_minutes(&self) -> f64 {
        minutes_between(self.off, self.on)
    }

    /// The most recent lights-on instant at or before `now`.
    pub fn last_lights_on(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let since = minutes_between(self.on, self.local(now).time());
        now - Duration::seconds((since * 60.0).round() as i64)
    }
}

fn minute_of_day(t: NaiveTime) -> i64 {
    (t.hour() * 60 + t.minute()) as i64
}

/// Forward distance from `from` to `to` on the 24h clock, in minutes.
fn minutes_between(from: NaiveTime, to: NaiveTime) -> f64 {
    let from_s = from.num_seconds_from_midnight() as i64;
    let to_s = to.num_seconds_from_midnight() as i64;
    (to_s - from_s).rem_euclid(MINUTES_PER_DAY * 60) as f64 / 60.0
}

pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 5, h, m, 0).unwrap()
    }

    #[test]
    fn daytime_schedule() {
        let s = LightSchedule::parse("06:00", "18:00", 0).unwrap();
        assert!(!s.is_on(at(5, 59)));
        assert!(s.is_on(at(6, 0)));
        assert!(s.is_on(at(17, 59)));
        assert!(!s.is_on(at(18, 0)));
        assert_eq!(s.minutes_until_off(at(17, 0)), Some(60.0));
        assert_eq!(s.minutes_since_on(at(7, 30)), Some(90.0));
        assert_eq!(s.minutes_until_off(at(20, 0)), None);
        assert_eq!(s.dark_minutes(), 720.0);
    }

    #[test]
    fn schedule_wrapping_midnight() {
        let s = LightSchedule::parse("20:00", "08:00", 0).unwrap();
        assert!(s.is_on(at(23, 0)));
        assert!(s.is_on(at(2, 0)));
        assert!(!s.is_on(at(12, 0)));
        assert_eq!(s.minutes_until_off(at(23, 0)), Some(540.0));
    }

    #[test]
    fn offset_shifts_local_time() {
        // 06:00 local at UTC+2 is 04:00 UTC
        let s = LightSchedule::parse("06:00", "18:00", 120).unwrap();
        assert!(s.is_on(at(4, 0)));
        assert!(!s.is_on(at(3, 59)));
        assert_eq!(s.last_lights_on(at(5, 0)), at(4, 0));
    }

    #[test]
    fn equal_times_rejected() {
        assert!(LightSchedule::parse("06:00", "06:00", 0).is_err());
        assert!(parse_hhmm("25:00").is_err());
    }

    #[test]
    fn week_starts_on_monday() {
        // 2024-06-05 is a Wednesday
        let d = NaiveDate::from_ymd_opt(2024, 6, 5).unwrap();
        assert_eq!(week_start(d), NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
    }
}
