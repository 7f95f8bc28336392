//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Field syntax: *, */N, N, A-B, A-B/N and comma-separated lists of those.
//! Example: "*/10 * * * *" = every ten minutes

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

/// Upper bound on candidate minutes examined (a bit over one year).
const MAX_STEPS: usize = 370 * 24 * 60;

/// Parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Option<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            tracing::warn!(
                "Invalid cron expression: '{}' (need 5 fields: MIN HOUR DOM MON DOW)",
                expression
            );
            return None;
        }

        let mut days_of_week = parse_field(parts[4], 0, 7)?;
        // 7 is an alias for Sunday.
        for d in days_of_week.iter_mut() {
            if *d == 7 {
                *d = 0;
            }
        }
        days_of_week.sort_unstable();
        days_of_week.dedup();

        let days_of_month = parse_field(parts[2], 1, 31)?;
        // A day field is restricted when it excludes some day, however written.
        let dom_restricted = days_of_month.len() != 31;
        let dow_restricted = days_of_week.len() != 7;

        Some(Self {
            minutes: parse_field(parts[0], 0, 59)?,
            hours: parse_field(parts[1], 0, 23)?,
            days_of_month,
            months: parse_field(parts[3], 1, 12)?,
            days_of_week,
            dom_restricted,
            dow_restricted,
        })
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        if !self.months.contains(&t.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(&t.day());
        let dow = self
            .days_of_week
            .contains(&t.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted, either may match.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        for _ in 0..MAX_STEPS {
            if !self.day_matches(&candidate) {
                candidate = (candidate + Duration::days(1)).with_hour(0)?.with_minute(0)?;
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = (candidate + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if !self.minutes.contains(&candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }
}

/// Parse a cron expression and compute the next run time.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    CronSchedule::parse(expression)?.next_after(after)
}

/// Parse a cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        values.extend(parse_part(part.trim(), min, max)?);
    }
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}

fn parse_part(part: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let n: u32 = step.parse().ok()?;
            if n == 0 {
                return None;
            }
            (range, n)
        }
        None => (part, 1),
    };

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (a.parse().ok()?, b.parse().ok()?)
    } else {
        let n: u32 = range.parse().ok()?;
        // "N/S" means from N to the end of the field.
        if step > 1 { (n, max) } else { (n, n) }
    };

    if lo < min || hi > max || lo > hi {
        return None;
    }
    Some((lo..=hi).step_by(step as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_every_hour() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 30, 0).unwrap();
        let next = next_run_from_cron("0 * * * *", after).unwrap();
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_default_every_ten_minutes() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 2, 30).unwrap();
        let next = next_run_from_cron("*/10 * * * *", after).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 10, 0));

        // Exactly on a boundary moves to the following slot.
        let on = Utc.with_ymd_and_hms(2026, 2, 22, 10, 10, 0).unwrap();
        assert_eq!(next_run_from_cron("*/10 * * * *", on).unwrap().minute(), 20);
    }

    #[test]
    fn test_wraps_to_next_day() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 23, 55, 0).unwrap();
        let next = next_run_from_cron("0 8 * * *", after).unwrap();
        assert_eq!(next.day(), 23);
        assert_eq!(next.hour(), 8);
    }

    #[test]
    fn test_range_and_list() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 7, 0, 0).unwrap();
        let next = next_run_from_cron("15,45 9-17 * * *", after).unwrap();
        assert_eq!((next.hour(), next.minute()), (9, 15));
    }

    #[test]
    fn test_day_of_week() {
        // 2026-02-22 is a Sunday; next Monday is the 23rd.
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        let next = next_run_from_cron("0 9 * * 1", after).unwrap();
        assert_eq!(next.day(), 23);
        let sunday = next_run_from_cron("0 13 * * 7", after).unwrap();
        assert_eq!((sunday.day(), sunday.hour()), (22, 13));
    }

    #[test]
    fn test_full_range_step_is_unrestricted() {
        // Sunday the 22nd; "*/1" covers every day of the month, so only Monday matches.
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        let next = next_run_from_cron("0 0 */1 * 1", after).unwrap();
        assert_eq!((next.month(), next.day()), (2, 23));
        let after_that = next_run_from_cron("0 0 */1 * 1", next).unwrap();
        assert_eq!((after_that.month(), after_that.day()), (3, 2));

        let weekdays = next_run_from_cron("0 0 15 * 0-7", after).unwrap();
        assert_eq!((weekdays.month(), weekdays.day()), (3, 15));
    }

    #[test]
    fn test_month_and_day_of_month() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        let next = next_run_from_cron("30 6 1 4 *", after).unwrap();
        assert_eq!((next.month(), next.day(), next.hour(), next.minute()), (4, 1, 6, 30));
    }

    #[test]
    fn test_invalid_expression() {
        let after = Utc::now();
        assert!(next_run_from_cron("bad", after).is_none());
        assert!(next_run_from_cron("*/0 * * * *", after).is_none());
        assert!(next_run_from_cron("61 * * * *", after).is_none());
        assert!(next_run_from_cron("5-2 * * * *", after).is_none());
    }

    #[test]
    fn test_impossible_date_gives_none() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        assert!(next_run_from_cron("0 0 31 2 *", after).is_none());
    }
}
