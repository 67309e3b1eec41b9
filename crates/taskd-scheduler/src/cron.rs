//! Cron expression evaluator.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds), evaluated in UTC.
//! Fields accept `*`, `*/N`, `N`, `A-B`, `A-B/N`, `A/N` and comma lists.
//! Months and weekdays accept three-letter names; weekday `7` is Sunday.
//! Aliases: @hourly, @daily, @midnight, @weekly, @monthly, @yearly, @annually.
//!
//! When both day-of-month and day-of-week are restricted a day matches if
//! either does (classic cron rule).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use taskd_core::{Result, TaskdError};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Longest gap between two matches we search for. Feb 29 can be eight
/// years apart across a skipped leap century.
const MAX_SEARCH_DAYS: i64 = 366 * 9;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let expanded = match trimmed.to_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            _ => trimmed,
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(
                expression,
                "need 5 fields: MIN HOUR DOM MON DOW",
            ));
        }

        let minutes = parse_field(parts[0], 0, 59, None).map_err(|e| invalid(expression, &e))?;
        let hours = parse_field(parts[1], 0, 23, None).map_err(|e| invalid(expression, &e))?;
        let dom = parse_field(parts[2], 1, 31, None).map_err(|e| invalid(expression, &e))?;
        let months =
            parse_field(parts[3], 1, 12, Some(&MONTH_NAMES[..])).map_err(|e| invalid(expression, &e))?;
        // 7 is accepted as an alias for Sunday and folded onto 0 below.
        let dow =
            parse_field(parts[4], 0, 7, Some(&DAY_NAMES[..])).map_err(|e| invalid(expression, &e))?;
        let dow = (dow | (dow >> 7)) & 0x7f;

        Ok(Self {
            source: trimmed.to_string(),
            minutes,
            hours: hours as u32,
            days_of_month: dom as u32,
            months: months as u16,
            days_of_week: dow as u8,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    /// The expression as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// First firing time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?
            + Duration::minutes(1);

        let first_day = start.date_naive();
        let mut date = first_day;
        for _ in 0..MAX_SEARCH_DAYS {
            if self.day_matches(date) {
                let (h0, m0) = if date == first_day {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                for hour in h0..24 {
                    if self.hours & (1 << hour) == 0 {
                        continue;
                    }
                    let min_start = if hour == h0 { m0 } else { 0 };
                    if let Some(minute) = (min_start..60).find(|&m| self.minutes & (1 << m) != 0) {
                        let naive = date.and_hms_opt(hour, minute, 0)?;
                        return Some(Utc.from_utc_datetime(&naive));
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        let dom_ok = self.days_of_month & (1 << date.day()) != 0;
        let dow_ok = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        if self.dom_restricted && self.dow_restricted {
            dom_ok || dow_ok
        } else {
            dom_ok && dow_ok
        }
    }
}

impl FromStr for CronExpr {
    type Err = TaskdError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn invalid(expression: &str, reason: &str) -> TaskdError {
    TaskdError::InvalidSchedule(format!("cron '{expression}': {reason}"))
}

/// Parse one cron field into a bitmask where bit `n` means value `n` matches.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> std::result::Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in '{field}'"));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be > 0".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names)?, parse_value(b, names)?)
        } else {
            let v = parse_value(range, names)?;
            // "5/15" means "from 5 to the end, every 15".
            if step.is_some() { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max {
            return Err(format!("'{part}' out of range {min}-{max}"));
        }
        if lo > hi {
            return Err(format!("'{part}' has an inverted range"));
        }

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            mask |= 1 << v;
        }
    }
    Ok(mask)
}

fn parse_value(raw: &str, names: Option<&[&str]>) -> std::result::Result<u32, String> {
    if let Ok(n) = raw.parse::<u32>() {
        return Ok(n);
    }
    let lower = raw.to_lowercase();
    if let Some(names) = names {
        if let Some(pos) = names.iter().position(|n| *n == lower) {
            // Month names are 1-based, weekday names 0-based.
            let offset = if names.len() == 12 { 1 } else { 0 };
            return Ok(pos as u32 + offset);
        }
    }
    Err(format!("invalid value '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn next(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        CronExpr::parse(expr).unwrap().next_after(after).unwrap()
    }

    #[test]
    fn test_every_hour() {
        let after = utc(2026, 2, 22, 10, 30);
        assert_eq!(next("0 * * * *", after), utc(2026, 2, 22, 11, 0));
    }

    #[test]
    fn test_specific_time_same_day() {
        assert_eq!(next("0 6 * * *", utc(2026, 2, 22, 5, 0)), utc(2026, 2, 22, 6, 0));
        assert_eq!(next("0 8 * * *", utc(2026, 2, 22, 7, 0)), utc(2026, 2, 22, 8, 0));
    }

    #[test]
    fn test_specific_time_rolls_to_next_day() {
        assert_eq!(next("0 6 * * *", utc(2026, 2, 22, 6, 0)), utc(2026, 2, 23, 6, 0));
    }

    #[test]
    fn test_every_15_minutes() {
        assert_eq!(next("*/15 * * * *", utc(2026, 2, 22, 10, 2)), utc(2026, 2, 22, 10, 15));
        assert_eq!(next("*/15 * * * *", utc(2026, 2, 22, 10, 45)), utc(2026, 2, 22, 11, 0));
    }

    #[test]
    fn test_seconds_are_ignored() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 14, 59).unwrap();
        assert_eq!(next("*/15 * * * *", after), utc(2026, 2, 22, 10, 15));
    }

    #[test]
    fn test_ranges_lists_and_steps() {
        // Weekdays at 9 and 17.
        let expr = "0 9,17 * * mon-fri";
        // 2026-02-21 is a Saturday.
        assert_eq!(next(expr, utc(2026, 2, 21, 12, 0)), utc(2026, 2, 23, 9, 0));
        assert_eq!(next(expr, utc(2026, 2, 23, 9, 0)), utc(2026, 2, 23, 17, 0));
        assert_eq!(next("10-20/5 * * * *", utc(2026, 1, 1, 0, 11)), utc(2026, 1, 1, 0, 15));
        assert_eq!(next("5/20 * * * *", utc(2026, 1, 1, 0, 30)), utc(2026, 1, 1, 0, 45));
    }

    #[test]
    fn test_month_and_day_of_month() {
        assert_eq!(next("30 2 1 * *", utc(2026, 1, 15, 0, 0)), utc(2026, 2, 1, 2, 30));
        assert_eq!(next("0 0 1 jan *", utc(2026, 3, 1, 0, 0)), utc(2027, 1, 1, 0, 0));
        assert_eq!(next("0 0 31 * *", utc(2026, 4, 1, 0, 0)), utc(2026, 5, 31, 0, 0));
    }

    #[test]
    fn test_leap_day() {
        assert_eq!(next("0 0 29 2 *", utc(2026, 3, 1, 0, 0)), utc(2028, 2, 29, 0, 0));
    }

    #[test]
    fn test_dom_dow_or_rule() {
        // 1st of the month OR any Monday. 2026-03-02 is a Monday.
        assert_eq!(next("0 0 1 * 1", utc(2026, 2, 27, 0, 0)), utc(2026, 3, 1, 0, 0));
        assert_eq!(next("0 0 1 * 1", utc(2026, 3, 1, 0, 0)), utc(2026, 3, 2, 0, 0));
    }

    #[test]
    fn test_sunday_as_seven() {
        // 2026-03-01 is a Sunday.
        assert_eq!(next("0 12 * * 7", utc(2026, 2, 27, 0, 0)), utc(2026, 3, 1, 12, 0));
        assert_eq!(next("0 12 * * sun", utc(2026, 2, 27, 0, 0)), utc(2026, 3, 1, 12, 0));
    }

    #[test]
    fn test_aliases() {
        assert_eq!(next("@daily", utc(2026, 2, 22, 10, 0)), utc(2026, 2, 23, 0, 0));
        assert_eq!(next("@hourly", utc(2026, 2, 22, 10, 0)), utc(2026, 2, 22, 11, 0));
        assert_eq!(next("@weekly", utc(2026, 2, 22, 10, 0)), utc(2026, 3, 1, 0, 0));
        assert_eq!(next("@monthly", utc(2026, 2, 22, 10, 0)), utc(2026, 3, 1, 0, 0));
        assert_eq!(next("@yearly", utc(2026, 2, 22, 10, 0)), utc(2027, 1, 1, 0, 0));
    }

    #[test]
    fn test_step_within_hour_range() {
        let expr = "*/30 6-8 * * *";
        assert_eq!(next(expr, utc(2026, 5, 5, 7, 15)), utc(2026, 5, 5, 7, 30));
        assert_eq!(next(expr, utc(2026, 5, 5, 8, 30)), utc(2026, 5, 6, 6, 0));
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in [
            "bad",
            "* * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "*/0 * * * *",
            "5-1 * * * *",
            "1,,2 * * * *",
            "* * * foo *",
        ] {
            assert!(CronExpr::parse(bad).is_err(), "expected '{bad}' to be rejected");
        }
    }

    #[test]
    fn test_impossible_date_has_no_next() {
        let expr = CronExpr::parse(" 0 0 31 2 * ").unwrap();
        assert!(expr.next_after(utc(2026, 1, 1, 0, 0)).is_none());
        assert_eq!(expr.source(), "0 0 31 2 *");
    }
}
