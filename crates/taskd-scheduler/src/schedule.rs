//! Next-run calculation for each schedule kind.

use chrono::{DateTime, Duration, Utc};
use taskd_core::TaskdError;

use crate::cron::CronExpr;
use crate::tasks::Schedule;

/// Next occurrence after a run that started or was evaluated at `last_run`.
///
/// Always strictly later than `now` for repeating schedules, so a task that
/// missed several occurrences while the scheduler was down runs once and
/// then lines up with the next future slot. `Once` has no next occurrence.
/// A repeating schedule whose next slot cannot be computed (bad or
/// never-matching cron, interval past the representable range) falls back to
/// a daily cadence, so it is never mistaken for a finished one-off.
pub fn next_run(schedule: &Schedule, last_run: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = match schedule {
        Schedule::Once => return None,
        Schedule::Recurring { interval_secs } => {
            checked_add_secs(last_run.max(now), (*interval_secs).max(1)).ok_or_else(|| {
                TaskdError::InvalidSchedule(format!("interval of {interval_secs}s is out of range"))
            })
        }
        Schedule::Cron { expression } => CronExpr::parse(expression).and_then(|cron| {
            cron.next_after(last_run)
                .filter(|candidate| *candidate > now)
                .or_else(|| cron.next_after(now))
                .ok_or_else(|| {
                    TaskdError::InvalidSchedule(format!("cron '{}' never fires", cron.source()))
                })
        }),
    };
    match next {
        Ok(at) => Some(at),
        Err(e) => {
            tracing::warn!("⚠️ {e}, falling back to a daily cadence");
            Some(daily_fallback(last_run, now))
        }
    }
}

/// `t + secs`, or `None` when the result is not a representable time.
pub fn checked_add_secs(t: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    t.checked_add_signed(Duration::try_seconds(secs)?)
}

/// `last_run + 1 day`, pushed forward in whole days until it is in the future.
fn daily_fallback(last_run: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let day = Duration::days(1);
    let mut next = last_run + day;
    if next <= now {
        let behind = (now - next).num_days() + 1;
        next += day * behind as i32;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, d, h, m, 0).unwrap()
    }

    fn cron(expr: &str) -> Schedule {
        Schedule::Cron { expression: expr.into() }
    }

    #[test]
    fn test_once_has_no_next_run() {
        assert_eq!(next_run(&Schedule::Once, t(1, 0, 0), t(1, 0, 0)), None);
    }

    #[test]
    fn test_recurring_adds_interval() {
        let every_30m = Schedule::Recurring { interval_secs: 1800 };
        assert_eq!(next_run(&every_30m, t(1, 10, 0), t(1, 10, 0)), Some(t(1, 10, 30)));
    }

    #[test]
    fn test_recurring_skips_missed_occurrences() {
        let hourly = Schedule::Recurring { interval_secs: 3600 };
        // Last run was a day ago; the next run is anchored on now, not on the backlog.
        assert_eq!(next_run(&hourly, t(1, 8, 0), t(2, 8, 15)), Some(t(2, 9, 15)));
    }

    #[test]
    fn test_cron_same_day() {
        assert_eq!(next_run(&cron("0 6 * * *"), t(3, 5, 0), t(3, 5, 0)), Some(t(3, 6, 0)));
    }

    #[test]
    fn test_cron_next_day_after_run() {
        assert_eq!(next_run(&cron("0 6 * * *"), t(3, 6, 0), t(3, 6, 0)), Some(t(4, 6, 0)));
    }

    #[test]
    fn test_cron_catch_up_skips_to_future() {
        // Down for three days: one run now, the next slot is tomorrow.
        let next = next_run(&cron("0 6 * * *"), t(1, 6, 0), t(4, 12, 0));
        assert_eq!(next, Some(t(5, 6, 0)));
    }

    #[test]
    fn test_invalid_cron_falls_back_to_daily() {
        let broken = cron("every tuesday");
        assert_eq!(next_run(&broken, t(3, 6, 0), t(3, 6, 0)), Some(t(4, 6, 0)));
        assert_eq!(next_run(&broken, t(1, 6, 0), t(4, 12, 0)), Some(t(5, 6, 0)));
        assert_eq!(next_run(&broken, t(1, 6, 0), t(3, 6, 0)), Some(t(4, 6, 0)));
    }

    #[test]
    fn test_cron_that_never_fires_falls_back_to_daily() {
        // Feb 30 parses but has no matching date; it must not look finished.
        let feb30 = cron("0 0 30 2 *");
        assert_eq!(next_run(&feb30, t(3, 6, 0), t(3, 6, 0)), Some(t(4, 6, 0)));
    }

    #[test]
    fn test_recurring_overflow_falls_back_to_daily() {
        let absurd = Schedule::Recurring { interval_secs: 10_000_000_000_000 };
        assert_eq!(next_run(&absurd, t(3, 6, 0), t(3, 6, 0)), Some(t(4, 6, 0)));
        let max = Schedule::Recurring { interval_secs: u64::MAX };
        assert_eq!(next_run(&max, t(3, 6, 0), t(3, 6, 0)), Some(t(4, 6, 0)));
    }

    #[test]
    fn test_checked_add_secs() {
        assert_eq!(checked_add_secs(t(1, 0, 0), 90), Some(t(1, 0, 1) + Duration::seconds(30)));
        assert_eq!(checked_add_secs(t(1, 0, 0), 10_000_000_000_000), None);
        assert_eq!(checked_add_secs(t(1, 0, 0), u64::MAX), None);
    }

    #[test]
    fn test_always_after_now() {
        let now = t(10, 14, 37);
        for schedule in [
            Schedule::Recurring { interval_secs: 60 },
            cron("*/5 * * * *"),
            cron("0 0 1 * *"),
            cron("nonsense"),
            cron("0 0 31 4 *"),
        ] {
            let next = next_run(&schedule, t(1, 0, 0), now).unwrap();
            assert!(next > now, "{schedule} produced {next}");
        }
    }
}
