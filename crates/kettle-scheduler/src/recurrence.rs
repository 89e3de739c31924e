//! Recurrence calculator.
//!
//! Pure functions that turn a recurrence definition into a cron expression and
//! a cron expression into concrete instants. Nothing here touches storage or
//! reads the clock; callers pass `now` explicitly.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::cron::{CronExpression, parse_timezone};
use crate::{Frequency, RecurrenceConfig, RecurrenceError};

/// Result of [`next_occurrence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextOccurrence {
    /// The next matching instant.
    pub next_run_at: DateTime<Utc>,
    /// False when `next_run_at` lies beyond the end date.
    pub is_active: bool,
}

/// Build the cron expression for a recurrence definition.
///
/// `delay_minutes` shifts the time of day forward (wrapping at midnight). It is
/// only used for first-occurrence expressions; steady-state expressions pass 0.
///
/// The month field is emitted zero-indexed: stored month `6` (June) becomes
/// `5`, matching the dialect understood by [`CronExpression`].
pub fn synthesize_cron(
    config: &RecurrenceConfig,
    time_of_day: &str,
    delay_minutes: u32,
) -> Result<String, RecurrenceError> {
    let time: crate::TimeOfDay = time_of_day.parse()?;
    let time = if delay_minutes > 0 {
        time.plus_minutes(delay_minutes)
    } else {
        time
    };
    let (minute, hour) = (time.minute(), time.hour());

    let expression = match config.frequency {
        Frequency::Once | Frequency::Daily => format!("{minute} {hour} * * *"),
        Frequency::Weekly => {
            format!("{minute} {hour} * * {}", join_or(&config.week_days, "*"))
        }
        Frequency::Monthly => {
            format!("{minute} {hour} {} * *", join_or(&config.month_days, "1"))
        }
        Frequency::Yearly => {
            let months: Vec<u32> = config.months.iter().map(|m| m.saturating_sub(1)).collect();
            format!(
                "{minute} {hour} {} {} *",
                join_or(&config.month_days, "1"),
                join_or(&months, "0")
            )
        }
    };

    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(RecurrenceError::FieldCount { expression, fields });
    }

    Ok(expression)
}

fn join_or(values: &[u32], default: &str) -> String {
    if values.is_empty() {
        default.to_string()
    } else {
        values
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Compute the first run of a schedule.
///
/// The search floor is `max(start_date, now)`. When `start_date` is still in
/// the future an occurrence exactly at `start_date` counts; otherwise the
/// result is strictly after `now`. The end date is inclusive.
pub fn next_occurrence(
    cron_expression: &str,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<NextOccurrence, RecurrenceError> {
    let cron = CronExpression::parse(cron_expression)?;
    let tz = parse_timezone(timezone)?;

    let (floor, inclusive) = if start_date > now {
        (start_date, true)
    } else {
        (now, false)
    };

    let next_run_at = search(&cron, floor, &tz, inclusive, timezone)?;
    let is_active = end_date.is_none_or(|end| next_run_at <= end);

    Ok(NextOccurrence {
        next_run_at,
        is_active,
    })
}

/// Compute the run following `from`, strictly after it.
///
/// Used after an execution; the floor is the execution instant, not the start
/// date.
pub fn next_occurrence_after(
    cron_expression: &str,
    from: DateTime<Utc>,
    timezone: &str,
) -> Result<DateTime<Utc>, RecurrenceError> {
    let cron = CronExpression::parse(cron_expression)?;
    let tz = parse_timezone(timezone)?;
    search(&cron, from, &tz, false, timezone)
}

fn search(
    cron: &CronExpression,
    floor: DateTime<Utc>,
    tz: &Tz,
    inclusive: bool,
    timezone: &str,
) -> Result<DateTime<Utc>, RecurrenceError> {
    cron.next_from(floor, tz, inclusive)
        .ok_or_else(|| RecurrenceError::NoOccurrence {
            expression: cron.to_string(),
            timezone: timezone.to_string(),
        })
}

/// Resolve a local wall-clock time to an instant.
///
/// A time inside a DST gap moves forward to the first valid minute.
pub fn resolve_local(tz: &Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let mut naive = date.and_time(time);
    for _ in 0..180 {
        if let Some(local) = tz.from_local_datetime(&naive).earliest() {
            return local.with_timezone(&Utc);
        }
        naive += Duration::minutes(1);
    }
    // No zone has a gap longer than three hours; fall back to reading as UTC.
    naive.and_utc()
}

/// Midnight of `date` in `tz`.
pub fn start_of_day(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    resolve_local(tz, date, NaiveTime::MIN)
}

/// The last millisecond of `date` in `tz` (`23:59:59.999`).
pub fn end_of_day(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    let last = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
    resolve_local(tz, date, last)
}

/// Calendar date of `instant` in `tz`.
pub fn local_date(instant: DateTime<Utc>, tz: &Tz) -> NaiveDate {
    instant.with_timezone(tz).date_naive()
}

/// Parse a caller-supplied date.
///
/// Accepts RFC 3339 instants (`2025-01-01T09:00:00Z`) and bare dates
/// (`2025-01-01`, read as local midnight in `tz`).
pub fn parse_date_input(raw: &str, tz: &Tz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|date| start_of_day(tz, date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn config(frequency: Frequency, week_days: &[u32], month_days: &[u32], months: &[u32]) -> RecurrenceConfig {
        RecurrenceConfig {
            frequency,
            week_days: week_days.to_vec(),
            month_days: month_days.to_vec(),
            months: months.to_vec(),
        }
    }

    #[test]
    fn test_daily_cron() {
        let cron = synthesize_cron(&config(Frequency::Daily, &[], &[], &[]), "09:00", 0).unwrap();
        assert_eq!(cron, "0 9 * * *");
    }

    #[test]
    fn test_once_matches_daily_shape() {
        let cron = synthesize_cron(&config(Frequency::Once, &[], &[], &[]), "07:45", 0).unwrap();
        assert_eq!(cron, "45 7 * * *");
    }

    #[test]
    fn test_weekly_cron() {
        let cron = synthesize_cron(&config(Frequency::Weekly, &[1, 5], &[], &[]), "18:00", 0).unwrap();
        assert_eq!(cron, "0 18 * * 1,5");

        let cron = synthesize_cron(&config(Frequency::Weekly, &[], &[], &[]), "18:00", 0).unwrap();
        assert_eq!(cron, "0 18 * * *");
    }

    #[test]
    fn test_monthly_cron() {
        let cron = synthesize_cron(&config(Frequency::Monthly, &[], &[1, 15], &[]), "06:30", 0).unwrap();
        assert_eq!(cron, "30 6 1,15 * *");

        let cron = synthesize_cron(&config(Frequency::Monthly, &[], &[], &[]), "06:30", 0).unwrap();
        assert_eq!(cron, "30 6 1 * *");
    }

    #[test]
    fn test_yearly_cron_uses_zero_indexed_months() {
        let cron = synthesize_cron(&config(Frequency::Yearly, &[], &[15], &[6]), "00:00", 0).unwrap();
        assert_eq!(cron, "0 0 15 5 *");

        let cron = synthesize_cron(&config(Frequency::Yearly, &[], &[], &[]), "00:00", 0).unwrap();
        assert_eq!(cron, "0 0 1 0 *");
    }

    #[test]
    fn test_delay_wraps_midnight() {
        let cron = synthesize_cron(&config(Frequency::Daily, &[], &[], &[]), "23:50", 20).unwrap();
        assert_eq!(cron, "10 0 * * *");
    }

    #[test]
    fn test_rejects_bad_time_of_day() {
        let daily = config(Frequency::Daily, &[], &[], &[]);
        assert!(matches!(
            synthesize_cron(&daily, "24:00", 0),
            Err(RecurrenceError::InvalidTimeOfDay(_))
        ));
        assert!(synthesize_cron(&daily, "10:61", 0).is_err());
        assert!(synthesize_cron(&daily, "noon", 0).is_err());
    }

    #[test]
    fn test_daily_scenario_first_run() {
        let next = next_occurrence(
            "0 9 * * *",
            utc("2025-01-01T00:00:00Z"),
            None,
            "UTC",
            utc("2025-01-01T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(next.next_run_at, utc("2025-01-01T09:00:00Z"));
        assert!(next.is_active);
    }

    #[test]
    fn test_future_start_is_inclusive() {
        let next = next_occurrence(
            "0 9 * * *",
            utc("2025-03-01T09:00:00Z"),
            None,
            "UTC",
            utc("2025-01-01T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(next.next_run_at, utc("2025-03-01T09:00:00Z"));
    }

    #[test]
    fn test_end_date_boundary_is_inclusive() {
        let now = utc("2025-01-01T00:00:00Z");
        let at_end = next_occurrence("0 9 * * *", now, Some(utc("2025-01-01T09:00:00Z")), "UTC", now).unwrap();
        assert!(at_end.is_active);

        let before = next_occurrence(
            "0 9 * * *",
            now,
            Some(utc("2025-01-01T08:59:59.999Z")),
            "UTC",
            now,
        )
        .unwrap();
        assert!(!before.is_active);
        assert_eq!(before.next_run_at, utc("2025-01-01T09:00:00Z"));
    }

    #[test]
    fn test_next_occurrence_after_is_strict() {
        let next = next_occurrence_after("0 9 * * *", utc("2025-01-01T09:00:00Z"), "UTC").unwrap();
        assert_eq!(next, utc("2025-01-02T09:00:00Z"));
    }

    #[test]
    fn test_invalid_inputs_name_offending_string() {
        let err = next_occurrence("0 9 * *", Utc::now(), None, "UTC", Utc::now()).unwrap_err();
        assert!(err.to_string().contains("0 9 * *"));

        let err = next_occurrence_after("0 9 * * *", Utc::now(), "Nowhere/City").unwrap_err();
        assert_eq!(err, RecurrenceError::InvalidTimezone("Nowhere/City".to_string()));
    }

    #[test]
    fn test_end_of_day_in_zone() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        assert_eq!(end_of_day(&tz, date), utc("2025-01-10T22:59:59.999Z"));
        assert_eq!(end_of_day(&Tz::UTC, date), utc("2025-01-10T23:59:59.999Z"));
    }

    #[test]
    fn test_parse_date_input() {
        let tz: Tz = "America/New_York".parse().unwrap();
        assert_eq!(
            parse_date_input("2025-01-01", &tz),
            Some(utc("2025-01-01T05:00:00Z"))
        );
        assert_eq!(
            parse_date_input("2025-01-01T09:00:00Z", &tz),
            Some(utc("2025-01-01T09:00:00Z"))
        );
        assert_eq!(parse_date_input("yesterday", &tz), None);
    }

    fn frequency_strategy() -> impl Strategy<Value = Frequency> {
        prop_oneof![
            Just(Frequency::Once),
            Just(Frequency::Daily),
            Just(Frequency::Weekly),
            Just(Frequency::Monthly),
            Just(Frequency::Yearly),
        ]
    }

    proptest! {
        #[test]
        fn synthesized_cron_always_reparses(
            frequency in frequency_strategy(),
            week_days in prop::collection::btree_set(0u32..7, 0..7),
            month_days in prop::collection::btree_set(1u32..29, 0..5),
            months in prop::collection::btree_set(1u32..13, 0..12),
            hour in 0u32..24,
            minute in 0u32..60,
            delay in 0u32..3000,
        ) {
            let config = RecurrenceConfig {
                frequency,
                week_days: week_days.into_iter().collect(),
                month_days: month_days.into_iter().collect(),
                months: months.into_iter().collect(),
            };
            let time = format!("{hour:02}:{minute:02}");
            let cron = synthesize_cron(&config, &time, delay).unwrap();

            prop_assert_eq!(cron.split_whitespace().count(), 5);
            prop_assert!(CronExpression::parse(&cron).is_ok(), "failed to re-parse {}", cron);
        }

        #[test]
        fn next_run_is_after_now_or_at_future_start(
            hour in 0u32..24,
            minute in 0u32..60,
            now_offset_mins in 0i64..(60 * 24 * 400),
            start_offset_mins in -(60 * 24 * 30i64)..(60 * 24 * 30),
            zone in prop::sample::select(vec!["UTC", "America/New_York", "Asia/Kolkata", "Australia/Sydney"]),
        ) {
            let base = utc("2025-01-01T00:00:00Z");
            let now = base + Duration::minutes(now_offset_mins);
            let start = now + Duration::minutes(start_offset_mins);
            let cron = format!("{minute} {hour} * * *");

            let next = next_occurrence(&cron, start, None, zone, now).unwrap();
            if start > now {
                prop_assert!(next.next_run_at >= start);
                let tz: Tz = zone.parse().unwrap();
                let first = CronExpression::parse(&cron).unwrap().next_from(start, &tz, true).unwrap();
                prop_assert_eq!(next.next_run_at, first);
            } else {
                prop_assert!(next.next_run_at > now);
            }
        }
    }
}
