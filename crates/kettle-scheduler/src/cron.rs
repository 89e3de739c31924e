//! Five-field cron expressions.
//!
//! Fields are `minute hour day-of-month month day-of-week`. This dialect uses a
//! zero-indexed month field (`0` is January, `11` is December) and numbers
//! weekdays from Sunday (`0`, with `7` accepted as an alias). Each field
//! accepts `*`, single values, ranges (`1-5`), lists (`1,3,5`) and steps
//! (`*/15`, `0-30/10`).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::RecurrenceError;

/// How many local calendar days to scan before giving up.
///
/// Five years covers every leap-day expression.
const MAX_SEARCH_DAYS: u64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    wildcard: bool,
    values: BTreeSet<u32>,
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpression {
    /// Parse a five-field expression.
    pub fn parse(raw: &str) -> Result<Self, RecurrenceError> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(RecurrenceError::FieldCount {
                expression: raw.to_string(),
                fields: fields.len(),
            });
        }

        let field = |index: usize, name: &str, min: u32, max: u32| {
            parse_field(fields[index], min, max, index == 4).map_err(|reason| {
                RecurrenceError::InvalidCron {
                    expression: raw.to_string(),
                    reason: format!("{name}: {reason}"),
                }
            })
        };

        Ok(Self {
            source: fields.join(" "),
            minute: field(0, "minute", 0, 59)?,
            hour: field(1, "hour", 0, 23)?,
            day_of_month: field(2, "day of month", 1, 31)?,
            month: field(3, "month", 0, 11)?,
            day_of_week: field(4, "day of week", 0, 7)?,
        })
    }

    /// The normalized source text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.month.matches(date.month0()) {
            return false;
        }

        let dom = self.day_of_month.matches(date.day());
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday());

        // Classic cron: when both day fields are restricted either may match.
        if self.day_of_month.wildcard || self.day_of_week.wildcard {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Whether `instant`, viewed in `tz`, matches this expression to the minute.
    pub fn matches(&self, instant: DateTime<Utc>, tz: &Tz) -> bool {
        use chrono::Timelike;

        let local = instant.with_timezone(tz);
        self.minute.matches(local.minute())
            && self.hour.matches(local.hour())
            && self.matches_date(local.date_naive())
    }

    /// Find the first matching instant after `floor`.
    ///
    /// With `inclusive` set, an occurrence exactly at `floor` is returned;
    /// otherwise the result is strictly later. Local times that do not exist
    /// because of a DST gap are skipped, and ambiguous local times resolve to
    /// the earlier instant.
    pub fn next_from(
        &self,
        floor: DateTime<Utc>,
        tz: &Tz,
        inclusive: bool,
    ) -> Option<DateTime<Utc>> {
        let start = floor.with_timezone(tz).date_naive();

        for offset in 0..MAX_SEARCH_DAYS {
            let date = start.checked_add_days(Days::new(offset))?;
            if !self.matches_date(date) {
                continue;
            }

            for &hour in &self.hour.values {
                for &minute in &self.minute.values {
                    let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                        continue;
                    };
                    let Some(local) = tz.from_local_datetime(&naive).earliest() else {
                        continue;
                    };
                    let candidate = local.with_timezone(&Utc);
                    if candidate > floor || (inclusive && candidate == floor) {
                        return Some(candidate);
                    }
                }
            }
        }

        None
    }
}

impl FromStr for CronExpression {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(raw: &str) -> Result<Tz, RecurrenceError> {
    raw.parse::<Tz>()
        .map_err(|_| RecurrenceError::InvalidTimezone(raw.to_string()))
}

fn parse_field(raw: &str, min: u32, max: u32, weekday: bool) -> Result<CronField, String> {
    let mut values = BTreeSet::new();
    for segment in raw.split(',') {
        parse_segment(segment, min, max, &mut values)?;
    }

    if weekday && values.remove(&7) {
        values.insert(0);
    }

    if values.is_empty() {
        return Err(format!("`{raw}` selects no values"));
    }

    Ok(CronField {
        wildcard: raw == "*",
        values,
    })
}

fn parse_segment(raw: &str, min: u32, max: u32, values: &mut BTreeSet<u32>) -> Result<(), String> {
    let (range, step) = match raw.split_once('/') {
        Some((range, step)) => {
            let step = step
                .parse::<u32>()
                .map_err(|_| format!("invalid step `{step}`"))?;
            if step == 0 {
                return Err("step must be >= 1".to_string());
            }
            (range, step)
        }
        None => (raw, 1),
    };

    let (start, end) = if range == "*" {
        (min, max)
    } else if let Some((start, end)) = range.split_once('-') {
        (parse_atom(start, min, max)?, parse_atom(end, min, max)?)
    } else {
        let value = parse_atom(range, min, max)?;
        (value, value)
    };

    if start > end {
        return Err(format!("invalid range `{raw}`"));
    }

    values.extend((start..=end).step_by(step as usize));
    Ok(())
}

fn parse_atom(raw: &str, min: u32, max: u32) -> Result<u32, String> {
    let value = raw
        .parse::<u32>()
        .map_err(|_| format!("invalid value `{raw}`"))?;
    if value < min || value > max {
        return Err(format!("value `{raw}` is out of bounds ({min}..={max})"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_wildcard() {
        let expr = CronExpression::parse("* * * * *").unwrap();
        assert!(expr.matches(Utc::now(), &Tz::UTC));
    }

    #[test]
    fn test_parse_normalizes_whitespace() {
        let expr = CronExpression::parse("0  9 *   * *").unwrap();
        assert_eq!(expr.as_str(), "0 9 * * *");
        assert_eq!(expr.to_string(), "0 9 * * *");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            CronExpression::parse("* * *"),
            Err(RecurrenceError::FieldCount { fields: 3, .. })
        ));
        assert!(CronExpression::parse("60 * * * *").is_err());
        assert!(CronExpression::parse("0 24 * * *").is_err());
        assert!(CronExpression::parse("0 0 0 * *").is_err());
        assert!(CronExpression::parse("0 0 1 12 *").is_err());
        assert!(CronExpression::parse("0 0 * * 8").is_err());
        assert!(CronExpression::parse("*/0 * * * *").is_err());
        assert!(CronExpression::parse("5-1 * * * *").is_err());
        assert!(CronExpression::parse("a * * * *").is_err());
    }

    #[test]
    fn test_parse_steps_and_ranges() {
        let expr = CronExpression::parse("*/15 9-17 * * 1-5").unwrap();
        assert!(expr.matches(utc("2025-01-06T09:45:00Z"), &Tz::UTC)); // Monday
        assert!(!expr.matches(utc("2025-01-06T09:50:00Z"), &Tz::UTC));
        assert!(!expr.matches(utc("2025-01-05T09:45:00Z"), &Tz::UTC)); // Sunday
    }

    #[test]
    fn test_weekday_seven_is_sunday() {
        let expr = CronExpression::parse("0 0 * * 7").unwrap();
        assert!(expr.matches(utc("2025-01-05T00:00:00Z"), &Tz::UTC));
    }

    #[test]
    fn test_month_field_is_zero_indexed() {
        let expr = CronExpression::parse("0 0 15 5 *").unwrap();
        assert!(expr.matches(utc("2025-06-15T00:00:00Z"), &Tz::UTC));
        assert!(!expr.matches(utc("2025-05-15T00:00:00Z"), &Tz::UTC));
    }

    #[test]
    fn test_next_from_exclusive_and_inclusive() {
        let expr = CronExpression::parse("0 9 * * *").unwrap();
        let at_nine = utc("2025-01-01T09:00:00Z");

        assert_eq!(
            expr.next_from(at_nine, &Tz::UTC, true),
            Some(at_nine)
        );
        assert_eq!(
            expr.next_from(at_nine, &Tz::UTC, false),
            Some(utc("2025-01-02T09:00:00Z"))
        );
    }

    #[test]
    fn test_next_from_respects_timezone() {
        let expr = CronExpression::parse("0 9 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let next = expr
            .next_from(utc("2025-01-01T00:00:00Z"), &tz, false)
            .unwrap();
        // 09:00 EST is 14:00 UTC.
        assert_eq!(next, utc("2025-01-01T14:00:00Z"));
    }

    #[test]
    fn test_next_from_skips_dst_gap() {
        // 02:30 does not exist in New York on 2025-03-09.
        let expr = CronExpression::parse("30 2 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let next = expr
            .next_from(utc("2025-03-09T00:00:00Z"), &tz, false)
            .unwrap();
        assert_eq!(next, utc("2025-03-10T06:30:00Z"));
    }

    #[test]
    fn test_next_from_leap_day() {
        let expr = CronExpression::parse("0 0 29 1 *").unwrap();
        let next = expr
            .next_from(utc("2025-03-01T00:00:00Z"), &Tz::UTC, false)
            .unwrap();
        assert_eq!(next, utc("2028-02-29T00:00:00Z"));
    }

    #[test]
    fn test_next_from_impossible_date() {
        // February 31st never happens.
        let expr = CronExpression::parse("0 0 31 1 *").unwrap();
        assert!(expr.next_from(Utc::now(), &Tz::UTC, false).is_none());
    }

    #[test]
    fn test_both_day_fields_restricted_use_or() {
        let expr = CronExpression::parse("0 0 1 * 1").unwrap();
        // 2025-01-06 is a Monday but not the 1st.
        assert!(expr.matches(utc("2025-01-06T00:00:00Z"), &Tz::UTC));
        // 2025-02-01 is a Saturday and the 1st.
        assert!(expr.matches(utc("2025-02-01T00:00:00Z"), &Tz::UTC));
        assert!(!expr.matches(utc("2025-01-07T00:00:00Z"), &Tz::UTC));
    }

    #[test]
    fn test_parse_timezone() {
        assert!(parse_timezone("Europe/Berlin").is_ok());
        assert_eq!(
            parse_timezone("Mars/Olympus"),
            Err(RecurrenceError::InvalidTimezone("Mars/Olympus".to_string()))
        );
    }
}
