//! Scheduler types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::RecurrenceError;

/// Maximum number of entries kept in [`Schedule::execution_history`].
pub const MAX_EXECUTION_HISTORY: usize = 50;

/// How often a schedule recurs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    /// Run a single time, then complete.
    Once,
    /// Every day at the time of day.
    #[default]
    Daily,
    /// On the listed weekdays.
    Weekly,
    /// On the listed days of the month.
    Monthly,
    /// On the listed days of the listed months.
    Yearly,
}

impl Frequency {
    /// Upper-case name as stored and shown in validation messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "ONCE",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Yearly => "YEARLY",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ONCE" => Ok(Self::Once),
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            "YEARLY" => Ok(Self::Yearly),
            _ => Err(format!("unknown frequency `{s}`")),
        }
    }
}

/// Run-state of a schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    /// Has a future occurrence.
    #[default]
    Active,
    /// No further occurrence; terminal.
    Completed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            _ => Err(format!("unknown status `{s}`")),
        }
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// Unit of [`Schedule::interval`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    #[default]
    Minutes,
    Hours,
}

impl IntervalUnit {
    /// Length of `value` units in minutes.
    pub fn to_minutes(&self, value: u32) -> u32 {
        match self {
            Self::Minutes => value,
            Self::Hours => value.saturating_mul(60),
        }
    }
}

/// A wall-clock time of day with minute precision, written `HH:MM`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl TimeOfDay {
    /// Midnight.
    pub const MIDNIGHT: Self = Self { hour: 0, minute: 0 };

    /// Last minute of the day.
    pub const END_OF_DAY: Self = Self {
        hour: 23,
        minute: 59,
    };

    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    /// Shift forward by `minutes`, wrapping across midnight.
    pub fn plus_minutes(&self, minutes: u32) -> Self {
        let total = (self.hour * 60 + self.minute + minutes % (24 * 60)) % (24 * 60);
        Self {
            hour: total / 60,
            minute: total % 60,
        }
    }

    pub fn to_naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for TimeOfDay {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RecurrenceError::InvalidTimeOfDay(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        if hour.is_empty() || minute.len() != 2 || hour.len() > 2 {
            return Err(invalid());
        }
        let hour = hour.parse::<u32>().map_err(|_| invalid())?;
        let minute = minute.parse::<u32>().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The recurrence-shaping part of a schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecurrenceConfig {
    pub frequency: Frequency,
    pub week_days: Vec<u32>,
    pub month_days: Vec<u32>,
    pub months: Vec<u32>,
}

/// One entry of the bounded execution history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A persisted recurring (or one-shot) task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    /// Owning tenant; `None` for platform-level schedules.
    pub tenant_id: Option<String>,
    pub title: String,
    pub description: Option<String>,

    pub frequency: Frequency,
    pub week_days: Vec<u32>,
    pub month_days: Vec<u32>,
    pub months: Vec<u32>,
    pub time_of_day: TimeOfDay,
    pub timezone: String,
    pub start_date: DateTime<Utc>,
    /// Inclusive; normalized to the last millisecond of the local day.
    pub end_date: Option<DateTime<Utc>>,

    pub cron_expression: String,
    pub next_run_date: DateTime<Utc>,
    pub status: ScheduleStatus,

    pub execution_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_execution_status: Option<ExecutionStatus>,
    pub last_error_message: Option<String>,
    /// Newest first, at most [`MAX_EXECUTION_HISTORY`] entries.
    pub execution_history: Vec<ExecutionRecord>,

    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub retry_delay_minutes: u32,
    pub current_retries: u32,

    pub entity_id: Option<String>,
    pub action: Option<String>,
    pub data: Value,
    pub interval: Option<u32>,
    pub interval_unit: Option<IntervalUnit>,
    pub end_time: Option<TimeOfDay>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn recurrence(&self) -> RecurrenceConfig {
        RecurrenceConfig {
            frequency: self.frequency,
            week_days: self.week_days.clone(),
            month_days: self.month_days.clone(),
            months: self.months.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ScheduleStatus::Active
    }

    /// `data.recipientId`, when the payload carries one.
    pub fn recipient_id(&self) -> Option<&Value> {
        recipient_id(&self.data)
    }

    /// Intraday repeat period in minutes, if any.
    pub fn interval_minutes(&self) -> Option<u32> {
        self.interval
            .filter(|v| *v > 0)
            .map(|v| self.interval_unit.unwrap_or_default().to_minutes(v))
    }

    /// Record an execution outcome.
    ///
    /// The history is kept newest first and truncated to
    /// [`MAX_EXECUTION_HISTORY`] entries.
    pub fn record_execution(
        &mut self,
        at: DateTime<Utc>,
        success: bool,
        error_message: Option<String>,
    ) {
        self.execution_count += 1;
        self.last_run_at = Some(at);

        let status = if success {
            self.success_count += 1;
            self.current_retries = 0;
            self.last_error_message = None;
            ExecutionStatus::Success
        } else {
            self.failure_count += 1;
            self.current_retries += 1;
            self.last_error_message = error_message.clone();
            ExecutionStatus::Failed
        };
        self.last_execution_status = Some(status);

        self.execution_history.insert(
            0,
            ExecutionRecord {
                executed_at: at,
                status,
                error_message: if success { None } else { error_message },
            },
        );
        self.execution_history.truncate(MAX_EXECUTION_HISTORY);
    }
}

pub(crate) fn recipient_id(data: &Value) -> Option<&Value> {
    data.get("recipientId").filter(|v| !v.is_null())
}

/// Input for creating a schedule.
///
/// Dates are accepted as RFC 3339 instants or bare `YYYY-MM-DD` dates, which
/// are read in the schedule's timezone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewSchedule {
    pub title: String,
    pub description: Option<String>,
    pub frequency: Frequency,
    pub week_days: Vec<u32>,
    pub month_days: Vec<u32>,
    pub months: Vec<u32>,
    pub time_of_day: Option<String>,
    pub timezone: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Explicit first run, overriding the computed one.
    pub next_run_date: Option<String>,
    pub retry_on_failure: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay_minutes: Option<u32>,
    pub entity_id: Option<String>,
    pub action: Option<String>,
    pub data: Option<Value>,
    pub interval: Option<u32>,
    pub interval_unit: Option<IntervalUnit>,
    pub end_time: Option<String>,
}

/// Partial update of a schedule. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub frequency: Option<Frequency>,
    pub week_days: Option<Vec<u32>>,
    pub month_days: Option<Vec<u32>>,
    pub months: Option<Vec<u32>>,
    pub time_of_day: Option<String>,
    pub timezone: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub retry_on_failure: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay_minutes: Option<u32>,
    pub entity_id: Option<String>,
    pub action: Option<String>,
    pub data: Option<Value>,
    pub interval: Option<u32>,
    pub interval_unit: Option<IntervalUnit>,
    pub end_time: Option<String>,
}

impl SchedulePatch {
    /// Whether applying this patch requires recomputing cron and next run.
    pub fn touches_recurrence(&self) -> bool {
        self.start_date.is_some()
            || self.end_date.is_some()
            || self.frequency.is_some()
            || self.time_of_day.is_some()
            || self.timezone.is_some()
            || self.week_days.is_some()
            || self.month_days.is_some()
            || self.months.is_some()
    }
}

/// Shallow-merge two JSON payloads; keys in `patch` win.
///
/// Non-object values replace the base entirely.
pub(crate) fn merge_data(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, patch) => patch.clone(),
    }
}
