//! Error types for the scheduler.

use thiserror::Error;

/// Errors raised by the recurrence calculator.
///
/// Every expression this crate evaluates was synthesized by the crate itself,
/// so these are contract violations rather than user mistakes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    /// Synthesized expression does not have exactly five fields.
    #[error("cron expression `{expression}` has {fields} fields, expected 5")]
    FieldCount { expression: String, fields: usize },

    /// Expression could not be parsed.
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Timezone is not a known IANA zone.
    #[error("invalid timezone `{0}`; expected IANA timezone id")]
    InvalidTimezone(String),

    /// Time of day is not `HH:MM` within range.
    #[error("invalid time of day `{0}`; expected HH:MM")]
    InvalidTimeOfDay(String),

    /// No matching instant within the search horizon.
    #[error("no occurrence of `{expression}` in timezone `{timezone}` within search horizon")]
    NoOccurrence { expression: String, timezone: String },
}

/// Errors from schedule storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON column could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored row could not be mapped back into a schedule.
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// Filesystem error while opening a tenant database.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A connection mutex was poisoned by a panicking writer.
    #[error("connection lock poisoned")]
    Poisoned,

    /// A blocking database task panicked or was cancelled.
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors surfaced by the schedule lifecycle service.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Caller supplied an invalid or incomplete recurrence definition.
    #[error("{message}")]
    Validation { field: &'static str, message: String },

    /// No schedule with this id.
    #[error("schedule not found: {0}")]
    NotFound(String),

    /// Recurrence computation failed.
    #[error("recurrence error: {0}")]
    Recurrence(#[from] RecurrenceError),

    /// Storage failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl ScheduleError {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Whether this error should be reported back to the caller as-is.
    ///
    /// Validation and not-found errors are caused by the request; everything
    /// else is an operator concern.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::NotFound(_))
    }
}

/// Errors from the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue operation did not finish in time.
    #[error("queue operation `{operation}` timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    /// No job with this id.
    #[error("job not found: {0}")]
    NotFound(String),

    /// Queue has been closed.
    #[error("queue closed")]
    Closed,
}

/// Errors from arming a single schedule.
#[derive(Debug, Error)]
pub enum ArmError {
    /// Queue rejected the job.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Arming time could not be resolved.
    #[error("recurrence error: {0}")]
    Recurrence(#[from] RecurrenceError),
}

/// Errors from dispatching a queued job.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Job payload is not a JSON object.
    #[error("malformed job payload: {0}")]
    MalformedPayload(String),

    /// Tenant database could not be opened.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Action handler failed; the queue decides whether to retry.
    #[error("action `{action}` failed: {message}")]
    Handler { action: String, message: String },
}
