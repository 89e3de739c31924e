//! Execution queue contract.
//!
//! The queue is tenant-agnostic: it carries a job name, a JSON payload and
//! delivery options. Tenant routing happens in the dispatcher from the
//! payload's `tenantId`.

mod memory;

pub use memory::MemoryQueue;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::QueueError;

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Ready to be reserved.
    Waiting,
    /// Reserved by a consumer.
    Active,
    Completed,
    /// Attempts exhausted.
    Failed,
    /// Waiting for its delay or backoff to elapse.
    Delayed,
}

impl JobState {
    /// Every state, in the order cleanup drains them.
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Delayed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intraday repetition of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatOptions {
    /// Period between runs.
    pub every: Duration,
    /// Offset from enqueue time after which no further run is scheduled.
    pub until: Duration,
}

/// Delivery options for [`JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Explicit job id. A job with the same id already present in any state
    /// is returned instead of enqueuing a new one.
    pub job_id: Option<String>,
    pub delay: Duration,
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Fixed wait between a failed attempt and the next one.
    pub backoff: Duration,
    /// How many finally-failed jobs to keep; `0` removes on failure.
    pub remove_on_fail: usize,
    pub repeat: Option<RepeatOptions>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            delay: Duration::ZERO,
            attempts: 1,
            backoff: Duration::ZERO,
            remove_on_fail: 0,
            repeat: None,
        }
    }
}

/// A snapshot of a queued job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub state: JobState,
    /// Failed attempts so far.
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    pub options: JobOptions,
}

/// An execution queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Returns the stored job, which is the pre-existing one when
    /// `options.job_id` is already taken.
    async fn enqueue(
        &self,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<Job, QueueError>;

    /// Jobs currently in any of `states`.
    async fn list_jobs(&self, states: &[JobState]) -> Result<Vec<Job>, QueueError>;

    /// Remove a job regardless of state.
    async fn remove(&self, job_id: &str) -> Result<(), QueueError>;

    /// Remove jobs in `state` that have been there for at least `grace`.
    /// Returns the number removed.
    async fn clean(&self, grace: Duration, state: JobState) -> Result<usize, QueueError>;

    /// Wait for the next ready job and mark it active.
    async fn reserve(&self) -> Result<Job, QueueError>;

    /// Mark an active job completed.
    async fn complete(&self, job_id: &str) -> Result<(), QueueError>;

    /// Record a failed attempt. Returns the resulting state: `Delayed` when a
    /// retry is scheduled, `Failed` when attempts are exhausted.
    async fn fail(&self, job_id: &str, reason: &str) -> Result<JobState, QueueError>;
}
