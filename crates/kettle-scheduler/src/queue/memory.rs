//! In-process job queue.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Job, JobOptions, JobQueue, JobState};
use crate::QueueError;

/// Position of a job in its repeat series.
#[derive(Debug, Clone)]
struct RepeatSeries {
    base_id: String,
    origin: Instant,
    index: u32,
}

#[derive(Debug)]
struct Entry {
    job: Job,
    ready_at: Instant,
    /// When the job entered its current state.
    since: Instant,
    seq: u64,
    series: Option<RepeatSeries>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<String, Entry>,
    seq: u64,
    closed: bool,
}

impl Inner {
    fn insert(&mut self, job: Job, ready_at: Instant, now: Instant, series: Option<RepeatSeries>) {
        self.seq += 1;
        let seq = self.seq;
        self.jobs.insert(
            job.id.clone(),
            Entry {
                job,
                ready_at,
                since: now,
                seq,
                series,
            },
        );
    }

    /// Move delayed jobs whose time has come to waiting.
    fn promote(&mut self, now: Instant) {
        for entry in self.jobs.values_mut() {
            if entry.job.state == JobState::Delayed && entry.ready_at <= now {
                entry.job.state = JobState::Waiting;
                entry.since = now;
            }
        }
    }

    fn next_waiting(&self) -> Option<String> {
        self.jobs
            .values()
            .filter(|e| e.job.state == JobState::Waiting)
            .min_by_key(|e| (e.ready_at, e.seq))
            .map(|e| e.job.id.clone())
    }

    fn next_delayed_at(&self) -> Option<Instant> {
        self.jobs
            .values()
            .filter(|e| e.job.state == JobState::Delayed)
            .map(|e| e.ready_at)
            .min()
    }

    fn activate(&mut self, id: &str, now: Instant) -> Option<Job> {
        let entry = self.jobs.get_mut(id)?;
        entry.job.state = JobState::Active;
        entry.since = now;
        let job = entry.job.clone();
        let series = entry.series.clone();

        // The next repetition is scheduled when the current one starts, so a
        // slow or failing run does not shift the cadence.
        if let (Some(series), Some(repeat)) = (series, job.options.repeat) {
            let index = series.index + 1;
            let ready_at = series.origin + job.options.delay + repeat.every * index;
            let next_id = format!("{}#{index}", series.base_id);
            if !repeat.every.is_zero()
                && ready_at <= series.origin + repeat.until
                && !self.jobs.contains_key(&next_id)
            {
                let next = Job {
                    id: next_id,
                    name: job.name.clone(),
                    payload: job.payload.clone(),
                    state: JobState::Delayed,
                    attempts_made: 0,
                    failed_reason: None,
                    options: job.options.clone(),
                };
                self.insert(next, ready_at, now, Some(RepeatSeries { index, ..series }));
            }
        }

        Some(job)
    }

    /// Keep at most `keep` finally-failed jobs, dropping the oldest.
    fn trim_failed(&mut self, keep: usize) {
        let mut failed: Vec<(Instant, u64, String)> = self
            .jobs
            .values()
            .filter(|e| e.job.state == JobState::Failed)
            .map(|e| (e.since, e.seq, e.job.id.clone()))
            .collect();
        if failed.len() <= keep {
            return;
        }
        failed.sort();
        let excess = failed.len() - keep;
        for (_, _, id) in failed.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}

/// A queue held in process memory.
///
/// Supports delays, a fixed retry backoff, bounded failed-job retention and
/// intraday repetition. Timing uses [`tokio::time`], so it follows paused
/// test clocks.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop handing out jobs. Pending `reserve` calls return
    /// [`QueueError::Closed`].
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Number of jobs in any state.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(QueueError::Closed);
        }

        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(existing) = inner.jobs.get(&id) {
            debug!(job_id = %id, state = %existing.job.state, "job id already queued");
            return Ok(existing.job.clone());
        }

        let now = Instant::now();
        let series = options.repeat.map(|_| RepeatSeries {
            base_id: id.clone(),
            origin: now,
            index: 0,
        });
        let job = Job {
            id,
            name: name.to_string(),
            payload,
            state: if options.delay.is_zero() {
                JobState::Waiting
            } else {
                JobState::Delayed
            },
            attempts_made: 0,
            failed_reason: None,
            options,
        };
        let ready_at = now + job.options.delay;
        inner.insert(job.clone(), ready_at, now, series);
        drop(inner);

        self.notify.notify_one();
        Ok(job)
    }

    async fn list_jobs(&self, states: &[JobState]) -> Result<Vec<Job>, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.promote(Instant::now());

        let mut entries: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|e| states.contains(&e.job.state))
            .collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries.into_iter().map(|e| e.job.clone()).collect())
    }

    async fn remove(&self, job_id: &str) -> Result<(), QueueError> {
        self.inner
            .lock()
            .await
            .jobs
            .remove(job_id)
            .map(|_| ())
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))
    }

    async fn clean(&self, grace: Duration, state: JobState) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.promote(now);

        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, e| !(e.job.state == state && now.duration_since(e.since) >= grace));
        Ok(before - inner.jobs.len())
    }

    async fn reserve(&self) -> Result<Job, QueueError> {
        loop {
            let notified = self.notify.notified();

            let next_ready = {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(QueueError::Closed);
                }

                let now = Instant::now();
                inner.promote(now);
                if let Some(job) = inner
                    .next_waiting()
                    .and_then(|id| inner.activate(&id, now))
                {
                    let more = inner.next_waiting().is_some();
                    drop(inner);
                    if more {
                        self.notify.notify_one();
                    }
                    return Ok(job);
                }
                inner.next_delayed_at()
            };

            match next_ready {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        entry.job.state = JobState::Completed;
        entry.since = Instant::now();
        Ok(())
    }

    async fn fail(&self, job_id: &str, reason: &str) -> Result<JobState, QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let entry = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        entry.job.attempts_made += 1;
        entry.job.failed_reason = Some(reason.to_string());
        entry.since = now;

        if entry.job.attempts_made < entry.job.options.attempts {
            entry.job.state = JobState::Delayed;
            entry.ready_at = now + entry.job.options.backoff;
            debug!(
                job_id,
                attempts_made = entry.job.attempts_made,
                "job failed, retry scheduled"
            );
            drop(inner);
            self.notify.notify_one();
            return Ok(JobState::Delayed);
        }

        entry.job.state = JobState::Failed;
        warn!(
            job_id,
            attempts_made = entry.job.attempts_made,
            reason,
            "job failed after final attempt"
        );
        let keep = entry.job.options.remove_on_fail;
        if keep == 0 {
            inner.jobs.remove(job_id);
        } else {
            inner.trim_failed(keep);
        }
        Ok(JobState::Failed)
    }
}
