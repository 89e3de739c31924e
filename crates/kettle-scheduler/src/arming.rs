//! Arming schedules as queue jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cron::parse_timezone;
use crate::queue::{Job, JobOptions, JobQueue, RepeatOptions};
use crate::recurrence::{local_date, resolve_local};
use crate::service::WriteHook;
use crate::tenant::TenantContext;
use crate::{ArmError, Schedule, TimeOfDay};

/// Failed jobs kept for inspection when a schedule retries on failure.
pub const KEEP_FAILED_JOBS: usize = 50;

/// Turns a due schedule into a delayed queue job.
pub struct JobArmer {
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    zone: Tz,
}

impl JobArmer {
    /// `zone` is the operating timezone that defines "today".
    pub fn new(queue: Arc<dyn JobQueue>, clock: Arc<dyn Clock>, zone: Tz) -> Self {
        Self { queue, clock, zone }
    }

    /// Whether `schedule` is ACTIVE and its next run falls on today's date.
    pub fn is_due_today(&self, schedule: &Schedule) -> bool {
        schedule.is_active()
            && local_date(schedule.next_run_date, &self.zone)
                == local_date(self.clock.now(), &self.zone)
    }

    /// Enqueue today's run of `schedule`.
    ///
    /// Returns `None` for schedules without an action. The job id is derived
    /// from tenant, schedule and next run, so arming the same occurrence twice
    /// yields the job already queued.
    #[tracing::instrument(skip(self, ctx, schedule), fields(tenant_id = %ctx, schedule_id = %schedule.id))]
    pub async fn arm(
        &self,
        ctx: &TenantContext,
        schedule: &Schedule,
    ) -> Result<Option<Job>, ArmError> {
        let Some(action) = schedule.action.as_deref().filter(|a| !a.is_empty()) else {
            debug!("schedule has no action, not arming");
            return Ok(None);
        };

        let now = self.clock.now();
        let tz = parse_timezone(&schedule.timezone)?;
        let today = local_date(now, &tz);
        let run_at = resolve_local(&tz, today, schedule.time_of_day.to_naive_time());

        let delay = match (run_at - now).to_std() {
            Ok(delay) => delay,
            Err(_) => {
                debug!(run_at = %run_at, "time of day already passed, running now");
                Duration::ZERO
            }
        };

        let repeat = schedule.interval_minutes().map(|minutes| {
            let end_time = schedule.end_time.unwrap_or(TimeOfDay::END_OF_DAY);
            let mut until = resolve_local(&tz, today, end_time.to_naive_time());
            if until <= now {
                let tomorrow = today.succ_opt().unwrap_or(today);
                until = resolve_local(&tz, tomorrow, end_time.to_naive_time());
            }
            RepeatOptions {
                every: Duration::from_secs(u64::from(minutes) * 60),
                until: (until - now).to_std().unwrap_or(Duration::ZERO),
            }
        });

        let options = JobOptions {
            job_id: Some(job_id(ctx, schedule)),
            delay,
            attempts: if schedule.retry_on_failure {
                schedule.max_retries.max(1)
            } else {
                1
            },
            backoff: Duration::from_secs(u64::from(schedule.retry_delay_minutes) * 60),
            remove_on_fail: if schedule.retry_on_failure {
                KEEP_FAILED_JOBS
            } else {
                0
            },
            repeat,
        };

        let job = self
            .queue
            .enqueue(action, build_payload(ctx, schedule), options)
            .await?;
        info!(
            job_id = %job.id,
            action,
            delay_secs = job.options.delay.as_secs(),
            repeating = job.options.repeat.is_some(),
            "armed schedule"
        );
        Ok(Some(job))
    }
}

/// Deterministic id for the job running `schedule`'s current next run.
pub fn job_id(ctx: &TenantContext, schedule: &Schedule) -> String {
    format!(
        "{}:{}:{}",
        ctx.label(),
        schedule.id,
        rfc3339(schedule.next_run_date)
    )
}

/// Job payload: the schedule's data with routing keys layered on top.
pub fn build_payload(ctx: &TenantContext, schedule: &Schedule) -> Value {
    let mut payload = match &schedule.data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };

    payload.insert(
        "date".to_string(),
        Value::String(rfc3339(schedule.next_run_date)),
    );
    payload.insert(
        "action".to_string(),
        schedule.action.clone().map_or(Value::Null, Value::String),
    );
    payload.insert(
        "scheduleId".to_string(),
        Value::String(schedule.id.clone()),
    );
    payload.insert(
        "isRepeating".to_string(),
        Value::Bool(schedule.interval_minutes().is_some()),
    );
    payload.insert(
        "entityId".to_string(),
        schedule.entity_id.clone().map_or(Value::Null, Value::String),
    );
    payload.insert(
        "tenantId".to_string(),
        ctx.tenant_id()
            .map_or(Value::Null, |id| Value::String(id.to_string())),
    );
    Value::Object(payload)
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Arms freshly written schedules that are due today without waiting for the
/// next daily cycle.
pub struct ImmediateArmingHook {
    armer: Arc<JobArmer>,
}

impl ImmediateArmingHook {
    pub fn new(armer: Arc<JobArmer>) -> Self {
        Self { armer }
    }
}

impl WriteHook for ImmediateArmingHook {
    fn after_write(&self, ctx: &TenantContext, schedule: &Schedule) {
        if !self.armer.is_due_today(schedule) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(schedule_id = %schedule.id, "no async runtime, skipping immediate arming");
            return;
        };

        let armer = self.armer.clone();
        let ctx = ctx.clone();
        let schedule = schedule.clone();
        handle.spawn(async move {
            if let Err(e) = armer.arm(&ctx, &schedule).await {
                warn!(
                    tenant_id = %ctx,
                    schedule_id = %schedule.id,
                    error = %e,
                    "immediate arming failed"
                );
            }
        });
    }
}
