//! Schedule lifecycle service.
//!
//! The only writer of schedule records. Every successful insert or update is
//! followed by a call to the configured [`WriteHook`], which is how the
//! immediate arming path learns about new work.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::cron::parse_timezone;
use crate::recurrence::{
    NextOccurrence, end_of_day, local_date, next_occurrence, next_occurrence_after,
    parse_date_input, start_of_day, synthesize_cron,
};
use crate::store::ScheduleStore;
use crate::tenant::{TenantContext, TenantStores};
use crate::types::{merge_data, recipient_id};
use crate::{
    Frequency, NewSchedule, RecurrenceConfig, RecurrenceError, Schedule, ScheduleError,
    SchedulePatch, ScheduleStatus, StoreError, TimeOfDay,
};

/// Timezone used when neither the input nor the caller names one.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Default for [`Schedule::max_retries`].
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default for [`Schedule::retry_delay_minutes`].
pub const DEFAULT_RETRY_DELAY_MINUTES: u32 = 15;

/// Post-commit callback for schedule writes.
///
/// Called after the store accepted an insert or update. Implementations must
/// not block and must not fail the write.
pub trait WriteHook: Send + Sync {
    fn after_write(&self, ctx: &TenantContext, schedule: &Schedule);
}

/// Async locks keyed by record, serializing read-modify-write cycles.
///
/// Entries are dropped once the last holder releases them.
#[derive(Default)]
struct RecordLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RecordLocks {
    async fn lock(&self, key: String) -> RecordGuard<'_> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        RecordGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }
}

struct RecordGuard<'a> {
    locks: &'a RecordLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Factory for tenant-scoped [`ScheduleService`]s.
///
/// Services built from the same factory share record locks, so concurrent
/// writers to one schedule never lose each other's changes.
#[derive(Clone)]
pub struct ScheduleServices {
    stores: Arc<dyn TenantStores>,
    clock: Arc<dyn Clock>,
    zone: Tz,
    hook: Option<Arc<dyn WriteHook>>,
    locks: Arc<RecordLocks>,
}

impl ScheduleServices {
    /// `zone` is the operating timezone that defines "today".
    pub fn new(stores: Arc<dyn TenantStores>, clock: Arc<dyn Clock>, zone: Tz) -> Self {
        Self {
            stores,
            clock,
            zone,
            hook: None,
            locks: Arc::default(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn WriteHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Service bound to `ctx`'s database.
    pub async fn for_tenant(&self, ctx: &TenantContext) -> Result<ScheduleService, StoreError> {
        let store = self.stores.store_for(ctx).await?;
        Ok(ScheduleService {
            ctx: ctx.clone(),
            store,
            clock: self.clock.clone(),
            zone: self.zone,
            hook: self.hook.clone(),
            locks: self.locks.clone(),
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }
}

/// Lifecycle operations against one tenant's schedules.
#[derive(Clone)]
pub struct ScheduleService {
    ctx: TenantContext,
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    zone: Tz,
    hook: Option<Arc<dyn WriteHook>>,
    locks: Arc<RecordLocks>,
}

impl ScheduleService {
    pub fn context(&self) -> &TenantContext {
        &self.ctx
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}:{}", self.ctx.label(), id)
    }

    /// Create a schedule, or merge into an existing ACTIVE one for the same
    /// entity, action and recipient.
    ///
    /// `timezone` is the caller's zone, used when the input names none.
    #[tracing::instrument(skip(self, input), fields(tenant_id = %self.ctx, title = %input.title))]
    pub async fn create(
        &self,
        input: NewSchedule,
        timezone: Option<&str>,
    ) -> Result<Schedule, ScheduleError> {
        let target = non_empty(&input.entity_id).zip(non_empty(&input.action));
        // Held until the insert so two creates for one target cannot both miss.
        let _target_guard = match target {
            Some((entity_id, action)) => Some(
                self.locks
                    .lock(format!("{}:target:{}:{}", self.ctx.label(), entity_id, action))
                    .await,
            ),
            None => None,
        };
        let now = self.clock.now();

        if let Some((entity_id, action)) = target {
            let recipient = input.data.as_ref().and_then(recipient_id);
            if let Some(existing) = self
                .store
                .find_active_duplicate(entity_id, action, recipient)
                .await?
            {
                return self.merge_into(existing, input, now).await;
            }
        }

        let config = RecurrenceConfig {
            frequency: input.frequency,
            week_days: input.week_days,
            month_days: input.month_days,
            months: input.months,
        };
        validate_recurrence(&config)?;

        let time_of_day = match input.time_of_day.as_deref() {
            Some(raw) => parse_time("timeOfDay", raw)?,
            None => TimeOfDay::MIDNIGHT,
        };
        let end_time = input
            .end_time
            .as_deref()
            .map(|raw| parse_time("endTime", raw))
            .transpose()?;

        let tz_name = non_empty(&input.timezone)
            .or(timezone)
            .unwrap_or(DEFAULT_TIMEZONE)
            .to_string();
        let tz = resolve_timezone(&tz_name)?;

        let start_date = match input.start_date.as_deref() {
            Some(raw) => parse_date("startDate", raw, &tz)?,
            None => now,
        };
        let end_date = input
            .end_date
            .as_deref()
            .map(|raw| normalize_end_date(raw, &tz))
            .transpose()?;
        let next_override = input
            .next_run_date
            .as_deref()
            .map(|raw| parse_date("nextRunDate", raw, &tz))
            .transpose()?;

        let (cron_expression, next) =
            recompute(&config, time_of_day, &tz_name, start_date, end_date, now)?;

        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            tenant_id: self.ctx.tenant_id().map(str::to_string),
            title: input.title,
            description: input.description,
            frequency: config.frequency,
            week_days: config.week_days,
            month_days: config.month_days,
            months: config.months,
            time_of_day,
            timezone: tz_name,
            start_date,
            end_date,
            cron_expression,
            next_run_date: next_override.unwrap_or(next.next_run_at),
            status: if next.is_active {
                ScheduleStatus::Active
            } else {
                ScheduleStatus::Completed
            },
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            last_run_at: None,
            last_execution_status: None,
            last_error_message: None,
            execution_history: Vec::new(),
            retry_on_failure: input.retry_on_failure.unwrap_or(true),
            max_retries: input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_minutes: input
                .retry_delay_minutes
                .unwrap_or(DEFAULT_RETRY_DELAY_MINUTES),
            current_retries: 0,
            entity_id: input.entity_id,
            action: input.action,
            data: input.data.unwrap_or_else(|| json!({})),
            interval: input.interval,
            interval_unit: input.interval_unit,
            end_time,
            created_at: now,
            updated_at: now,
        };

        self.store.insert(&schedule).await?;
        info!(
            schedule_id = %schedule.id,
            cron = %schedule.cron_expression,
            next_run_date = %schedule.next_run_date,
            status = schedule.status.as_str(),
            "schedule created"
        );
        self.after_write(&schedule);
        Ok(schedule)
    }

    async fn merge_into(
        &self,
        existing: Schedule,
        input: NewSchedule,
        now: DateTime<Utc>,
    ) -> Result<Schedule, ScheduleError> {
        let id = existing.id.clone();
        let _guard = self.locks.lock(self.record_key(&id)).await;
        // Re-read under the lock; the candidate may be stale.
        let mut existing = self.store.get(&id).await?.unwrap_or(existing);
        if let Some(raw) = input.next_run_date.as_deref() {
            let tz = resolve_timezone(&existing.timezone)?;
            existing.next_run_date = parse_date("nextRunDate", raw, &tz)?;
        }
        if !input.title.trim().is_empty() {
            existing.title = input.title;
        }
        if input.description.is_some() {
            existing.description = input.description;
        }
        if let Some(data) = &input.data {
            existing.data = merge_data(&existing.data, data);
        }
        existing.updated_at = now;

        self.store.save(&existing).await?;
        info!(schedule_id = %existing.id, "merged into existing schedule");
        self.after_write(&existing);
        Ok(existing)
    }

    /// Apply a partial update.
    ///
    /// A patch touching start or end date, frequency, time of day, timezone
    /// or any of the day/month lists re-derives the cron expression, next run
    /// and status; other patches are applied as-is.
    #[tracing::instrument(skip(self, patch), fields(tenant_id = %self.ctx))]
    pub async fn update(
        &self,
        id: &str,
        patch: SchedulePatch,
        timezone: Option<&str>,
    ) -> Result<Schedule, ScheduleError> {
        let _guard = self.locks.lock(self.record_key(id)).await;
        let now = self.clock.now();
        let mut schedule = self.require(id).await?;

        if patch.touches_recurrence() {
            let config = RecurrenceConfig {
                frequency: patch.frequency.unwrap_or(schedule.frequency),
                week_days: patch
                    .week_days
                    .clone()
                    .unwrap_or_else(|| schedule.week_days.clone()),
                month_days: patch
                    .month_days
                    .clone()
                    .unwrap_or_else(|| schedule.month_days.clone()),
                months: patch
                    .months
                    .clone()
                    .unwrap_or_else(|| schedule.months.clone()),
            };
            validate_recurrence(&config)?;

            let time_of_day = match patch.time_of_day.as_deref() {
                Some(raw) => parse_time("timeOfDay", raw)?,
                None => schedule.time_of_day,
            };
            let tz_name = non_empty(&patch.timezone)
                .or(timezone)
                .map(str::to_string)
                .unwrap_or_else(|| schedule.timezone.clone());
            let tz = resolve_timezone(&tz_name)?;

            let start_date = match patch.start_date.as_deref() {
                Some(raw) => parse_date("startDate", raw, &tz)?,
                None => schedule.start_date,
            };
            let end_date = match patch.end_date.as_deref() {
                Some(raw) if raw.trim().is_empty() => None,
                Some(raw) => Some(normalize_end_date(raw, &tz)?),
                None => {
                    // Keep the same calendar day, re-anchored in the new zone.
                    let old_tz = parse_timezone(&schedule.timezone).unwrap_or(tz);
                    schedule
                        .end_date
                        .map(|end| end_of_day(&tz, local_date(end, &old_tz)))
                }
            };

            let (cron_expression, next) =
                recompute(&config, time_of_day, &tz_name, start_date, end_date, now)?;

            schedule.frequency = config.frequency;
            schedule.week_days = config.week_days;
            schedule.month_days = config.month_days;
            schedule.months = config.months;
            schedule.time_of_day = time_of_day;
            schedule.timezone = tz_name;
            schedule.start_date = start_date;
            schedule.end_date = end_date;
            schedule.cron_expression = cron_expression;
            schedule.next_run_date = next.next_run_at;
            // COMPLETED is terminal; a recompute never reactivates.
            if !next.is_active {
                schedule.status = ScheduleStatus::Completed;
            }
            debug!(
                schedule_id = %schedule.id,
                cron = %schedule.cron_expression,
                next_run_date = %schedule.next_run_date,
                "recurrence recomputed"
            );
        }

        let end_time = patch
            .end_time
            .as_deref()
            .map(|raw| parse_time("endTime", raw))
            .transpose()?;

        if let Some(title) = patch.title {
            schedule.title = title;
        }
        if let Some(description) = patch.description {
            schedule.description = Some(description);
        }
        if let Some(retry) = patch.retry_on_failure {
            schedule.retry_on_failure = retry;
        }
        if let Some(max) = patch.max_retries {
            schedule.max_retries = max;
        }
        if let Some(delay) = patch.retry_delay_minutes {
            schedule.retry_delay_minutes = delay;
        }
        if let Some(entity_id) = patch.entity_id {
            schedule.entity_id = Some(entity_id);
        }
        if let Some(action) = patch.action {
            schedule.action = Some(action);
        }
        if let Some(data) = patch.data {
            schedule.data = data;
        }
        if let Some(interval) = patch.interval {
            schedule.interval = Some(interval);
        }
        if let Some(unit) = patch.interval_unit {
            schedule.interval_unit = Some(unit);
        }
        if end_time.is_some() {
            schedule.end_time = end_time;
        }
        schedule.updated_at = now;

        self.store.save(&schedule).await?;
        info!(schedule_id = %schedule.id, "schedule updated");
        self.after_write(&schedule);
        Ok(schedule)
    }

    /// Hard-delete a schedule. The write hook is not called.
    #[tracing::instrument(skip(self), fields(tenant_id = %self.ctx))]
    pub async fn delete(&self, id: &str) -> Result<(), ScheduleError> {
        if self.store.delete(id).await? {
            info!(schedule_id = id, "schedule deleted");
            Ok(())
        } else {
            Err(ScheduleError::NotFound(id.to_string()))
        }
    }

    pub async fn get(&self, id: &str) -> Result<Schedule, ScheduleError> {
        self.require(id).await
    }

    /// All schedules of this tenant, newest first.
    pub async fn list(&self) -> Result<Vec<Schedule>, ScheduleError> {
        Ok(self.store.list().await?)
    }

    /// Record the outcome of one execution.
    ///
    /// Bookkeeping only; does not move the next run and does not arm.
    #[tracing::instrument(skip(self, error_message), fields(tenant_id = %self.ctx))]
    pub async fn track_execution(
        &self,
        id: &str,
        success: bool,
        error_message: Option<String>,
    ) -> Result<Schedule, ScheduleError> {
        let _guard = self.locks.lock(self.record_key(id)).await;
        let now = self.clock.now();
        let mut schedule = self.require(id).await?;
        schedule.record_execution(now, success, error_message);
        schedule.updated_at = now;

        self.store.save(&schedule).await?;
        debug!(
            schedule_id = id,
            success,
            execution_count = schedule.execution_count,
            "execution tracked"
        );
        Ok(schedule)
    }

    /// Mark a run as done and advance to the following occurrence.
    ///
    /// The next occurrence is searched from now, not from the previous next
    /// run. ONCE schedules, and schedules whose next occurrence falls past the
    /// end date, become COMPLETED; the out-of-window next run is kept.
    #[tracing::instrument(skip(self), fields(tenant_id = %self.ctx))]
    pub async fn execute_and_update_next(&self, id: &str) -> Result<Schedule, ScheduleError> {
        let _guard = self.locks.lock(self.record_key(id)).await;
        let now = self.clock.now();
        let mut schedule = self.require(id).await?;
        schedule.last_run_at = Some(now);

        if schedule.frequency == Frequency::Once {
            schedule.status = ScheduleStatus::Completed;
        } else if schedule.is_active() {
            let next = next_occurrence_after(&schedule.cron_expression, now, &schedule.timezone)
                .inspect_err(|e| log_recurrence_failure(e, &schedule.id))?;
            schedule.next_run_date = next;
            if schedule.end_date.is_some_and(|end| next > end) {
                schedule.status = ScheduleStatus::Completed;
            }
        }
        schedule.updated_at = now;

        self.store.save(&schedule).await?;
        info!(
            schedule_id = id,
            next_run_date = %schedule.next_run_date,
            status = schedule.status.as_str(),
            "schedule advanced"
        );
        self.after_write(&schedule);
        Ok(schedule)
    }

    /// ACTIVE schedules whose next run is at or after local midnight today,
    /// ordered by time of day.
    pub async fn due_today(&self) -> Result<Vec<Schedule>, ScheduleError> {
        let today = local_date(self.clock.now(), &self.zone);
        let since = start_of_day(&self.zone, today);
        Ok(self.store.active_since(since).await?)
    }

    /// Move ACTIVE schedules whose next run fell before local midnight today
    /// onto their first occurrence at or after it.
    ///
    /// Picks up schedules written without an arming hook, or missed while no
    /// daemon ran, so that [`due_today`](Self::due_today) sees them again.
    /// Returns how many records moved. The write hook is not called; the
    /// caller arms.
    #[tracing::instrument(skip(self), fields(tenant_id = %self.ctx))]
    pub async fn catch_up_overdue(&self) -> Result<usize, ScheduleError> {
        let now = self.clock.now();
        let midnight = start_of_day(&self.zone, local_date(now, &self.zone));
        let overdue = self.store.active_before(midnight).await?;

        let mut moved = 0;
        for stale in overdue {
            let _guard = self.locks.lock(self.record_key(&stale.id)).await;
            let Some(mut schedule) = self.store.get(&stale.id).await? else {
                continue;
            };
            if !schedule.is_active() || schedule.next_run_date >= midnight {
                continue;
            }

            let next = match next_occurrence(
                &schedule.cron_expression,
                schedule.start_date,
                schedule.end_date,
                &schedule.timezone,
                midnight - Duration::seconds(1),
            ) {
                Ok(next) => next,
                Err(e) => {
                    log_recurrence_failure(&e, &schedule.id);
                    continue;
                }
            };

            let missed = schedule.next_run_date;
            schedule.next_run_date = next.next_run_at;
            if !next.is_active {
                schedule.status = ScheduleStatus::Completed;
            }
            schedule.updated_at = now;
            self.store.save(&schedule).await?;
            warn!(
                schedule_id = %schedule.id,
                missed = %missed,
                next_run_date = %schedule.next_run_date,
                status = schedule.status.as_str(),
                "overdue schedule moved forward"
            );
            moved += 1;
        }
        Ok(moved)
    }

    async fn require(&self, id: &str) -> Result<Schedule, ScheduleError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))
    }

    fn after_write(&self, schedule: &Schedule) {
        if let Some(hook) = &self.hook {
            hook.after_write(&self.ctx, schedule);
        }
    }
}

fn recompute(
    config: &RecurrenceConfig,
    time_of_day: TimeOfDay,
    timezone: &str,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(String, NextOccurrence), ScheduleError> {
    let cron = synthesize_cron(config, &time_of_day.to_string(), 0)
        .inspect_err(|e| log_recurrence_failure(e, "<new>"))?;
    let next = next_occurrence(&cron, start_date, end_date, timezone, now).map_err(|e| match e {
        // Only impossible day/month pairs (Feb 30, Apr 31) never match.
        RecurrenceError::NoOccurrence { .. } => ScheduleError::validation(
            "monthDays",
            format!(
                "monthDays {:?} never occur in months {:?}",
                config.month_days, config.months
            ),
        ),
        other => {
            log_recurrence_failure(&other, "<new>");
            other.into()
        }
    })?;
    Ok((cron, next))
}

fn log_recurrence_failure(e: &RecurrenceError, schedule_id: &str) {
    error!(schedule_id, error = %e, "recurrence computation failed");
}

fn validate_recurrence(config: &RecurrenceConfig) -> Result<(), ScheduleError> {
    match config.frequency {
        Frequency::Weekly if config.week_days.is_empty() => {
            return Err(ScheduleError::validation(
                "weekDays",
                "weekDays is required for WEEKLY frequency",
            ));
        }
        Frequency::Monthly if config.month_days.is_empty() => {
            return Err(ScheduleError::validation(
                "monthDays",
                "monthDays is required for MONTHLY frequency",
            ));
        }
        Frequency::Yearly if config.months.is_empty() => {
            return Err(ScheduleError::validation(
                "months",
                "months is required for YEARLY frequency",
            ));
        }
        _ => {}
    }

    check_range("weekDays", &config.week_days, 0, 7)?;
    check_range("monthDays", &config.month_days, 1, 31)?;
    check_range("months", &config.months, 1, 12)
}

fn check_range(field: &'static str, values: &[u32], min: u32, max: u32) -> Result<(), ScheduleError> {
    match values.iter().find(|v| **v < min || **v > max) {
        Some(v) => Err(ScheduleError::validation(
            field,
            format!("{field} contains {v}; expected values {min}-{max}"),
        )),
        None => Ok(()),
    }
}

fn parse_time(field: &'static str, raw: &str) -> Result<TimeOfDay, ScheduleError> {
    raw.parse()
        .map_err(|_| ScheduleError::validation(field, format!("{field} must be HH:MM, got `{raw}`")))
}

fn resolve_timezone(name: &str) -> Result<Tz, ScheduleError> {
    parse_timezone(name).map_err(|e| ScheduleError::validation("timezone", e.to_string()))
}

fn parse_date(field: &'static str, raw: &str, tz: &Tz) -> Result<DateTime<Utc>, ScheduleError> {
    parse_date_input(raw, tz).ok_or_else(|| {
        ScheduleError::validation(field, format!("{field} must be a valid date, got `{raw}`"))
    })
}

/// End dates are inclusive through the last millisecond of their local day.
fn normalize_end_date(raw: &str, tz: &Tz) -> Result<DateTime<Utc>, ScheduleError> {
    let parsed = parse_date("endDate", raw, tz)?;
    Ok(end_of_day(tz, local_date(parsed, tz)))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
