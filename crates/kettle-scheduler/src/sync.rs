//! Daily synchronizer.
//!
//! Once at startup and then once a day, clears the queue of the previous
//! cycle's jobs and re-arms every schedule due today, tenant by tenant.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as TimeDelta;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::arming::JobArmer;
use crate::queue::{JobQueue, JobState};
use crate::recurrence::{local_date, resolve_local};
use crate::service::ScheduleServices;
use crate::tenant::{TenantContext, TenantDirectory};
use crate::{QueueError, ScheduleError, TimeOfDay};

/// Default timeout for each queue cleanup operation.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Synchronizer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Bound on each queue call made during cleanup.
    pub cleanup_timeout: Duration,
    /// Daily trigger, in the operating timezone.
    pub sync_at: TimeOfDay,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            sync_at: TimeOfDay::MIDNIGHT,
        }
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Tenant contexts processed without error, platform included.
    pub tenants_processed: usize,
    pub tenants_failed: usize,
    pub jobs_armed: usize,
    /// Cleanup steps that failed or timed out.
    pub cleanup_errors: usize,
}

/// Re-arms due schedules across all tenants.
pub struct DailySynchronizer {
    directory: Arc<dyn TenantDirectory>,
    services: ScheduleServices,
    armer: Arc<JobArmer>,
    queue: Arc<dyn JobQueue>,
    config: SyncConfig,
}

impl DailySynchronizer {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        services: ScheduleServices,
        armer: Arc<JobArmer>,
        queue: Arc<dyn JobQueue>,
        config: SyncConfig,
    ) -> Self {
        Self {
            directory,
            services,
            armer,
            queue,
            config,
        }
    }

    /// Run a cycle now, then one per day at the configured time until
    /// shutdown is signalled.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(sync_at = %self.config.sync_at, "daily synchronizer starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.run_cycle().await;

            let wait = self.until_next_trigger();
            debug!(wait_secs = wait.as_secs(), "next synchronization scheduled");

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // A dropped sender can never signal again; treat it as shutdown.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("daily synchronizer received shutdown signal");
                        break;
                    }
                }
                _ = sleep(wait) => {}
            }
        }

        info!("daily synchronizer shut down");
    }

    /// One full cycle: cleanup, then arming for every tenant.
    ///
    /// Never fails; problems are logged and counted in the report.
    #[tracing::instrument(skip(self))]
    pub async fn run_cycle(&self) -> SyncReport {
        let mut report = SyncReport {
            cleanup_errors: self.cleanup().await,
            ..Default::default()
        };

        let mut contexts = vec![TenantContext::platform()];
        match self.directory.list_tenants_with_id().await {
            Ok(tenants) => contexts.extend(
                tenants
                    .into_iter()
                    .map(|t| TenantContext::tenant(t.tenant_id)),
            ),
            Err(e) => {
                error!(error = %e, "failed to list tenants, only the platform context will be synchronized");
            }
        }

        // Sequential on purpose: one tenant context at a time.
        for ctx in contexts {
            match ctx.clone().scope(self.sync_tenant(&ctx)).await {
                Ok(armed) => {
                    report.tenants_processed += 1;
                    report.jobs_armed += armed;
                }
                Err(e) => {
                    report.tenants_failed += 1;
                    error!(tenant_id = %ctx, error = %e, "tenant synchronization failed");
                }
            }
        }

        info!(
            tenants_processed = report.tenants_processed,
            tenants_failed = report.tenants_failed,
            jobs_armed = report.jobs_armed,
            cleanup_errors = report.cleanup_errors,
            "synchronization cycle finished"
        );
        report
    }

    async fn sync_tenant(&self, ctx: &TenantContext) -> Result<usize, ScheduleError> {
        let service = self.services.for_tenant(ctx).await?;
        let caught_up = service.catch_up_overdue().await?;
        if caught_up > 0 {
            info!(tenant_id = %ctx, caught_up, "moved overdue schedules to today");
        }
        let due = service.due_today().await?;

        let mut armed = 0;
        for schedule in due.iter().filter(|s| self.armer.is_due_today(s)) {
            match self.armer.arm(ctx, schedule).await {
                Ok(Some(_)) => armed += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        tenant_id = %ctx,
                        schedule_id = %schedule.id,
                        error = %e,
                        "failed to arm schedule"
                    );
                }
            }
        }

        debug!(tenant_id = %ctx, candidates = due.len(), armed, "tenant synchronized");
        Ok(armed)
    }

    /// Drain every job left over from the previous cycle. Returns the number
    /// of failed steps.
    async fn cleanup(&self) -> usize {
        let mut errors = 0;

        match self
            .bounded("list_jobs", self.queue.list_jobs(&JobState::ALL))
            .await
        {
            Ok(jobs) => {
                for job in jobs {
                    if let Err(e) = self.bounded("remove", self.queue.remove(&job.id)).await {
                        // Another consumer may have finished it in between.
                        if !matches!(e, QueueError::NotFound(_)) {
                            errors += 1;
                            warn!(job_id = %job.id, error = %e, "failed to remove job");
                        }
                    }
                }
            }
            Err(e) => {
                errors += 1;
                warn!(error = %e, "failed to list jobs for cleanup");
            }
        }

        for state in [JobState::Completed, JobState::Failed] {
            if let Err(e) = self
                .bounded("clean", self.queue.clean(Duration::ZERO, state))
                .await
            {
                errors += 1;
                warn!(state = %state, error = %e, "failed to clean jobs");
            }
        }

        errors
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, QueueError>>,
    ) -> Result<T, QueueError> {
        timeout(self.config.cleanup_timeout, fut)
            .await
            .unwrap_or(Err(QueueError::Timeout {
                operation,
                seconds: self.config.cleanup_timeout.as_secs(),
            }))
    }

    fn until_next_trigger(&self) -> Duration {
        let clock = self.services.clock();
        let zone = self.services.zone();
        let now = clock.now();
        let today = local_date(now, &zone);

        let mut next = resolve_local(&zone, today, self.config.sync_at.to_naive_time());
        if next <= now {
            next = resolve_local(
                &zone,
                today + TimeDelta::days(1),
                self.config.sync_at.to_naive_time(),
            );
        }
        (next - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::queue::{JobOptions, MemoryQueue};
    use crate::tenant::{MemoryTenantDirectory, MemoryTenantStores, TenantRecord};
    use crate::{Frequency, NewSchedule, StoreError};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use chrono_tz::Tz;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    struct Harness {
        sync: DailySynchronizer,
        services: ScheduleServices,
        queue: Arc<MemoryQueue>,
        clock: FixedClock,
    }

    fn harness(now: &str, directory: Arc<dyn TenantDirectory>) -> Harness {
        let clock = FixedClock::new(utc(now));
        let queue = Arc::new(MemoryQueue::new());
        let services = ScheduleServices::new(
            Arc::new(MemoryTenantStores::new()),
            Arc::new(clock.clone()),
            Tz::UTC,
        );
        let armer = Arc::new(JobArmer::new(
            queue.clone(),
            Arc::new(clock.clone()),
            Tz::UTC,
        ));
        let sync = DailySynchronizer::new(
            directory,
            services.clone(),
            armer,
            queue.clone(),
            SyncConfig::default(),
        );
        Harness {
            sync,
            services,
            queue,
            clock,
        }
    }

    fn reminder(time: &str) -> NewSchedule {
        NewSchedule {
            title: "Reminder".to_string(),
            frequency: Frequency::Daily,
            time_of_day: Some(time.to_string()),
            action: Some("send_reminder".to_string()),
            ..Default::default()
        }
    }

    async fn create(h: &Harness, ctx: &TenantContext, input: NewSchedule) {
        h.services
            .for_tenant(ctx)
            .await
            .unwrap()
            .create(input, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cycle_arms_due_schedules_for_every_tenant() {
        let directory = Arc::new(MemoryTenantDirectory::new());
        directory.add("biz-1", "iron");
        directory.add("biz-2", "steel");
        let h = harness("2025-01-01T00:00:00Z", directory);

        create(&h, &TenantContext::platform(), reminder("09:00")).await;
        create(&h, &TenantContext::tenant("iron"), reminder("18:00")).await;
        create(&h, &TenantContext::tenant("iron"), reminder("07:00")).await;
        create(
            &h,
            &TenantContext::tenant("steel"),
            NewSchedule {
                action: None,
                ..reminder("10:00")
            },
        )
        .await;

        let report = h.sync.run_cycle().await;
        assert_eq!(
            report,
            SyncReport {
                tenants_processed: 3,
                tenants_failed: 0,
                jobs_armed: 3,
                cleanup_errors: 0,
            }
        );

        let jobs = h.queue.list_jobs(&JobState::ALL).await.unwrap();
        let tenants: Vec<_> = jobs
            .iter()
            .map(|j| j.payload["tenantId"].clone())
            .collect();
        // Platform first, then tenants in directory order; within a tenant by
        // time of day.
        assert_eq!(
            tenants,
            vec![json!(null), json!("iron"), json!("iron")]
        );
        assert!(jobs[1].payload["date"].as_str().unwrap().starts_with("2025-01-01T07:00"));
    }

    #[tokio::test]
    async fn test_schedules_due_later_are_not_armed() {
        let h = harness("2025-01-01T12:00:00Z", Arc::new(MemoryTenantDirectory::new()));
        create(
            &h,
            &TenantContext::platform(),
            NewSchedule {
                start_date: Some("2025-01-03".to_string()),
                ..reminder("09:00")
            },
        )
        .await;

        let report = h.sync.run_cycle().await;
        assert_eq!(report.jobs_armed, 0);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_drains_previous_cycle() {
        let h = harness("2025-01-01T00:00:00Z", Arc::new(MemoryTenantDirectory::new()));
        for id in ["stale-1", "stale-2"] {
            h.queue
                .enqueue(
                    "old",
                    json!({}),
                    JobOptions {
                        job_id: Some(id.to_string()),
                        delay: Duration::from_secs(3600),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let report = h.sync.run_cycle().await;
        assert_eq!(report.cleanup_errors, 0);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_rerun_same_day_does_not_duplicate() {
        let h = harness("2025-01-01T00:00:00Z", Arc::new(MemoryTenantDirectory::new()));
        create(&h, &TenantContext::platform(), reminder("09:00")).await;

        h.sync.run_cycle().await;
        h.clock.advance(TimeDelta::hours(1));
        let report = h.sync.run_cycle().await;

        assert_eq!(report.jobs_armed, 1);
        assert_eq!(h.queue.len().await, 1);
    }

    struct FailingDirectory;

    #[async_trait]
    impl TenantDirectory for FailingDirectory {
        async fn list_tenants_with_id(&self) -> Result<Vec<TenantRecord>, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    #[tokio::test]
    async fn test_directory_failure_still_syncs_platform() {
        let h = harness("2025-01-01T00:00:00Z", Arc::new(FailingDirectory));
        create(&h, &TenantContext::platform(), reminder("09:00")).await;

        let report = h.sync.run_cycle().await;
        assert_eq!(report.tenants_processed, 1);
        assert_eq!(report.jobs_armed, 1);
    }

    #[test]
    fn test_until_next_trigger() {
        let h = harness("2025-01-01T22:00:00Z", Arc::new(MemoryTenantDirectory::new()));
        assert_eq!(h.sync.until_next_trigger(), Duration::from_secs(2 * 60 * 60));

        h.clock.set(utc("2025-01-02T00:00:00Z"));
        assert_eq!(
            h.sync.until_next_trigger(),
            Duration::from_secs(24 * 60 * 60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let h = harness("2025-01-01T00:00:00Z", Arc::new(MemoryTenantDirectory::new()));

        let (tx, rx) = watch::channel(false);
        let sync = Arc::new(h.sync);
        let task = tokio::spawn({
            let sync = sync.clone();
            async move { sync.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), task)
            .await
            .expect("synchronizer did not stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_shutdown_sender_is_dropped() {
        let h = harness("2025-01-01T00:00:00Z", Arc::new(MemoryTenantDirectory::new()));
        create(&h, &TenantContext::platform(), reminder("09:00")).await;

        let (tx, rx) = watch::channel(false);
        let sync = Arc::new(h.sync);
        let task = tokio::spawn({
            let sync = sync.clone();
            async move { sync.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(tx);
        timeout(Duration::from_secs(1), task)
            .await
            .expect("synchronizer kept looping after the sender was dropped")
            .unwrap();

        // Only the startup cycle ran.
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_cycle_catches_up_overdue_schedule() {
        let h = harness("2025-01-01T06:00:00Z", Arc::new(MemoryTenantDirectory::new()));
        let ctx = TenantContext::tenant("iron");
        create(&h, &ctx, reminder("09:00")).await;

        // The daemon was down for two days.
        h.clock.set(utc("2025-01-03T00:00:00Z"));
        let directory = MemoryTenantDirectory::new();
        directory.add("biz-1", "iron");
        let sync = DailySynchronizer::new(
            Arc::new(directory),
            h.services.clone(),
            Arc::new(JobArmer::new(h.queue.clone(), Arc::new(h.clock.clone()), Tz::UTC)),
            h.queue.clone(),
            SyncConfig::default(),
        );

        let report = sync.run_cycle().await;
        assert_eq!(report.jobs_armed, 1);

        let stored = h.services.for_tenant(&ctx).await.unwrap().list().await.unwrap();
        assert_eq!(stored[0].next_run_date, utc("2025-01-03T09:00:00Z"));
    }
}
