//! Daemon command for running the schedule engine.
//!
//! The daemon runs two long-lived tasks sharing one in-process queue:
//! - the daily synchronizer, which drains the queue and arms every schedule
//!   due today, at startup and then once a day
//! - the job dispatcher, which consumes armed jobs and runs their actions
//!
//! Writes made while the daemon runs are armed immediately through the
//! arming hook.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use miette::Result;
use tokio::sync::watch;
use tracing::info;

use kettle_scheduler::store::SqliteTenantDirectory;
use kettle_scheduler::tenant::SqliteTenantStores;
use kettle_scheduler::{
    Clock, DailySynchronizer, ImmediateArmingHook, JobArmer, JobDispatcher, MemoryQueue,
    ScheduleServices, SyncConfig, SystemClock, TimeOfDay,
};

use crate::actions;

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default number of jobs dispatched concurrently.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default bound on each queue call during cleanup, in seconds.
pub const DEFAULT_CLEANUP_TIMEOUT_SECS: u64 = 5;

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Holds `platform.db` and `tenants/<tenant>.db`.
    pub data_dir: PathBuf,
    /// Operating timezone that defines "today" and the daily trigger.
    pub timezone: Tz,
    pub sync_at: TimeOfDay,
    pub concurrency: usize,
    pub cleanup_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            timezone: Tz::UTC,
            sync_at: TimeOfDay::MIDNIGHT,
            concurrency: DEFAULT_CONCURRENCY,
            cleanup_timeout: Duration::from_secs(DEFAULT_CLEANUP_TIMEOUT_SECS),
        }
    }
}

/// Everything the daemon runs, wired together.
pub struct Daemon {
    services: ScheduleServices,
    queue: Arc<MemoryQueue>,
    synchronizer: Arc<DailySynchronizer>,
    dispatcher: Arc<JobDispatcher>,
}

impl Daemon {
    /// Open the databases under `config.data_dir` and wire the engine.
    pub fn open(config: &DaemonConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            miette::miette!(
                "failed to create data directory {}: {}",
                config.data_dir.display(),
                e
            )
        })?;

        let stores = Arc::new(SqliteTenantStores::new(&config.data_dir));
        let directory = Arc::new(
            SqliteTenantDirectory::open(stores.platform_path())
                .map_err(|e| miette::miette!("failed to open tenant directory: {}", e))?,
        );

        let queue = Arc::new(MemoryQueue::new());
        let armer = Arc::new(JobArmer::new(
            queue.clone(),
            clock.clone(),
            config.timezone,
        ));
        let services = ScheduleServices::new(stores, clock, config.timezone)
            .with_hook(Arc::new(ImmediateArmingHook::new(armer.clone())));

        let synchronizer = Arc::new(DailySynchronizer::new(
            directory,
            services.clone(),
            armer,
            queue.clone(),
            SyncConfig {
                cleanup_timeout: config.cleanup_timeout,
                sync_at: config.sync_at,
            },
        ));
        let dispatcher = Arc::new(JobDispatcher::new(
            queue.clone(),
            Arc::new(actions::registry()),
            services.clone(),
            config.concurrency.max(1),
        ));

        Ok(Self {
            services,
            queue,
            synchronizer,
            dispatcher,
        })
    }

    /// Lifecycle services with the arming hook installed.
    pub fn services(&self) -> &ScheduleServices {
        &self.services
    }

    /// Run until `shutdown_rx` flips to true.
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) {
        let sync_handle = {
            let synchronizer = self.synchronizer.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move { synchronizer.run(shutdown_rx).await })
        };
        let dispatch_handle = tokio::spawn(self.dispatcher.clone().run(shutdown_rx.clone()));

        // Wait for shutdown signal
        let mut main_shutdown_rx = shutdown_rx;
        loop {
            if *main_shutdown_rx.borrow() || main_shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!("shutting down daemon tasks");
        let _ = sync_handle.await;
        let _ = dispatch_handle.await;
        self.queue.close().await;
    }
}

/// Run the daemon until interrupted.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!(
        data_dir = %config.data_dir.display(),
        timezone = %config.timezone,
        sync_at = %config.sync_at,
        concurrency = config.concurrency,
        "starting Kettle daemon"
    );

    let daemon = Daemon::open(&config, Arc::new(SystemClock))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    daemon.run(shutdown_rx).await;

    info!("daemon shut down gracefully");
    Ok(())
}
