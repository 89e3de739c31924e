//! Tenant-aware recurring schedule engine for Kettle.
//!
//! This crate turns declarative recurrence definitions into concrete run
//! times and drives their execution through a job queue:
//! - [`recurrence`] synthesizes 5-field cron expressions and finds the next
//!   matching instant in a schedule's timezone
//! - [`ScheduleService`] owns every write to schedule records, deduplicates
//!   by target and action, and tracks execution history
//! - [`DailySynchronizer`] clears stale queue state and arms every schedule
//!   due today, once at startup and then daily, tenant by tenant
//! - [`ImmediateArmingHook`] arms schedules written mid-day that are due today
//! - [`JobDispatcher`] restores the tenant context of a queued job and runs
//!   the named action handler

pub mod arming;
pub mod clock;
pub mod cron;
pub mod dispatch;
mod error;
pub mod queue;
pub mod recurrence;
pub mod service;
pub mod store;
pub mod sync;
pub mod tenant;
mod types;

pub use arming::{ImmediateArmingHook, JobArmer};
pub use clock::{Clock, FixedClock, SystemClock};
pub use dispatch::{ActionContext, ActionError, ActionHandler, ActionRegistry, JobDispatcher};
pub use error::{ArmError, DispatchError, QueueError, RecurrenceError, ScheduleError, StoreError};
pub use queue::{Job, JobOptions, JobQueue, JobState, MemoryQueue};
pub use service::{ScheduleService, ScheduleServices, WriteHook};
pub use store::ScheduleStore;
pub use sync::{DailySynchronizer, SyncConfig, SyncReport};
pub use tenant::{TenantContext, TenantDirectory, TenantRecord, TenantStores};
pub use types::{
    ExecutionRecord, ExecutionStatus, Frequency, IntervalUnit, MAX_EXECUTION_HISTORY, NewSchedule,
    RecurrenceConfig, Schedule, SchedulePatch, ScheduleStatus, TimeOfDay,
};
