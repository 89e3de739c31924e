//! Schedule record storage.
//!
//! Every tenant owns one [`ScheduleStore`]. The lifecycle service is the only
//! writer; the synchronizer and dispatcher read through the service.

mod memory;
mod sqlite;

pub use memory::MemoryScheduleStore;
pub use sqlite::{SqliteScheduleStore, SqliteTenantDirectory};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{Schedule, StoreError};

/// Persistence contract for schedules of a single tenant.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a new schedule.
    async fn insert(&self, schedule: &Schedule) -> Result<(), StoreError>;

    /// Replace an existing schedule (or insert it if missing).
    async fn save(&self, schedule: &Schedule) -> Result<(), StoreError>;

    /// Fetch by id.
    async fn get(&self, id: &str) -> Result<Option<Schedule>, StoreError>;

    /// Delete by id. Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Find an ACTIVE schedule targeting the same entity and action.
    ///
    /// When `recipient_id` is given, the stored `data.recipientId` must equal
    /// it as well. The oldest match wins.
    async fn find_active_duplicate(
        &self,
        entity_id: &str,
        action: &str,
        recipient_id: Option<&Value>,
    ) -> Result<Option<Schedule>, StoreError>;

    /// ACTIVE schedules whose next run is at or after `since`, ordered by
    /// time of day.
    async fn active_since(&self, since: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError>;

    /// ACTIVE schedules whose next run is strictly before `before`, oldest
    /// first.
    async fn active_before(&self, before: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError>;

    /// All schedules, newest first.
    async fn list(&self) -> Result<Vec<Schedule>, StoreError>;
}

/// Shared duplicate predicate for store implementations.
pub(crate) fn is_duplicate_of(
    schedule: &Schedule,
    entity_id: &str,
    action: &str,
    recipient_id: Option<&Value>,
) -> bool {
    schedule.is_active()
        && schedule.entity_id.as_deref() == Some(entity_id)
        && schedule.action.as_deref() == Some(action)
        && recipient_id.is_none_or(|r| schedule.recipient_id() == Some(r))
}

/// Order schedules by time of day, then next run, then id.
pub(crate) fn sort_by_time_of_day(schedules: &mut [Schedule]) {
    schedules.sort_by(|a, b| {
        a.time_of_day
            .cmp(&b.time_of_day)
            .then(a.next_run_date.cmp(&b.next_run_date))
            .then_with(|| a.id.cmp(&b.id))
    });
}
