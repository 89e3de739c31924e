//! In-memory schedule store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use super::{ScheduleStore, is_duplicate_of, sort_by_time_of_day};
use crate::{Schedule, StoreError};

/// Schedule store backed by a concurrent map. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    schedules: DashMap<String, Schedule>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored schedules.
    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.schedules
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn save(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.schedules
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        Ok(self.schedules.get(id).map(|s| s.clone()))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.schedules.remove(id).is_some())
    }

    async fn find_active_duplicate(
        &self,
        entity_id: &str,
        action: &str,
        recipient_id: Option<&Value>,
    ) -> Result<Option<Schedule>, StoreError> {
        Ok(self
            .schedules
            .iter()
            .filter(|s| is_duplicate_of(s.value(), entity_id, action, recipient_id))
            .map(|s| s.value().clone())
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))))
    }

    async fn active_since(&self, since: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let mut due: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|s| s.is_active() && s.next_run_date >= since)
            .map(|s| s.value().clone())
            .collect();
        sort_by_time_of_day(&mut due);
        Ok(due)
    }

    async fn active_before(&self, before: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let mut overdue: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|s| s.is_active() && s.next_run_date < before)
            .map(|s| s.value().clone())
            .collect();
        overdue.sort_by(|a, b| {
            a.next_run_date
                .cmp(&b.next_run_date)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(overdue)
    }

    async fn list(&self) -> Result<Vec<Schedule>, StoreError> {
        let mut all: Vec<Schedule> = self.schedules.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}
