//! SQLite-backed schedule storage and tenant directory.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::Value;
use tracing::info;

use super::{ScheduleStore, is_duplicate_of, sort_by_time_of_day};
use crate::tenant::{TenantDirectory, TenantRecord};
use crate::{
    ExecutionStatus, Frequency, IntervalUnit, Schedule, ScheduleStatus, StoreError, TimeOfDay,
};

const SCHEDULE_COLUMNS: &str = "id, tenant_id, title, description, frequency, week_days, \
     month_days, months, time_of_day, timezone, start_date, end_date, cron_expression, \
     next_run_date, status, execution_count, success_count, failure_count, last_run_at, \
     last_execution_status, last_error_message, execution_history, retry_on_failure, \
     max_retries, retry_delay_minutes, current_retries, entity_id, action, data, \
     interval, interval_unit, end_time, created_at, updated_at";

/// Format timestamps so that lexical order equals chronological order.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock().map_err(|_| StoreError::Poisoned)
}

/// Run `f` against the connection on the blocking pool.
async fn blocking<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let guard = lock(&conn)?;
        f(&guard)
    })
    .await?
}

/// One tenant's schedules in a SQLite database.
pub struct SqliteScheduleStore {
    conn: Arc<Mutex<Connection>>,
}

/// A schedule row as stored, before decoding.
#[derive(Debug, Clone)]
struct ScheduleRow {
    id: String,
    tenant_id: Option<String>,
    title: String,
    description: Option<String>,
    frequency: String,
    week_days: String,
    month_days: String,
    months: String,
    time_of_day: String,
    timezone: String,
    start_date: String,
    end_date: Option<String>,
    cron_expression: String,
    next_run_date: String,
    status: String,
    execution_count: u32,
    success_count: u32,
    failure_count: u32,
    last_run_at: Option<String>,
    last_execution_status: Option<String>,
    last_error_message: Option<String>,
    execution_history: String,
    retry_on_failure: bool,
    max_retries: u32,
    retry_delay_minutes: u32,
    current_retries: u32,
    entity_id: Option<String>,
    action: Option<String>,
    data: String,
    interval: Option<u32>,
    interval_unit: Option<String>,
    end_time: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            frequency: row.get(4)?,
            week_days: row.get(5)?,
            month_days: row.get(6)?,
            months: row.get(7)?,
            time_of_day: row.get(8)?,
            timezone: row.get(9)?,
            start_date: row.get(10)?,
            end_date: row.get(11)?,
            cron_expression: row.get(12)?,
            next_run_date: row.get(13)?,
            status: row.get(14)?,
            execution_count: row.get(15)?,
            success_count: row.get(16)?,
            failure_count: row.get(17)?,
            last_run_at: row.get(18)?,
            last_execution_status: row.get(19)?,
            last_error_message: row.get(20)?,
            execution_history: row.get(21)?,
            retry_on_failure: row.get(22)?,
            max_retries: row.get(23)?,
            retry_delay_minutes: row.get(24)?,
            current_retries: row.get(25)?,
            entity_id: row.get(26)?,
            action: row.get(27)?,
            data: row.get(28)?,
            interval: row.get(29)?,
            interval_unit: row.get(30)?,
            end_time: row.get(31)?,
            created_at: row.get(32)?,
            updated_at: row.get(33)?,
        })
    }

    fn decode(self) -> Result<Schedule, StoreError> {
        let id = self.id.clone();
        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.clone(),
            reason,
        };
        let instant = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp `{raw}`: {e}")))
        };
        let optional_instant = |raw: Option<&str>| raw.map(instant).transpose();
        // Enum columns hold the bare serde name; quote them to reuse serde.
        let quoted = |raw: &str| Value::String(raw.to_string());

        Ok(Schedule {
            tenant_id: self.tenant_id,
            title: self.title,
            description: self.description,
            frequency: self.frequency.parse::<Frequency>().map_err(corrupt)?,
            week_days: serde_json::from_str(&self.week_days)?,
            month_days: serde_json::from_str(&self.month_days)?,
            months: serde_json::from_str(&self.months)?,
            time_of_day: self
                .time_of_day
                .parse::<TimeOfDay>()
                .map_err(|e| corrupt(format!("{e}")))?,
            timezone: self.timezone,
            start_date: instant(&self.start_date)?,
            end_date: optional_instant(self.end_date.as_deref())?,
            cron_expression: self.cron_expression,
            next_run_date: instant(&self.next_run_date)?,
            status: self.status.parse::<ScheduleStatus>().map_err(corrupt)?,
            execution_count: self.execution_count,
            success_count: self.success_count,
            failure_count: self.failure_count,
            last_run_at: optional_instant(self.last_run_at.as_deref())?,
            last_execution_status: self
                .last_execution_status
                .as_deref()
                .map(|s| serde_json::from_value::<ExecutionStatus>(quoted(s)))
                .transpose()?,
            last_error_message: self.last_error_message,
            execution_history: serde_json::from_str(&self.execution_history)?,
            retry_on_failure: self.retry_on_failure,
            max_retries: self.max_retries,
            retry_delay_minutes: self.retry_delay_minutes,
            current_retries: self.current_retries,
            entity_id: self.entity_id,
            action: self.action,
            data: serde_json::from_str(&self.data)?,
            interval: self.interval,
            interval_unit: self
                .interval_unit
                .as_deref()
                .map(|s| serde_json::from_value::<IntervalUnit>(quoted(s)))
                .transpose()?,
            end_time: self
                .end_time
                .as_deref()
                .map(|s| s.parse::<TimeOfDay>())
                .transpose()
                .map_err(|e| corrupt(format!("{e}")))?,
            created_at: instant(&self.created_at)?,
            updated_at: instant(&self.updated_at)?,
            id: self.id,
        })
    }
}

/// Bare serde name of a unit enum variant (`"failed"` → `failed`).
fn enum_name<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

impl SqliteScheduleStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn, &path.display().to_string())
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                tenant_id TEXT,
                title TEXT NOT NULL,
                description TEXT,
                frequency TEXT NOT NULL,
                week_days TEXT NOT NULL DEFAULT '[]',
                month_days TEXT NOT NULL DEFAULT '[]',
                months TEXT NOT NULL DEFAULT '[]',
                time_of_day TEXT NOT NULL DEFAULT '00:00',
                timezone TEXT NOT NULL DEFAULT 'UTC',
                start_date TEXT NOT NULL,
                end_date TEXT,
                cron_expression TEXT NOT NULL,
                next_run_date TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                execution_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_run_at TEXT,
                last_execution_status TEXT,
                last_error_message TEXT,
                execution_history TEXT NOT NULL DEFAULT '[]',
                retry_on_failure INTEGER NOT NULL DEFAULT 1,
                max_retries INTEGER NOT NULL DEFAULT 1,
                retry_delay_minutes INTEGER NOT NULL DEFAULT 15,
                current_retries INTEGER NOT NULL DEFAULT 0,
                entity_id TEXT,
                action TEXT,
                data TEXT NOT NULL DEFAULT '{}',
                interval INTEGER,
                interval_unit TEXT,
                end_time TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(status, next_run_date);
            CREATE INDEX IF NOT EXISTS idx_schedules_target ON schedules(entity_id, action);
            ",
        )?;

        info!(path = %label, "schedule database initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn select(
        &self,
        where_clause: &'static str,
        args: Vec<String>,
    ) -> Result<Vec<Schedule>, StoreError> {
        blocking(&self.conn, move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SCHEDULE_COLUMNS} FROM schedules {where_clause}"))?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), ScheduleRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(ScheduleRow::decode).collect()
        })
        .await
    }

    async fn write(&self, schedule: &Schedule, verb: &'static str) -> Result<(), StoreError> {
        let schedule = schedule.clone();
        blocking(&self.conn, move |conn| write_row(conn, &schedule, verb)).await
    }
}

fn write_row(conn: &Connection, schedule: &Schedule, verb: &str) -> Result<(), StoreError> {
    let sql = format!(
        "{verb} INTO schedules ({SCHEDULE_COLUMNS}) VALUES \
         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
          ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34)"
    );

    let last_execution_status = schedule
        .last_execution_status
        .as_ref()
        .map(enum_name)
        .transpose()?;
    let interval_unit = schedule.interval_unit.as_ref().map(enum_name).transpose()?;

    conn.execute(
        &sql,
        params![
            schedule.id,
            schedule.tenant_id,
            schedule.title,
            schedule.description,
            schedule.frequency.as_str(),
            serde_json::to_string(&schedule.week_days)?,
            serde_json::to_string(&schedule.month_days)?,
            serde_json::to_string(&schedule.months)?,
            schedule.time_of_day.to_string(),
            schedule.timezone,
            ts(&schedule.start_date),
            schedule.end_date.as_ref().map(ts),
            schedule.cron_expression,
            ts(&schedule.next_run_date),
            schedule.status.as_str(),
            schedule.execution_count,
            schedule.success_count,
            schedule.failure_count,
            schedule.last_run_at.as_ref().map(ts),
            last_execution_status,
            schedule.last_error_message,
            serde_json::to_string(&schedule.execution_history)?,
            schedule.retry_on_failure,
            schedule.max_retries,
            schedule.retry_delay_minutes,
            schedule.current_retries,
            schedule.entity_id,
            schedule.action,
            serde_json::to_string(&schedule.data)?,
            schedule.interval,
            interval_unit,
            schedule.end_time.map(|t| t.to_string()),
            ts(&schedule.created_at),
            ts(&schedule.updated_at),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn insert(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.write(schedule, "INSERT").await
    }

    async fn save(&self, schedule: &Schedule) -> Result<(), StoreError> {
        self.write(schedule, "INSERT OR REPLACE").await
    }

    async fn get(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        let id = id.to_string();
        blocking(&self.conn, move |conn| {
            conn.query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![id],
                ScheduleRow::from_row,
            )
            .optional()?
            .map(ScheduleRow::decode)
            .transpose()
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        blocking(&self.conn, move |conn| {
            let removed = conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn find_active_duplicate(
        &self,
        entity_id: &str,
        action: &str,
        recipient_id: Option<&Value>,
    ) -> Result<Option<Schedule>, StoreError> {
        let candidates = self
            .select(
                "WHERE status = 'ACTIVE' AND entity_id = ?1 AND action = ?2 ORDER BY created_at, id",
                vec![entity_id.to_string(), action.to_string()],
            )
            .await?;
        Ok(candidates
            .into_iter()
            .find(|s| is_duplicate_of(s, entity_id, action, recipient_id)))
    }

    async fn active_since(&self, since: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let mut due = self
            .select(
                "WHERE status = 'ACTIVE' AND next_run_date >= ?1",
                vec![ts(&since)],
            )
            .await?;
        sort_by_time_of_day(&mut due);
        Ok(due)
    }

    async fn active_before(&self, before: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        self.select(
            "WHERE status = 'ACTIVE' AND next_run_date < ?1 ORDER BY next_run_date, id",
            vec![ts(&before)],
        )
        .await
    }

    async fn list(&self) -> Result<Vec<Schedule>, StoreError> {
        self.select("ORDER BY created_at DESC, id", Vec::new()).await
    }
}

/// Tenant directory kept in the platform database.
pub struct SqliteTenantDirectory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTenantDirectory {
    /// Open or create the directory at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                tenant_id TEXT UNIQUE,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Register a business. `tenant_id` may be `None` for businesses that
    /// have not been provisioned a database yet.
    pub fn add(&self, id: &str, name: &str, tenant_id: Option<&str>) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO tenants (id, name, tenant_id) VALUES (?1, ?2, ?3)",
            params![id, name, tenant_id],
        )?;
        Ok(())
    }

    /// Every registered business, including unprovisioned ones.
    pub fn list_all(&self) -> Result<Vec<(String, String, Option<String>)>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT id, name, tenant_id FROM tenants ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl TenantDirectory for SqliteTenantDirectory {
    async fn list_tenants_with_id(&self) -> Result<Vec<TenantRecord>, StoreError> {
        blocking(&self.conn, |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id FROM tenants WHERE tenant_id IS NOT NULL ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(TenantRecord {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutionRecord;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schedule(id: &str, time: &str, next: DateTime<Utc>) -> Schedule {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Schedule {
            id: id.to_string(),
            tenant_id: Some("gym-a".to_string()),
            title: format!("schedule {id}"),
            description: Some("desc".to_string()),
            frequency: Frequency::Weekly,
            week_days: vec![1, 5],
            month_days: vec![],
            months: vec![],
            time_of_day: time.parse().unwrap(),
            timezone: "Europe/Berlin".to_string(),
            start_date: at,
            end_date: Some(at + Duration::days(30)),
            cron_expression: "0 18 * * 1,5".to_string(),
            next_run_date: next,
            status: ScheduleStatus::Active,
            execution_count: 3,
            success_count: 2,
            failure_count: 1,
            last_run_at: Some(at),
            last_execution_status: Some(ExecutionStatus::Failed),
            last_error_message: Some("smtp down".to_string()),
            execution_history: vec![ExecutionRecord {
                executed_at: at,
                status: ExecutionStatus::Failed,
                error_message: Some("smtp down".to_string()),
            }],
            retry_on_failure: true,
            max_retries: 3,
            retry_delay_minutes: 15,
            current_retries: 1,
            entity_id: Some("class-42".to_string()),
            action: Some("send_reminder".to_string()),
            data: json!({"recipientId": "member-7"}),
            interval: Some(2),
            interval_unit: Some(IntervalUnit::Hours),
            end_time: Some(TimeOfDay::new(20, 0).unwrap()),
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_every_field() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let original = schedule("s1", "18:00", Utc.with_ymd_and_hms(2025, 1, 3, 17, 0, 0).unwrap());

        store.insert(&original).await.unwrap();
        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_id_but_save_replaces() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let mut s = schedule("s1", "18:00", Utc::now());
        store.insert(&s).await.unwrap();
        assert!(store.insert(&s).await.is_err());

        s.title = "renamed".to_string();
        store.save(&s).await.unwrap();
        assert_eq!(store.get("s1").await.unwrap().unwrap().title, "renamed");
    }

    #[tokio::test]
    async fn test_active_since_filters_and_orders() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let midnight = Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap();

        store.insert(&schedule("late", "18:00", midnight + Duration::hours(18))).await.unwrap();
        store.insert(&schedule("early", "07:00", midnight + Duration::hours(7))).await.unwrap();
        store.insert(&schedule("past", "06:00", midnight - Duration::hours(18))).await.unwrap();
        let mut done = schedule("done", "05:00", midnight + Duration::hours(5));
        done.status = ScheduleStatus::Completed;
        store.insert(&done).await.unwrap();

        let due: Vec<String> = store
            .active_since(midnight)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(due, vec!["early".to_string(), "late".to_string()]);
    }

    #[tokio::test]
    async fn test_active_before_returns_overdue_oldest_first() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let midnight = Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap();

        store.insert(&schedule("today", "07:00", midnight + Duration::hours(7))).await.unwrap();
        store.insert(&schedule("yesterday", "06:00", midnight - Duration::hours(18))).await.unwrap();
        store.insert(&schedule("last-week", "09:00", midnight - Duration::days(7))).await.unwrap();
        let mut done = schedule("done", "05:00", midnight - Duration::hours(19));
        done.status = ScheduleStatus::Completed;
        store.insert(&done).await.unwrap();

        let overdue: Vec<String> = store
            .active_before(midnight)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(overdue, vec!["last-week".to_string(), "yesterday".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_share_the_connection() {
        let store = Arc::new(SqliteScheduleStore::open_in_memory().unwrap());
        let next = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save(&schedule(&format!("s{i:02}"), "09:00", next)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.list().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_find_active_duplicate_matches_recipient() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        store.insert(&schedule("s1", "18:00", Utc::now())).await.unwrap();

        let found = store
            .find_active_duplicate("class-42", "send_reminder", Some(&json!("member-7")))
            .await
            .unwrap();
        assert_eq!(found.map(|s| s.id), Some("s1".to_string()));

        let other = store
            .find_active_duplicate("class-42", "send_reminder", Some(&json!("member-8")))
            .await
            .unwrap();
        assert!(other.is_none());

        let any = store
            .find_active_duplicate("class-42", "send_reminder", None)
            .await
            .unwrap();
        assert!(any.is_some());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        store.insert(&schedule("s1", "18:00", Utc::now())).await.unwrap();
        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
        assert!(store.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenant.db");
        let s = schedule("s1", "18:00", Utc.with_ymd_and_hms(2025, 1, 3, 17, 0, 0).unwrap());

        {
            let store = SqliteScheduleStore::open(&path).unwrap();
            store.insert(&s).await.unwrap();
        }

        let store = SqliteScheduleStore::open(&path).unwrap();
        assert_eq!(store.list().await.unwrap(), vec![s]);
    }

    #[tokio::test]
    async fn test_directory_lists_only_provisioned_tenants() {
        let directory = SqliteTenantDirectory::open_in_memory().unwrap();
        directory.add("biz-1", "Iron Gym", Some("iron")).unwrap();
        directory.add("biz-2", "Pending Gym", None).unwrap();

        let tenants = directory.list_tenants_with_id().await.unwrap();
        assert_eq!(
            tenants,
            vec![TenantRecord {
                id: "biz-1".to_string(),
                tenant_id: "iron".to_string(),
            }]
        );
        assert_eq!(directory.list_all().unwrap().len(), 2);
    }
}
