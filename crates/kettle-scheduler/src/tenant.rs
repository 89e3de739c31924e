//! Tenant context and per-tenant store resolution.
//!
//! A [`TenantContext`] is passed explicitly to everything that touches
//! storage. While a synchronizer iteration or a dispatched job is running, the
//! same context is also bound task-locally so that action handlers can read it
//! with [`TenantContext::current`] without it ever being shared across tasks.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::StoreError;
use crate::store::{MemoryScheduleStore, ScheduleStore, SqliteScheduleStore};

tokio::task_local! {
    static CURRENT_TENANT: TenantContext;
}

/// Which tenant database an operation runs against.
///
/// `tenant_id = None` is the platform-level context owned by the root
/// database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TenantContext {
    tenant_id: Option<String>,
}

impl TenantContext {
    /// The platform-level context.
    pub fn platform() -> Self {
        Self::default()
    }

    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn is_platform(&self) -> bool {
        self.tenant_id.is_none()
    }

    /// Name used in logs and job ids.
    pub fn label(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("platform")
    }

    /// Run `fut` with this context bound for the current task.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT_TENANT.scope(self, fut).await
    }

    /// The context bound by an enclosing [`scope`](Self::scope), if any.
    pub fn current() -> Option<TenantContext> {
        CURRENT_TENANT.try_with(Clone::clone).ok()
    }
}

impl From<Option<String>> for TenantContext {
    fn from(tenant_id: Option<String>) -> Self {
        Self {
            tenant_id: tenant_id.filter(|id| !id.is_empty()),
        }
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A business that has been provisioned its own database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    pub id: String,
    pub tenant_id: String,
}

/// Platform-level directory of tenants.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Every tenant that has a non-null tenant identifier.
    async fn list_tenants_with_id(&self) -> Result<Vec<TenantRecord>, StoreError>;
}

/// In-memory tenant directory.
#[derive(Debug, Default)]
pub struct MemoryTenantDirectory {
    tenants: DashMap<String, TenantRecord>,
}

impl MemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: impl Into<String>, tenant_id: impl Into<String>) {
        let id = id.into();
        self.tenants.insert(
            id.clone(),
            TenantRecord {
                id,
                tenant_id: tenant_id.into(),
            },
        );
    }
}

#[async_trait]
impl TenantDirectory for MemoryTenantDirectory {
    async fn list_tenants_with_id(&self) -> Result<Vec<TenantRecord>, StoreError> {
        let mut tenants: Vec<TenantRecord> =
            self.tenants.iter().map(|t| t.value().clone()).collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }
}

/// Resolves the schedule store for a tenant context.
#[async_trait]
pub trait TenantStores: Send + Sync {
    async fn store_for(&self, ctx: &TenantContext) -> Result<Arc<dyn ScheduleStore>, StoreError>;
}

/// One in-memory store per tenant, created on first use.
#[derive(Debug, Default)]
pub struct MemoryTenantStores {
    stores: DashMap<TenantContext, Arc<MemoryScheduleStore>>,
}

impl MemoryTenantStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete store for `ctx`, for inspection in tests.
    pub fn memory_store(&self, ctx: &TenantContext) -> Arc<MemoryScheduleStore> {
        self.stores.entry(ctx.clone()).or_default().clone()
    }
}

#[async_trait]
impl TenantStores for MemoryTenantStores {
    async fn store_for(&self, ctx: &TenantContext) -> Result<Arc<dyn ScheduleStore>, StoreError> {
        Ok(self.memory_store(ctx))
    }
}

/// SQLite databases under a data directory.
///
/// The platform context lives in `<root>/platform.db`; each tenant in
/// `<root>/tenants/<tenant_id>.db`. Databases are opened lazily and kept open.
pub struct SqliteTenantStores {
    root: PathBuf,
    stores: DashMap<TenantContext, Arc<SqliteScheduleStore>>,
}

impl SqliteTenantStores {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stores: DashMap::new(),
        }
    }

    /// Path of the platform database, which also holds the tenant directory.
    pub fn platform_path(&self) -> PathBuf {
        self.root.join("platform.db")
    }

    /// Database path for `ctx`.
    pub fn path_for(&self, ctx: &TenantContext) -> Result<PathBuf, StoreError> {
        match ctx.tenant_id() {
            None => Ok(self.platform_path()),
            Some(id) if is_safe_file_stem(id) => {
                Ok(self.root.join("tenants").join(format!("{id}.db")))
            }
            Some(id) => Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("tenant id `{id}` is not usable as a database name"),
            ))),
        }
    }

    fn open(&self, ctx: &TenantContext) -> Result<SqliteScheduleStore, StoreError> {
        let path = self.path_for(ctx)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(tenant_id = %ctx, path = %path.display(), "opening tenant database");
        SqliteScheduleStore::open(&path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl TenantStores for SqliteTenantStores {
    async fn store_for(&self, ctx: &TenantContext) -> Result<Arc<dyn ScheduleStore>, StoreError> {
        let store = match self.stores.entry(ctx.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let store = Arc::new(self.open(ctx)?);
                entry.insert(store.clone());
                store
            }
        };
        Ok(store)
    }
}

fn is_safe_file_stem(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scope_binds_context_for_task_only() {
        assert_eq!(TenantContext::current(), None);

        let seen = TenantContext::tenant("iron")
            .scope(async { TenantContext::current() })
            .await;
        assert_eq!(seen, Some(TenantContext::tenant("iron")));

        assert_eq!(TenantContext::current(), None);
    }

    #[tokio::test]
    async fn test_concurrent_scopes_do_not_leak() {
        let a = tokio::spawn(TenantContext::tenant("a").scope(async {
            tokio::task::yield_now().await;
            TenantContext::current()
        }));
        let b = tokio::spawn(TenantContext::tenant("b").scope(async {
            tokio::task::yield_now().await;
            TenantContext::current()
        }));

        assert_eq!(a.await.unwrap(), Some(TenantContext::tenant("a")));
        assert_eq!(b.await.unwrap(), Some(TenantContext::tenant("b")));
    }

    #[test]
    fn test_empty_tenant_id_is_platform() {
        assert!(TenantContext::from(Some(String::new())).is_platform());
        assert_eq!(TenantContext::platform().to_string(), "platform");
    }

    #[tokio::test]
    async fn test_memory_stores_are_isolated() {
        let stores = MemoryTenantStores::new();
        let a = stores.store_for(&TenantContext::tenant("a")).await.unwrap();
        let b = stores.store_for(&TenantContext::tenant("b")).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        let again = stores.store_for(&TenantContext::tenant("a")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[tokio::test]
    async fn test_sqlite_stores_layout() {
        let dir = tempfile::tempdir().unwrap();
        let stores = SqliteTenantStores::new(dir.path());

        stores.store_for(&TenantContext::platform()).await.unwrap();
        stores.store_for(&TenantContext::tenant("iron")).await.unwrap();

        assert!(dir.path().join("platform.db").exists());
        assert!(dir.path().join("tenants").join("iron.db").exists());
    }

    #[tokio::test]
    async fn test_sqlite_stores_reject_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let stores = SqliteTenantStores::new(dir.path());
        assert!(
            stores
                .store_for(&TenantContext::tenant("../escape"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_memory_directory_sorted() {
        let directory = MemoryTenantDirectory::new();
        directory.add("b", "beta");
        directory.add("a", "alpha");
        let ids: Vec<String> = directory
            .list_tenants_with_id()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.tenant_id)
            .collect();
        assert_eq!(ids, vec!["alpha".to_string(), "beta".to_string()]);
    }
}
