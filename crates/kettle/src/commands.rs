//! One-shot tenant and schedule commands against the data directory.
//!
//! These open the same SQLite files as the daemon but install no arming hook:
//! a schedule created here is armed by the daemon's next synchronization,
//! which first moves any run missed in the meantime onto the current day.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono_tz::Tz;
use miette::Result;
use serde::Serialize;

use kettle_scheduler::store::SqliteTenantDirectory;
use kettle_scheduler::tenant::SqliteTenantStores;
use kettle_scheduler::{NewSchedule, ScheduleService, ScheduleServices, SystemClock, TenantContext};

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct TenantRow {
    id: String,
    name: String,
    tenant_id: Option<String>,
}

fn open_directory(data_dir: &Path) -> Result<SqliteTenantDirectory> {
    std::fs::create_dir_all(data_dir).map_err(|e| {
        miette::miette!(
            "failed to create data directory {}: {}",
            data_dir.display(),
            e
        )
    })?;
    SqliteTenantDirectory::open(SqliteTenantStores::new(data_dir).platform_path())
        .map_err(|e| miette::miette!("failed to open tenant directory: {}", e))
}

async fn open_service(data_dir: &Path, tenant: Option<String>, zone: Tz) -> Result<ScheduleService> {
    let services = ScheduleServices::new(
        Arc::new(SqliteTenantStores::new(data_dir)),
        Arc::new(SystemClock),
        zone,
    );
    services
        .for_tenant(&TenantContext::from(tenant))
        .await
        .map_err(|e| miette::miette!("failed to open schedule database: {}", e))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| miette::miette!("failed to render output: {}", e))?;
    println!("{rendered}");
    Ok(())
}

/// Register a business in the tenant directory.
pub fn tenant_add(data_dir: &Path, id: &str, name: &str, tenant_id: Option<&str>) -> Result<()> {
    open_directory(data_dir)?
        .add(id, name, tenant_id)
        .map_err(|e| miette::miette!("failed to add tenant {}: {}", id, e))?;
    tracing::info!(id, tenant_id = tenant_id.unwrap_or(""), "tenant added");
    Ok(())
}

/// Print every business in the directory.
pub fn tenant_list(data_dir: &Path) -> Result<()> {
    let rows: Vec<TenantRow> = open_directory(data_dir)?
        .list_all()
        .map_err(|e| miette::miette!("failed to list tenants: {}", e))?
        .into_iter()
        .map(|(id, name, tenant_id)| TenantRow {
            id,
            name,
            tenant_id,
        })
        .collect();
    print_json(&rows)
}

/// Read a schedule definition from `file`, or stdin when absent.
fn read_definition(file: Option<&Path>) -> Result<NewSchedule> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| miette::miette!("failed to read stdin: {}", e))?;
            buf
        }
    };
    parse_definition(&raw)
}

fn parse_definition(raw: &str) -> Result<NewSchedule> {
    serde_json::from_str(raw).map_err(|e| miette::miette!("invalid schedule definition: {}", e))
}

/// Create a schedule and print the stored record.
pub async fn schedule_create(
    data_dir: &Path,
    zone: Tz,
    tenant: Option<String>,
    file: Option<PathBuf>,
    timezone: Option<String>,
) -> Result<()> {
    let input = read_definition(file.as_deref())?;
    let service = open_service(data_dir, tenant, zone).await?;
    let schedule = service
        .create(input, timezone.as_deref())
        .await
        .map_err(|e| miette::miette!("failed to create schedule: {}", e))?;
    print_json(&schedule)
}

/// Print one schedule.
pub async fn schedule_show(data_dir: &Path, zone: Tz, tenant: Option<String>, id: &str) -> Result<()> {
    let service = open_service(data_dir, tenant, zone).await?;
    let schedule = service
        .get(id)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&schedule)
}

/// Print the schedules that would be considered by today's synchronization.
pub async fn schedule_due(data_dir: &Path, zone: Tz, tenant: Option<String>) -> Result<()> {
    let service = open_service(data_dir, tenant, zone).await?;
    let due = service
        .due_today()
        .await
        .map_err(|e| miette::miette!("failed to load due schedules: {}", e))?;
    print_json(&due)
}
