//! Kettle: recurring schedule engine
//!
//! Main binary with subcommands:
//! - `daemon`: Daily synchronizer and job dispatcher
//! - `tenant`: Manage the tenant directory
//! - `schedule`: Create and inspect schedules

use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kettle_scheduler::TimeOfDay;

mod actions;
mod commands;
mod daemon;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

fn parse_tz(s: &str) -> Result<Tz, String> {
    kettle_scheduler::cron::parse_timezone(s).map_err(|e| e.to_string())
}

fn parse_time_of_day(s: &str) -> Result<TimeOfDay, String> {
    s.parse().map_err(|e: kettle_scheduler::RecurrenceError| e.to_string())
}

#[derive(Parser)]
#[command(name = "kettle")]
#[command(about = "Recurring schedule engine", long_about = None)]
struct Cli {
    /// Directory holding platform.db and the per-tenant databases
    #[arg(long, env = "KETTLE_DATA_DIR", default_value = daemon::DEFAULT_DATA_DIR, global = true)]
    data_dir: PathBuf,

    /// Operating timezone that defines "today"
    #[arg(long, env = "KETTLE_TIMEZONE", default_value = "UTC", value_parser = parse_tz, global = true)]
    timezone: Tz,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the synchronizer and dispatcher until interrupted
    Daemon {
        /// Daily synchronization time (HH:MM, operating timezone)
        #[arg(long, env = "KETTLE_SYNC_AT", default_value = "00:00", value_parser = parse_time_of_day)]
        sync_at: TimeOfDay,

        /// Number of jobs dispatched concurrently
        #[arg(long, env = "KETTLE_CONCURRENCY", default_value_t = daemon::DEFAULT_CONCURRENCY)]
        concurrency: usize,

        /// Bound on each queue call during cleanup, in seconds
        #[arg(long, env = "KETTLE_CLEANUP_TIMEOUT_SECS", default_value_t = daemon::DEFAULT_CLEANUP_TIMEOUT_SECS)]
        cleanup_timeout_secs: u64,

        /// Log as JSON lines instead of human-readable text.
        /// Accepts "1", "true", "yes", or "on".
        #[arg(long, env = "KETTLE_LOG_JSON", value_parser = parse_bool_env, default_value = "false")]
        log_json: bool,
    },

    /// Manage the tenant directory
    Tenant {
        #[command(subcommand)]
        command: TenantCommand,
    },

    /// Create and inspect schedules
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
}

#[derive(Subcommand)]
enum TenantCommand {
    /// Register a business
    Add {
        /// Business id
        id: String,

        /// Display name
        name: String,

        /// Tenant id; businesses without one are skipped by synchronization
        #[arg(long)]
        tenant_id: Option<String>,
    },

    /// List registered businesses
    List,
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Create a schedule from a JSON definition
    Create {
        /// Tenant id (platform when omitted)
        #[arg(long)]
        tenant: Option<String>,

        /// JSON file with the definition (stdin when omitted)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Timezone used when the definition names none
        #[arg(long)]
        caller_timezone: Option<String>,
    },

    /// Show a schedule
    Show {
        /// Tenant id (platform when omitted)
        #[arg(long)]
        tenant: Option<String>,

        /// Schedule id
        id: String,
    },

    /// List schedules considered by today's synchronization
    Due {
        /// Tenant id (platform when omitted)
        #[arg(long)]
        tenant: Option<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "kettle=info,kettle_scheduler=info".to_string()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_json = matches!(cli.command, Commands::Daemon { log_json: true, .. });
    init_tracing(log_json);

    match cli.command {
        Commands::Daemon {
            sync_at,
            concurrency,
            cleanup_timeout_secs,
            log_json: _,
        } => {
            daemon::run(daemon::DaemonConfig {
                data_dir: cli.data_dir,
                timezone: cli.timezone,
                sync_at,
                concurrency,
                cleanup_timeout: Duration::from_secs(cleanup_timeout_secs),
            })
            .await
        }
        Commands::Tenant { command } => match command {
            TenantCommand::Add {
                id,
                name,
                tenant_id,
            } => commands::tenant_add(&cli.data_dir, &id, &name, tenant_id.as_deref()),
            TenantCommand::List => commands::tenant_list(&cli.data_dir),
        },
        Commands::Schedule { command } => match command {
            ScheduleCommand::Create {
                tenant,
                file,
                caller_timezone,
            } => {
                commands::schedule_create(&cli.data_dir, cli.timezone, tenant, file, caller_timezone)
                    .await
            }
            ScheduleCommand::Show { tenant, id } => {
                commands::schedule_show(&cli.data_dir, cli.timezone, tenant, &id).await
            }
            ScheduleCommand::Due { tenant } => {
                commands::schedule_due(&cli.data_dir, cli.timezone, tenant).await
            }
        },
    }
}
