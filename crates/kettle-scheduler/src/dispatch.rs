//! Job dispatcher.
//!
//! Consumes queue jobs of any name, restores the tenant context carried in
//! the payload and hands the job to the registered action handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::queue::{Job, JobQueue, JobState};
use crate::service::{ScheduleService, ScheduleServices};
use crate::tenant::TenantContext;
use crate::{DispatchError, QueueError};

/// Error type returned by action handlers.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler gets besides the payload.
pub struct ActionContext {
    pub tenant: TenantContext,
    /// Lifecycle service bound to the job's tenant, for reporting back.
    pub schedules: ScheduleService,
    pub job_id: String,
    /// Zero-based attempt number.
    pub attempt: u32,
}

/// Business logic invoked by name.
///
/// Handlers that run on behalf of a schedule are responsible for calling
/// `track_execution` and `execute_and_update_next`; the dispatcher does not.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &ActionContext,
        data: Value,
        entity_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<(), ActionError>;
}

/// Name to handler lookup.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// How a job left the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran and succeeded.
    Completed,
    /// No handler for the action; the job was dropped.
    Dropped,
}

/// Wildcard consumer of the execution queue.
pub struct JobDispatcher {
    queue: Arc<dyn JobQueue>,
    registry: Arc<ActionRegistry>,
    services: ScheduleServices,
    concurrency: usize,
}

impl JobDispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<ActionRegistry>,
        services: ScheduleServices,
        concurrency: usize,
    ) -> Self {
        Self {
            queue,
            registry,
            services,
            concurrency: concurrency.max(1),
        }
    }

    /// Run one job's handler inside the job's tenant context.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, action = %job.name))]
    pub async fn dispatch(&self, job: &Job) -> Result<DispatchOutcome, DispatchError> {
        let Value::Object(mut data) = job.payload.clone() else {
            return Err(DispatchError::MalformedPayload(format!(
                "expected object, got {}",
                job.payload
            )));
        };

        let action = string_field(&data, "action").unwrap_or_else(|| job.name.clone());
        let Some(handler) = self.registry.resolve(&action) else {
            warn!(action = %action, "no handler registered for action, dropping job");
            return Ok(DispatchOutcome::Dropped);
        };

        let tenant = TenantContext::from(string_field(&data, "tenantId"));
        let entity_id = string_field(&data, "entityId");
        let user_id = string_field(&data, "userId");
        if let Some(id) = tenant.tenant_id() {
            data.insert("tenantId".to_string(), Value::String(id.to_string()));
        }

        let action_ctx = ActionContext {
            tenant: tenant.clone(),
            schedules: self.services.for_tenant(&tenant).await?,
            job_id: job.id.clone(),
            attempt: job.attempts_made,
        };

        debug!(tenant_id = %tenant, "invoking action handler");
        tenant
            .scope(handler.handle(&action_ctx, Value::Object(data), entity_id, user_id))
            .await
            .map_err(|e| DispatchError::Handler {
                action,
                message: e.to_string(),
            })?;

        Ok(DispatchOutcome::Completed)
    }

    /// Dispatch and report the result to the queue.
    pub async fn process(&self, job: Job) {
        match self.dispatch(&job).await {
            Ok(outcome) => {
                debug!(job_id = %job.id, outcome = ?outcome, "job finished");
                if let Err(e) = self.queue.complete(&job.id).await {
                    warn!(job_id = %job.id, error = %e, "failed to mark job completed");
                }
            }
            Err(e) => match self.queue.fail(&job.id, &e.to_string()).await {
                Ok(JobState::Failed) => {
                    error!(job_id = %job.id, error = %e, "job failed, attempts exhausted");
                }
                Ok(_) => {
                    warn!(job_id = %job.id, error = %e, "job failed, will retry");
                }
                Err(qe) => {
                    warn!(job_id = %job.id, error = %e, queue_error = %qe, "failed to record job failure");
                }
            },
        }
    }

    /// Consume jobs until shutdown or until the queue closes, running up to
    /// `concurrency` at once. In-flight jobs are awaited before returning.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(concurrency = self.concurrency, "job dispatcher starting");
        let permits = Arc::new(Semaphore::new(self.concurrency));

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown_rx.changed() => {
                    // A dropped sender can never signal again; treat it as shutdown.
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let job = tokio::select! {
                job = self.queue.reserve() => job,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match job {
                Ok(job) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.process(job).await;
                        drop(permit);
                    });
                }
                Err(QueueError::Closed) => {
                    info!("queue closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "failed to reserve job");
                }
            }
        }

        let in_flight = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        if permits.acquire_many(in_flight).await.is_ok() {
            debug!("in-flight jobs drained");
        }
        info!("job dispatcher shut down");
    }
}

fn string_field(data: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
