//! Built-in actions available to schedules.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use kettle_scheduler::{ActionContext, ActionError, ActionHandler, ActionRegistry, ScheduleError};

/// Name under which [`LogAction`] is registered.
pub const LOG_ACTION: &str = "log";

#[derive(Debug, thiserror::Error)]
enum LogActionError {
    #[error("payload has no scheduleId")]
    MissingScheduleId,

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Logs the payload, then reports back to the originating schedule.
pub struct LogAction;

#[async_trait]
impl ActionHandler for LogAction {
    async fn handle(
        &self,
        ctx: &ActionContext,
        data: Value,
        entity_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<(), ActionError> {
        info!(
            tenant_id = %ctx.tenant,
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            entity_id = entity_id.as_deref().unwrap_or(""),
            user_id = user_id.as_deref().unwrap_or(""),
            data = %data,
            "scheduled action fired"
        );

        report(ctx, &data).await?;
        Ok(())
    }
}

async fn report(ctx: &ActionContext, data: &Value) -> Result<(), LogActionError> {
    let schedule_id = data
        .get("scheduleId")
        .and_then(Value::as_str)
        .ok_or(LogActionError::MissingScheduleId)?;

    ctx.schedules
        .track_execution(schedule_id, true, None)
        .await?;
    ctx.schedules.execute_and_update_next(schedule_id).await?;
    Ok(())
}

/// Registry with every built-in action.
pub fn registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register(LOG_ACTION, Arc::new(LogAction));
    registry
}
