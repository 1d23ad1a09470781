//! Demo payloads and handlers.

use std::time::Duration;

use actors::{HandlerError, JobContext, JobHandler, JobHandlerRegistry, JobPayload, ValueJobHandler};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl JobPayload for Echo {
    const PAYLOAD_TYPE: &'static str = "demo.Echo";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sleep {
    #[serde(default = "default_seconds")]
    pub seconds: u64,
}

fn default_seconds() -> u64 {
    5
}

impl JobPayload for Sleep {
    const PAYLOAD_TYPE: &'static str = "demo.Sleep";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail {
    #[serde(default = "default_fail")]
    pub fail: bool,
}

fn default_fail() -> bool {
    true
}

impl JobPayload for Fail {
    const PAYLOAD_TYPE: &'static str = "demo.Fail";
}

#[derive(Debug, Serialize)]
struct SleepProgress {
    elapsed: u64,
    total: u64,
}

/// Returns the message after a short pause.
pub struct EchoHandler;

impl ValueJobHandler<Echo> for EchoHandler {
    type Output = String;

    async fn handle(&self, payload: Echo, ctx: JobContext) -> Result<String, HandlerError> {
        tracing::info!(job_id = %ctx.job_id(), message = %payload.message, "Echo job");
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(payload.message)
    }
}

/// Sleeps one second at a time, reporting progress and honoring stop requests.
pub struct SleepHandler;

impl JobHandler<Sleep> for SleepHandler {
    async fn handle(&self, payload: Sleep, ctx: JobContext) -> Result<(), HandlerError> {
        tracing::info!(job_id = %ctx.job_id(), seconds = payload.seconds, "Sleep job");
        for elapsed in 1..=payload.seconds {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = ctx.cancelled() => return Err(HandlerError::Cancelled),
            }
            ctx.set_data(&SleepProgress {
                elapsed,
                total: payload.seconds,
            })
            .await?;
        }
        Ok(())
    }
}

/// Fails unless asked not to.
pub struct FailHandler;

impl JobHandler<Fail> for FailHandler {
    async fn handle(&self, payload: Fail, _ctx: JobContext) -> Result<(), HandlerError> {
        if payload.fail {
            Err(HandlerError::msg("Intentional failure"))
        } else {
            Ok(())
        }
    }
}

/// Registry with every demo handler.
pub fn demo_registry() -> JobHandlerRegistry {
    let handlers = JobHandlerRegistry::new();
    handlers.register_value::<Echo, _>(EchoHandler);
    handlers.register::<Sleep, _>(SleepHandler);
    handlers.register::<Fail, _>(FailHandler);
    handlers
}
