use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use conduit_core::context;
use conduit_core::ids::SessionId;
use conduit_core::markers::{self, MarkerKind};
use conduit_core::tools::{ToolError, ToolResult};
use futures::{FutureExt, Stream};
use serde_json::Value;

use crate::error::EngineError;
use crate::history::HistoryEntry;
use crate::registry::ToolRegistry;

/// What a reasoning engine reports while it runs.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    TextChunk(String),
    ToolCall { name: String, args: Value },
    ToolResult { name: String, result: ToolResult },
}

/// Everything an engine gets for one run.
#[derive(Clone)]
pub struct EngineRequest {
    pub session_id: SessionId,
    /// The user's message as sent.
    pub message: String,
    /// Message with UI context folded in, as the model should see it.
    pub prompt: String,
    pub history: Vec<HistoryEntry>,
    pub tools: Arc<ToolRegistry>,
}

pub type EngineStream = Pin<Box<dyn Stream<Item = Result<EngineEvent, EngineError>> + Send>>;

/// Opaque decision maker: consumes a prompt and a tool catalog, emits text
/// and tool activity. Tools run inside the stream, so they observe the
/// request context of whoever polls it.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: EngineRequest) -> Result<EngineStream, EngineError>;
}

/// Execute one tool call on behalf of an engine. Tool failures and panics come
/// back as error results; only cancellation aborts the run.
pub async fn run_tool(tools: &ToolRegistry, name: &str, args: Value) -> Result<ToolResult, EngineError> {
    context::check_cancelled()?;

    let Some(tool) = tools.get(name) else {
        tracing::warn!(tool = %name, "engine requested unknown tool");
        return Ok(ToolResult::error(format!("Error: unknown tool {name}")));
    };

    let start = Instant::now();
    let result = AssertUnwindSafe(tool.execute(args)).catch_unwind().await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let result = match result {
        Ok(result) => result,
        Err(panic) => {
            tracing::error!(tool = %name, elapsed_ms, panic = %panic_message(&*panic), "tool panicked during execution");
            let text = markers::encode(MarkerKind::Error, "Internal error: tool crashed");
            return Ok(ToolResult::error(text.trim_end()));
        }
    };

    match result {
        Ok(result) => {
            tracing::info!(tool = %name, elapsed_ms, is_error = result.is_error, "tool finished");
            Ok(result)
        }
        Err(ToolError::Cancelled) => Err(EngineError::Cancelled),
        Err(e) => {
            tracing::warn!(tool = %name, elapsed_ms, error = %e, "tool failed");
            Ok(ToolResult::error(format!("Error: {e}")))
        }
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::cancel::CancelFlag;
    use conduit_core::context::RequestContext;
    use conduit_core::tools::Tool;
    use serde_json::json;

    struct Flaky;

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails on demand"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: Value) -> Result<ToolResult, ToolError> {
            match args["mode"].as_str() {
                Some("fail") => Err(ToolError::ExecutionFailed("no credentials".into())),
                Some("cancel") => Err(ToolError::Cancelled),
                Some("panic") => panic!("flaky blew up"),
                _ => Ok(ToolResult::text("fine")),
            }
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(Arc::new(Flaky));
        r
    }

    #[tokio::test]
    async fn tool_failure_becomes_error_result() {
        let result = run_tool(&registry(), "flaky", json!({"mode": "fail"})).await.unwrap();
        assert_eq!(result, ToolResult::error("Error: execution failed: no credentials"));
    }

    #[tokio::test]
    async fn tool_panic_becomes_error_result() {
        let result = run_tool(&registry(), "flaky", json!({"mode": "panic"})).await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.content, "\u{258C}ERROR: Internal error: tool crashed");
    }

    #[test]
    fn panic_message_reads_both_payload_kinds() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*owned), "owned");
        assert_eq!(panic_message(&*borrowed), "borrowed");
        assert_eq!(panic_message(&*other), "unknown panic");
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let result = run_tool(&registry(), "nope", json!({})).await.unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn cancellation_aborts() {
        let err = run_tool(&registry(), "flaky", json!({"mode": "cancel"})).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));

        let flag = CancelFlag::new();
        flag.cancel();
        let ctx = RequestContext::new(SessionId::new()).with_cancel_flag(flag);
        let err = ctx.scope(async { run_tool(&registry(), "flaky", json!({})).await }).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
