use async_trait::async_trait;
use conduit_core::context;
use conduit_core::tools::{Tool, ToolError, ToolResult};
use serde_json::{json, Value};

use super::string_arg;

pub const REPORT_PROGRESS: &str = "report_progress";

/// Lets a worker's engine narrate what it is doing. Messages reach the
/// client as STATUS lines through the current progress sink.
pub struct ReportProgressTool;

#[async_trait]
impl Tool for ReportProgressTool {
    fn name(&self) -> &str {
        REPORT_PROGRESS
    }

    fn description(&self) -> &str {
        "Report a short progress update to the user while a long task runs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string", "description": "One-line status update"}
            },
            "required": ["message"]
        })
    }

    fn is_user_facing(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, ToolError> {
        let message = string_arg(&args, "message")?;
        context::check_cancelled()?;
        if !context::report_progress(message) {
            tracing::debug!(message, "progress reported outside a streaming request");
        }
        Ok(ToolResult::text("Progress reported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::context::{ProgressSink, RequestContext};
    use conduit_core::ids::SessionId;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn reports_to_current_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&seen);
        let sink = ProgressSink::new(move |m| inner.lock().unwrap().push(m.to_string()));
        let ctx = RequestContext::new(SessionId::new()).with_progress(sink);

        let result = ctx
            .scope(ReportProgressTool.execute(json!({"message": "Analyzing table 3 of 12"})))
            .await
            .unwrap();

        assert!(!result.is_error);
        assert_eq!(*seen.lock().unwrap(), vec!["Analyzing table 3 of 12"]);
    }

    #[tokio::test]
    async fn missing_message_is_invalid() {
        let err = ReportProgressTool.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn not_user_facing() {
        assert!(!ReportProgressTool.is_user_facing());
    }
}
