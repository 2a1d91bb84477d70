use async_trait::async_trait;
use conduit_core::context;
use conduit_core::tools::{Tool, ToolError, ToolResult};
use conduit_delegate::DelegationClient;
use serde_json::{json, Value};

use super::string_arg;

/// Exposes a remote worker to the engine as `delegate_to_<worker>`.
pub struct DelegateTool {
    name: String,
    description: String,
    client: DelegationClient,
}

impl DelegateTool {
    pub fn new(client: DelegationClient, description: impl Into<String>) -> Self {
        let description = description.into();
        let description = if description.is_empty() {
            format!(
                "Delegates complex tasks to the {}. Use this for specialized processing.",
                client.worker()
            )
        } else {
            description
        };
        Self {
            name: format!("delegate_to_{}", client.worker()),
            description,
            client,
        }
    }

    pub fn client(&self) -> &DelegationClient {
        &self.client
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The request to hand to the specialist, in plain language"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, ToolError> {
        let message = string_arg(&args, "message")?;
        context::check_cancelled()?;
        let result = match self.client.try_delegate(message).await {
            Ok(text) => ToolResult::text(text),
            Err(e) => {
                tracing::error!(worker = %self.client.worker(), error = %e, "delegation failed");
                ToolResult::error(self.client.failure_text(&e))
            }
        };
        context::check_cancelled()?;
        Ok(result)
    }
}
