pub mod delegate;
pub mod progress;

pub use delegate::DelegateTool;
pub use progress::ReportProgressTool;

use conduit_core::tools::ToolError;
use serde_json::Value;

/// Required string argument.
pub(crate) fn string_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing string argument `{key}`")))
}
