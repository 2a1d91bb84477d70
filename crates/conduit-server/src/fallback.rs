//! Text emitted when the engine finishes without producing any of its own.

use conduit_core::markers::{contains_error_marker, strip_error_markers};

pub const APOLOGY: &str =
    "I'm sorry, I wasn't able to produce a response for that request. Please try again or rephrase your question.";

/// The last user-facing tool result seen during a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastToolResult {
    /// Display name of the tool, e.g. `Nl2sql Agent`.
    pub display_name: String,
    pub content: String,
}

/// Build the stand-in response for a run that produced no text.
pub fn synthesize(last: Option<&LastToolResult>) -> String {
    match last {
        Some(result) if contains_error_marker(&result.content) => format!(
            "### Error from {}\n\n{}",
            result.display_name,
            strip_error_markers(&result.content).trim()
        ),
        Some(result) => format!("### Result from {}\n\n{}", result.display_name, result.content),
        None => APOLOGY.to_string(),
    }
}
