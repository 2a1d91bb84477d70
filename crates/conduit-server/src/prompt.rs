use conduit_core::context::UiContext;
use conduit_settings::AgentRole;

/// Fold the UI context into the message the engine sees.
///
/// The orchestrator gets the whole context as JSON with credentials removed.
/// Workers get a short human-readable preamble instead.
pub fn build_prompt(role: AgentRole, message: &str, ui: &UiContext) -> String {
    if ui.is_empty() {
        return message.to_string();
    }
    match role {
        AgentRole::Orchestrator => orchestrator_prompt(message, ui),
        AgentRole::Worker => worker_prompt(message, ui),
    }
}

fn orchestrator_prompt(message: &str, ui: &UiContext) -> String {
    let visible = ui.without_credentials();
    match serde_json::to_string_pretty(&visible) {
        Ok(json) => format!("{message}\n\nContext:\n{json}"),
        Err(e) => {
            tracing::warn!(error = %e, "could not serialize context for prompt");
            message.to_string()
        }
    }
}

fn worker_prompt(message: &str, ui: &UiContext) -> String {
    let mut preamble = String::from("Current UI Context:\n");
    if let Some(endpoint) = ui.endpoint.as_deref().filter(|s| !s.is_empty()) {
        preamble.push_str(&format!("- Database (Endpoint): {endpoint}\n"));
    }
    if let Some(owner) = ui.owner.as_deref().filter(|s| !s.is_empty()) {
        preamble.push_str(&format!("- Schema (Owner): {owner}\n"));
    }
    if let (Some(kind), Some(name)) = (ui.object_type.as_deref(), ui.object_name.as_deref()) {
        preamble.push_str(&format!("- Selected Object: {kind} {name}\n"));
    }
    format!("{preamble}\nUser Request: {message}")
}
