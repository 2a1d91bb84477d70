//! JSON shapes shared by the HTTP surface and the delegation client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const GENERATE_PATH: &str = "/agent/generate";
pub const HEALTH_PATH: &str = "/agent/health";
pub const SESSION_HEADER: &str = "x-session-id";

/// Body of `POST /agent/generate`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Object or JSON-encoded string; see [`crate::context::UiContext::from_value`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub agent: String,
}

impl HealthResponse {
    pub fn ok(agent: impl Into<String>) -> Self {
        Self {
            status: "ok".into(),
            agent: agent.into(),
        }
    }
}
