//! Settings types. Every struct deserializes with defaults so a partial
//! settings file is always valid.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConduitSettings {
    pub server: ServerSettings,
    pub agent: AgentSettings,
    pub delegation: DelegationSettings,
    pub logging: LoggingSettings,
    pub workers: Vec<WorkerSettings>,
}

impl Default for ConduitSettings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            agent: AgentSettings::default(),
            delegation: DelegationSettings::default(),
            logging: LoggingSettings::default(),
            workers: default_workers(),
        }
    }
}

impl ConduitSettings {
    /// Endpoint for `worker`: its explicit URL, else `<workerBase>:<port>`.
    pub fn endpoint_for(&self, worker: &WorkerSettings) -> String {
        match &worker.url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("{}:{}", self.delegation.worker_base.trim_end_matches('/'), worker.port),
        }
    }
}

/// HTTP listener and stream loop settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    pub port: u16,
    /// Idle time after which a heartbeat is written to the response body.
    pub heartbeat_interval_ms: u64,
    /// Response body chunks buffered before the stream loop waits on the client.
    pub body_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            heartbeat_interval_ms: 1000,
            body_buffer: 32,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Front of house: prompt carries the raw context as JSON.
    #[default]
    Orchestrator,
    /// Specialist: prompt is prefixed with a UI context preamble.
    Worker,
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "orchestrator" | "root" => Ok(Self::Orchestrator),
            "worker" => Ok(Self::Worker),
            other => Err(format!("unknown agent role: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Reported by the health endpoint.
    pub name: String,
    pub role: AgentRole,
    /// Worker used by the keyword router when no keyword matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_worker: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: "root_agent".to_string(),
            role: AgentRole::Orchestrator,
            fallback_worker: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelegationSettings {
    /// Base URL default worker endpoints are derived from.
    pub worker_base: String,
    /// Overall per-call timeout. Absent means wait for the worker indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub connect_timeout_secs: u64,
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self {
            worker_base: "http://localhost".to_string(),
            timeout_secs: None,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// A downstream worker reachable through a delegation tool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    pub name: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub description: String,
    /// Lower-case words that route a request to this worker.
    pub keywords: Vec<String>,
}

impl WorkerSettings {
    fn new(name: &str, port: u16, description: &str, keywords: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            port,
            url: None,
            description: description.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// The stock worker fleet.
pub fn default_workers() -> Vec<WorkerSettings> {
    vec![
        WorkerSettings::new(
            "nl2sql_agent",
            10001,
            "Generates and executes SQL queries from natural language requests.",
            &["sql", "query", "select", "show me", "count", "total", "rows", "transactions"],
        ),
        WorkerSettings::new(
            "object_analysis_agent",
            10002,
            "Deep structural analysis of a specific database object and its dependencies.",
            &["analyze", "analysis", "dependencies", "related", "structure"],
        ),
        WorkerSettings::new(
            "comment_generator_agent",
            10003,
            "Generates database comments and documentation for tables and columns.",
            &["comment", "comments", "document", "documentation"],
        ),
        WorkerSettings::new(
            "schema_analysis_agent",
            10004,
            "High-level functional summary of a database schema.",
            &["schema", "summarize", "summary", "entities"],
        ),
        WorkerSettings::new(
            "erd_agent",
            10005,
            "Generates entity relationship diagrams in draw.io format.",
            &["erd", "diagram", "entity relationship", "draw.io"],
        ),
    ]
}
