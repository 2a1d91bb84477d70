use async_trait::async_trait;
use conduit_core::context;
use serde_json::json;

use crate::engine::{run_tool, EngineEvent, EngineRequest, EngineStream, ReasoningEngine};
use crate::error::EngineError;

/// A tool and the words that select it.
#[derive(Clone, Debug)]
pub struct Route {
    pub tool: String,
    pub keywords: Vec<String>,
}

impl Route {
    pub fn new(tool: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            tool: tool.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    /// Number of keywords present in an already lowercased message.
    fn score(&self, message: &str) -> usize {
        self.keywords
            .iter()
            .filter(|k| !k.is_empty() && message.contains(k.as_str()))
            .count()
    }
}

/// Deterministic engine that forwards the whole message to the single best
/// matching tool. Emits no text of its own, so the stream loop presents the
/// tool result (or the apology when nothing matched).
pub struct KeywordRouter {
    routes: Vec<Route>,
    fallback: Option<String>,
}

impl KeywordRouter {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes,
            fallback: None,
        }
    }

    /// Tool used when no keyword matches.
    pub fn with_fallback(mut self, tool: impl Into<String>) -> Self {
        self.fallback = Some(tool.into());
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Highest scoring tool; earlier routes win ties.
    pub fn select(&self, message: &str) -> Option<&str> {
        let message = message.to_lowercase();
        let mut best: Option<(&Route, usize)> = None;
        for route in &self.routes {
            let score = route.score(&message);
            if score > 0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((route, score));
            }
        }
        best.map(|(route, _)| route.tool.as_str())
            .or(self.fallback.as_deref())
    }
}

#[async_trait]
impl ReasoningEngine for KeywordRouter {
    fn name(&self) -> &str {
        "keyword-router"
    }

    async fn run(&self, request: EngineRequest) -> Result<EngineStream, EngineError> {
        let selected = self
            .select(&request.message)
            .filter(|tool| request.tools.contains(tool))
            .map(str::to_string);

        let Some(tool) = selected else {
            tracing::info!(session_id = %request.session_id, "no route matched");
            return Ok(Box::pin(futures::stream::empty()));
        };
        tracing::info!(session_id = %request.session_id, tool = %tool, "routing request");

        Ok(Box::pin(async_stream::stream! {
            if context::is_cancelled() {
                yield Err(EngineError::Cancelled);
                return;
            }
            let args = json!({ "message": request.message });
            yield Ok(EngineEvent::ToolCall { name: tool.clone(), args: args.clone() });
            match run_tool(&request.tools, &tool, args).await {
                Ok(result) => {
                    yield Ok(EngineEvent::ToolResult { name: tool, result });
                }
                Err(e) => {
                    yield Err(e);
                }
            }
        }))
    }
}
