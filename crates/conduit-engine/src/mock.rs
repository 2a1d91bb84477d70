use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::context;
use serde_json::Value;

use crate::engine::{run_tool, EngineEvent, EngineRequest, EngineStream, ReasoningEngine};
use crate::error::EngineError;

/// One step of a pre-programmed run.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Text(String),
    /// Emit the prompt the engine was given, verbatim.
    EchoPrompt,
    CallTool { name: String, args: Value },
    Sleep(Duration),
    /// Fail the run with an internal error.
    Fail(String),
}

impl ScriptStep {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn call(name: &str, args: Value) -> Self {
        Self::CallTool {
            name: name.to_string(),
            args,
        }
    }
}

/// Engine that plays the same script on every run. Tool calls really
/// execute against the request's registry. Used in tests and demos.
pub struct ScriptedEngine {
    script: Arc<Vec<ScriptStep>>,
    start_error: Option<String>,
    runs: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script: Arc::new(script),
            start_error: None,
            runs: AtomicUsize::new(0),
        }
    }

    /// Engine whose `run` itself fails.
    pub fn failing(message: &str) -> Self {
        Self {
            start_error: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, request: EngineRequest) -> Result<EngineStream, EngineError> {
        let _ = self.runs.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = &self.start_error {
            return Err(EngineError::Unavailable(message.clone()));
        }

        let script = Arc::clone(&self.script);
        Ok(Box::pin(async_stream::stream! {
            for step in script.iter() {
                if context::is_cancelled() {
                    yield Err(EngineError::Cancelled);
                    return;
                }
                match step {
                    ScriptStep::Text(text) => {
                        yield Ok(EngineEvent::TextChunk(text.clone()));
                    }
                    ScriptStep::EchoPrompt => {
                        yield Ok(EngineEvent::TextChunk(request.prompt.clone()));
                    }
                    ScriptStep::CallTool { name, args } => {
                        yield Ok(EngineEvent::ToolCall { name: name.clone(), args: args.clone() });
                        match run_tool(&request.tools, name, args.clone()).await {
                            Ok(result) => {
                                yield Ok(EngineEvent::ToolResult { name: name.clone(), result });
                            }
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                    ScriptStep::Sleep(duration) => tokio::time::sleep(*duration).await,
                    ScriptStep::Fail(message) => {
                        yield Err(EngineError::Internal(message.clone()));
                        return;
                    }
                }
            }
        }))
    }
}
