//! Reasoning engines and the tools they can call.

pub mod engine;
pub mod error;
pub mod history;
pub mod mock;
pub mod registry;
pub mod router;
pub mod tools;

pub use engine::{panic_message, run_tool, EngineEvent, EngineRequest, EngineStream, ReasoningEngine};
pub use error::EngineError;
pub use history::{HistoryEntry, Role, SessionStore};
pub use mock::{ScriptStep, ScriptedEngine};
pub use registry::ToolRegistry;
pub use router::{KeywordRouter, Route};
pub use tools::{DelegateTool, ReportProgressTool};
