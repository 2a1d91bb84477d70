use std::collections::HashMap;
use std::sync::Arc;

use conduit_core::tools::{display_name_for, Tool, ToolDefinition};

/// Registry of tools available to the reasoning engine.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "replaced existing tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool catalog handed to the engine.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Display name of a tool, falling back to one derived from `name` for
    /// tools that are not registered.
    pub fn display_name(&self, name: &str) -> String {
        self.tools
            .get(name)
            .map(|t| t.display_name())
            .unwrap_or_else(|| display_name_for(name))
    }

    /// Unknown tools count as user-facing.
    pub fn is_user_facing(&self, name: &str) -> bool {
        self.tools.get(name).map_or(true, |t| t.is_user_facing())
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
