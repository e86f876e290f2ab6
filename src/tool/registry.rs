//! Name-keyed registry of tool descriptors.

use crate::provider::ToolDefinition;
use crate::tool::types::Tool;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Mapping from tool name to descriptor. Registration is idempotent for the
/// same name (last write wins). Startup registers builtins; the external-tool
/// bridge adds and removes entries while its helper processes live.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().expect("tool registry lock");
        tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.write().expect("tool registry lock").remove(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().expect("tool registry lock").get(name).cloned()
    }

    /// All registered tools, name-sorted.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<dyn Tool>> {
        let tools = self.tools.read().expect("tool registry lock");
        let mut list: Vec<_> = tools.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    /// Schema-only listing, as advertised to the model.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.list()
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Unknown names report as not auto-safe.
    #[must_use]
    pub fn is_auto_safe(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| t.auto_safe())
    }

    /// A new registry restricted to the named tools (for sub-agents).
    #[must_use]
    pub fn subset(&self, names: &[&str]) -> ToolRegistry {
        let subset = ToolRegistry::new();
        for name in names {
            if let Some(tool) = self.get(name) {
                subset.register(tool);
            }
        }
        subset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.read().expect("tool registry lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::types::{ToolContext, ToolError, ToolOutput};
    use async_trait::async_trait;

    struct FakeTool {
        name: &'static str,
        safe: bool,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        fn auto_safe(&self) -> bool {
            self.safe
        }
        async fn execute(
            &self,
            _: serde_json::Value,
            _: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("ok"))
        }
    }

    #[test]
    fn register_is_last_write_wins() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FakeTool {
            name: "read",
            safe: false,
        }));
        registry.register(Arc::new(FakeTool {
            name: "read",
            safe: true,
        }));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_auto_safe("read"));
    }

    #[test]
    fn definitions_are_name_sorted() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FakeTool {
            name: "zeta",
            safe: false,
        }));
        registry.register(Arc::new(FakeTool {
            name: "alpha",
            safe: false,
        }));
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "alpha");
        assert_eq!(defs[1].name, "zeta");
    }

    #[test]
    fn unknown_tool_is_not_auto_safe() {
        let registry = ToolRegistry::new();
        assert!(!registry.is_auto_safe("missing"));
    }

    #[test]
    fn subset_restricts_to_named_tools() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FakeTool {
            name: "read",
            safe: true,
        }));
        registry.register(Arc::new(FakeTool {
            name: "shell",
            safe: false,
        }));
        let subset = registry.subset(&["read", "missing"]);
        assert_eq!(subset.len(), 1);
        assert!(subset.get("read").is_some());
        assert!(subset.get("shell").is_none());
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FakeTool {
            name: "read",
            safe: true,
        }));
        assert!(registry.unregister("read").is_some());
        assert!(registry.get("read").is_none());
        assert!(registry.unregister("read").is_none());
    }
}
