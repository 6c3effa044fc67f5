//! Tool registry: the aggregated catalog across live tool servers.
//!
//! Order is significant. Tools appear in server start order, then in the
//! order each server reported them, so the catalog handed to the model is
//! stable between runs.

use std::collections::HashSet;

use super::types::ToolDescriptor;

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Ordered catalog of namespaced tools.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    seen: HashSet<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a server's tools.
    ///
    /// A qualified name that is already registered keeps its first entry.
    pub fn register_server_tools(&mut self, server_name: &str, tools: &[ToolDescriptor]) {
        for tool in tools {
            if !self.seen.insert(tool.qualified_name.clone()) {
                tracing::warn!(
                    server = server_name,
                    tool = %tool.qualified_name,
                    "duplicate tool name, keeping first registration"
                );
                continue;
            }
            self.tools.push(tool.clone());
        }
    }

    pub fn all_tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn into_tools(self) -> Vec<ToolDescriptor> {
        self.tools
    }
}

// ─── Filtering ───────────────────────────────────────────────────────────────

/// Keep tools whose qualified name contains any of the allow-list entries.
///
/// An empty allow-list keeps everything. Order is preserved.
pub fn filter_tools(tools: &[ToolDescriptor], allow: &[String]) -> Vec<ToolDescriptor> {
    if allow.is_empty() {
        return tools.to_vec();
    }
    tools
        .iter()
        .filter(|t| {
            allow
                .iter()
                .any(|pattern| t.qualified_name.contains(pattern.as_str()))
        })
        .cloned()
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::types::McpToolDefinition;
    use super::*;

    fn tool(server: &str, name: &str) -> ToolDescriptor {
        ToolDescriptor::qualify(
            server,
            McpToolDefinition {
                name: name.to_string(),
                description: format!("Test tool: {name}"),
                input_schema: serde_json::json!({"type": "object"}),
            },
        )
    }

    fn sample_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_server_tools("fs", &[tool("fs", "read_file"), tool("fs", "list_dir")]);
        registry.register_server_tools("db", &[tool("db", "query")]);
        registry
    }

    #[test]
    fn test_register_preserves_order() {
        let registry = sample_registry();
        let names: Vec<&str> = registry
            .all_tools()
            .iter()
            .map(|t| t.qualified_name.as_str())
            .collect();
        assert_eq!(names, vec!["fs_read_file", "fs_list_dir", "db_query"]);
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let mut registry = sample_registry();
        let mut dup = tool("fs", "read_file");
        dup.description = "shadow".into();
        registry.register_server_tools("fs", &[dup]);

        let tools = registry.into_tools();
        assert_eq!(tools.len(), 3);
        assert_eq!(tools[0].description, "Test tool: read_file");
    }

    #[test]
    fn test_filter_tools_by_substring() {
        let registry = sample_registry();
        let kept = filter_tools(registry.all_tools(), &["fs_".to_string()]);
        assert_eq!(kept.len(), 2);

        let kept = filter_tools(registry.all_tools(), &["query".into(), "list".into()]);
        let names: Vec<&str> = kept.iter().map(|t| t.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["fs_list_dir", "db_query"]);
    }

    #[test]
    fn test_filter_tools_empty_allow_list_keeps_all() {
        let registry = sample_registry();
        assert_eq!(filter_tools(registry.all_tools(), &[]).len(), 3);
    }
}
