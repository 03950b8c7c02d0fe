// Tool registry: named, schema-validated tool handlers

use crate::error::McpError;
use crate::protocol::{CallToolResult, ToolSchema};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Tool executor trait
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool schema for MCP
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with arguments that already passed schema validation
    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult>;
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    schema: ToolSchema,
    validator: jsonschema::Validator,
}

/// Tool registry for managing available tools.
///
/// Filled once at startup and read-only afterwards; listing order is
/// registration order.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a tool. Names must be unique and the input schema must compile.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let schema = tool.schema();
        if self.by_name.contains_key(&schema.name) {
            return Err(anyhow!("Tool '{}' is already registered", schema.name));
        }

        let validator = jsonschema::validator_for(&schema.input_schema)
            .map_err(|e| anyhow!("Invalid input schema for tool '{}': {}", schema.name, e))?;

        self.by_name.insert(schema.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            tool,
            schema,
            validator,
        });
        Ok(())
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entry(name).map(|entry| entry.tool.clone())
    }

    /// List all tool schemas
    pub fn list_schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|entry| entry.schema.clone()).collect()
    }

    /// Check if a tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check `arguments` against the named tool's input schema
    pub fn validate(&self, name: &str, arguments: &serde_json::Value) -> Result<(), McpError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;

        let problems: Vec<String> = entry
            .validator
            .iter_errors(arguments)
            .map(|e| e.to_string())
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(McpError::InvalidParams(problems.join("; ")))
        }
    }

    /// Validate and run a tool. Handler failures are returned unmodified.
    pub async fn invoke(&self, name: &str, arguments: serde_json::Value) -> Result<CallToolResult> {
        self.validate(name, &arguments)?;
        let tool = self
            .get(name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;
        tool.execute(arguments).await
    }

    fn entry(&self, name: &str) -> Option<&RegisteredTool> {
        self.by_name.get(name).map(|&index| &self.tools[index])
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Helper functions for creating tool schemas

pub fn json_schema_object(properties: serde_json::Value, required: Vec<&str>) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn json_schema_string(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "string",
        "description": description
    })
}
