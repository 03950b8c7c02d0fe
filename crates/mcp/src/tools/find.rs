// File search tools backed by the core file locator

use crate::error::McpError;
use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_object, json_schema_string, Tool, ToolRegistry};
use anyhow::{Context, Result};
use findlib_core::{FileLocator, NamePattern, SearchQuery, SearchResult};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Root directory plus the locator settings every search tool shares
#[derive(Debug, Clone)]
pub struct SearchScope {
    root: PathBuf,
    locator: FileLocator,
}

impl SearchScope {
    pub fn new(root: PathBuf, locator: FileLocator) -> Self {
        Self { root, locator }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Resolve an optional sub-directory against the root. The result must
    /// stay inside the root.
    fn resolve(&self, directory: Option<&str>) -> Result<PathBuf, McpError> {
        let Some(directory) = directory.filter(|d| !d.is_empty()) else {
            return Ok(self.root.clone());
        };

        let candidate = self.root.join(directory);

        // Without a canonical root there is nothing to contain the candidate in
        let root = self.root.canonicalize().map_err(|e| {
            McpError::Internal(format!(
                "Search root {} is not readable: {}",
                self.root.display(),
                e
            ))
        })?;

        // Nonexistent paths are left for the search to report
        if let Ok(canonical) = candidate.canonicalize() {
            if !canonical.starts_with(&root) {
                return Err(McpError::InvalidParams(format!(
                    "directory '{}' is outside the search root",
                    directory
                )));
            }
        }

        Ok(candidate)
    }

    /// Run a search off the async runtime
    async fn run(&self, query: SearchQuery, directory: Option<&str>) -> Result<SearchResult> {
        let root = self.resolve(directory)?;
        let locator = self.locator.clone();

        let result = tokio::task::spawn_blocking(move || locator.search(&query, &root))
            .await
            .context("Search task failed")??;

        Ok(result)
    }
}

fn require_filename(filename: &str) -> Result<(), McpError> {
    if filename.trim().is_empty() {
        return Err(McpError::InvalidParams(
            "Missing 'filename' parameter".to_string(),
        ));
    }
    Ok(())
}

fn parse_args<T: for<'de> Deserialize<'de>>(arguments: serde_json::Value) -> Result<T, McpError> {
    serde_json::from_value(arguments).map_err(|e| McpError::InvalidParams(e.to_string()))
}

fn list_matches(result: &SearchResult, what: &str) -> CallToolResult {
    let text = if result.found {
        let paths: Vec<String> = result
            .matches
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        format!(
            "Found {} match(es) for {} under {}:\n{}",
            paths.len(),
            what,
            result.search_root.display(),
            paths.join("\n")
        )
    } else {
        format!(
            "No files matching {} found under {}",
            what,
            result.search_root.display()
        )
    };

    CallToolResult::text(text).with_structured(result)
}

/// First file with the given name
pub struct FindFileTool {
    scope: SearchScope,
}

impl FindFileTool {
    pub fn new(scope: SearchScope) -> Self {
        Self { scope }
    }
}

#[derive(Debug, Deserialize)]
struct FindFileArgs {
    filename: String,
    #[serde(default)]
    directory: Option<String>,
}

#[async_trait::async_trait]
impl Tool for FindFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "find_file".to_string(),
            description: "Find the first occurrence of a file by name in the directory tree"
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "filename": json_schema_string("The name of the file to search for"),
                    "directory": json_schema_string("Sub-directory to search, relative to the search root")
                }),
                vec!["filename"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: FindFileArgs = parse_args(arguments)?;
        require_filename(&args.filename)?;

        let result = self
            .scope
            .run(SearchQuery::first(&args.filename), args.directory.as_deref())
            .await?;

        let text = match result.first() {
            Some(path) => format!("Found: {}", path.display()),
            None => format!("File '{}' not found", args.filename),
        };

        Ok(CallToolResult::text(text).with_structured(&result))
    }
}

/// Every file with the given name, optionally widened by a name pattern
pub struct FindAllFilesTool {
    scope: SearchScope,
}

impl FindAllFilesTool {
    pub fn new(scope: SearchScope) -> Self {
        Self { scope }
    }
}

#[derive(Debug, Deserialize)]
struct FindAllFilesArgs {
    filename: String,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    directory: Option<String>,
}

#[async_trait::async_trait]
impl Tool for FindAllFilesTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "find_all_files".to_string(),
            description: "Find every file with the given name, in traversal order. \
                          An optional pattern such as '*.jar' also matches by suffix."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "filename": json_schema_string("The name of the file to search for"),
                    "pattern": json_schema_string("Additional name pattern: '*suffix', 'prefix*' or an exact name"),
                    "directory": json_schema_string("Sub-directory to search, relative to the search root")
                }),
                vec!["filename"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: FindAllFilesArgs = parse_args(arguments)?;
        require_filename(&args.filename)?;

        let mut query = SearchQuery::all(&args.filename);
        let mut what = format!("'{}'", args.filename);
        if let Some(pattern) = args.pattern.as_deref().filter(|p| !p.is_empty()) {
            query = query.with_pattern(NamePattern::parse(pattern));
            what = format!("{} or '{}'", what, pattern);
        }

        let result = self.scope.run(query, args.directory.as_deref()).await?;
        Ok(list_matches(&result, &what))
    }
}

/// Every `.jar` file, optionally narrowed to one file name
pub struct FindJarTool {
    scope: SearchScope,
}

impl FindJarTool {
    pub fn new(scope: SearchScope) -> Self {
        Self { scope }
    }
}

#[derive(Debug, Deserialize)]
struct FindJarArgs {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    directory: Option<String>,
}

#[async_trait::async_trait]
impl Tool for FindJarTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "find_jar".to_string(),
            description: "Find every .jar file in the directory tree, optionally only those with a given name"
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "filename": json_schema_string("Only report jars with exactly this name"),
                    "directory": json_schema_string("Sub-directory to search, relative to the search root")
                }),
                vec![],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: FindJarArgs = parse_args(arguments)?;

        let mut query = SearchQuery::matching(NamePattern::parse("*.jar"));
        let mut what = "'*.jar'".to_string();
        if let Some(filename) = args.filename.as_deref().filter(|f| !f.is_empty()) {
            query = query.with_name_filter(filename);
            what = format!("'{}'", filename);
        }

        let result = self.scope.run(query, args.directory.as_deref()).await?;
        Ok(list_matches(&result, &what))
    }
}

/// Register every search tool against one scope
pub fn register_search_tools(registry: &mut ToolRegistry, scope: SearchScope) -> Result<()> {
    registry.register(Arc::new(FindFileTool::new(scope.clone())))?;
    registry.register(Arc::new(FindAllFilesTool::new(scope.clone())))?;
    registry.register(Arc::new(FindJarTool::new(scope)))?;
    Ok(())
}
