use crate::session::SessionStore;
use anyhow::{Context, Result};
use findlib_core::{FileLocator, DEFAULT_MAX_DEPTH};
use findlib_mcp::tools::{register_search_tools, SearchScope, ToolRegistry};
use findlib_mcp::McpServer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// How many higher ports to try when the configured one is taken
    #[serde(default = "default_port_retries")]
    pub port_retries: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search root; the working directory when unset
    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default = "default_follow_links")]
    pub follow_links: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub sse_heartbeat_secs: u64,

    /// Tear down sessions idle for this long. Off when unset.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    58840
}

fn default_port_retries() -> u16 {
    10
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_follow_links() -> bool {
    true
}

fn default_heartbeat_secs() -> u64 {
    60
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            port_retries: default_port_retries(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_depth: default_max_depth(),
            follow_links: default_follow_links(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sse_heartbeat_secs: default_heartbeat_secs(),
            idle_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        if !config_path.exists() {
            tracing::info!("Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(config_path).context("Failed to read configuration file")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    /// Get the search root
    pub fn search_root(&self) -> Result<PathBuf> {
        match &self.search.root {
            Some(root) => Ok(root.clone()),
            None => std::env::current_dir().context("Failed to read current directory"),
        }
    }

    pub fn locator(&self) -> FileLocator {
        FileLocator::new()
            .with_max_depth(self.search.max_depth)
            .with_follow_links(self.search.follow_links)
    }

    pub fn sse_heartbeat(&self) -> Duration {
        Duration::from_secs(self.sessions.sse_heartbeat_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.sessions.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub mcp: McpServer,
    pub sessions: SessionStore,
    pub sse_heartbeat: Duration,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let root = config.search_root()?;
        tracing::info!("Search root: {}", root.display());

        let mut registry = ToolRegistry::new();
        register_search_tools(&mut registry, SearchScope::new(root, config.locator()))
            .context("Failed to register tools")?;
        tracing::info!("Registered {} tools", registry.len());

        Ok(Self {
            mcp: McpServer::new(registry),
            sessions: SessionStore::new(),
            sse_heartbeat: config.sse_heartbeat(),
        })
    }
}
