// Standalone MCP server binary (stdio transport)

use anyhow::{Context, Result};
use findlib_core::FileLocator;
use findlib_mcp::tools::{register_search_tools, SearchScope, ToolRegistry};
use findlib_mcp::transport::StdioTransport;
use findlib_mcp::McpServer;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::info!("Findlib MCP Server starting...");

    // Search root (current directory by default)
    let root = match std::env::var_os("FINDLIB_ROOT") {
        Some(root) => PathBuf::from(root),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    tracing::info!("Search root: {}", root.display());

    let mut registry = ToolRegistry::new();
    register_search_tools(&mut registry, SearchScope::new(root, FileLocator::new()))?;
    tracing::info!("Registered {} tools", registry.len());

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let server = McpServer::new(registry);
    server.serve(StdioTransport::new(), shutdown).await?;

    tracing::info!("Stdin closed, shutting down");
    Ok(())
}
