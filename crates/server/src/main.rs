use anyhow::Result;
use clap::{Parser, ValueEnum};
use findlib_mcp::transport::StdioTransport;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod session;
mod sink;
mod transport;

use config::{AppState, ServerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Streamable HTTP on /mcp plus SSE on /sse
    Http,
    /// Newline-delimited JSON-RPC on stdin/stdout
    Stdio,
}

#[derive(Parser, Debug)]
#[command(name = "findlib")]
#[command(about = "Locate files by name over the Model Context Protocol", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "findlib.toml")]
    config: PathBuf,

    /// Directory to search [default: current directory]
    #[arg(short, long, env = "FINDLIB_ROOT")]
    root: Option<PathBuf>,

    /// Host to bind to [default: 127.0.0.1]
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on; the next free port is used if taken [default: 58840]
    #[arg(short, long, env = "FINDLIB_PORT")]
    port: Option<u16>,

    /// Transport to serve
    #[arg(short, long, value_enum, default_value_t = TransportKind::Http)]
    transport: TransportKind,
}

impl Args {
    /// Command-line values win over the configuration file
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(root) = &self.root {
            config.search.root = Some(root.clone());
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout belongs to the stdio transport
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "findlib=info,findlib_mcp=info,findlib_core=info,tower_http=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::load(&args.config)?;
    args.apply(&mut config);

    tracing::info!("Starting findlib {}", env!("CARGO_PKG_VERSION"));

    match args.transport {
        TransportKind::Http => api::serve(config).await?,
        TransportKind::Stdio => serve_stdio(&config).await?,
    }

    Ok(())
}

async fn serve_stdio(config: &ServerConfig) -> Result<()> {
    let state = AppState::new(config)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
                shutdown.cancel();
            }
        });
    }

    tracing::info!("Serving on stdio");
    state.mcp.serve(StdioTransport::new(), shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file() {
        let args = Args::parse_from([
            "findlib",
            "--root",
            "/srv/jars",
            "--port",
            "9100",
            "--transport",
            "stdio",
        ]);
        let mut config = ServerConfig::parse("[server]\nhost = \"0.0.0.0\"\nport = 8000").unwrap();
        args.apply(&mut config);

        assert_eq!(args.transport, TransportKind::Stdio);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.search.root, Some(PathBuf::from("/srv/jars")));
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["findlib"]);
        assert_eq!(args.transport, TransportKind::Http);
        assert_eq!(args.config, PathBuf::from("findlib.toml"));
    }
}
