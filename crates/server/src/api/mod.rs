use crate::config::{AppState, ServerConfig};
use crate::session::SessionStore;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use findlib_mcp::protocol::{JsonRpcError, JsonRpcResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod sse;
mod streamable;

const MAX_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Start the HTTP server and run until Ctrl-C
pub async fn serve(config: ServerConfig) -> Result<()> {
    let state = Arc::new(AppState::new(&config)?);

    let listener = bind_with_retry(
        &config.server.host,
        config.server.port,
        config.server.port_retries,
    )
    .await?;
    let addr = listener.local_addr()?;
    tracing::info!("Streamable HTTP endpoint: http://{}/mcp", addr);
    tracing::info!("SSE endpoint: http://{}/sse", addr);

    let reaper = config
        .idle_timeout()
        .map(|idle| spawn_idle_reaper(state.sessions.clone(), idle));

    let sessions = state.sessions.clone();
    let app = create_router(state);

    // Open event streams only end once their sessions close, so sessions
    // are closed before the server waits for connections to drain.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            tracing::info!("Shutting down");
            sessions.close_all().await;
        })
        .await?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    tracing::info!("Server stopped");
    Ok(())
}

/// Bind `host:port`, moving to the next port while the address is taken
async fn bind_with_retry(host: &str, port: u16, retries: u16) -> Result<TcpListener> {
    let mut port = port;
    let mut attempt = 0;

    loop {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < retries => {
                let next = port
                    .checked_add(1)
                    .with_context(|| format!("No port left above {}", port))?;
                tracing::warn!("Port {} is in use, trying {}", port, next);
                port = next;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to bind {}:{}", host, port));
            }
        }
    }
}

fn spawn_idle_reaper(sessions: SessionStore, idle: Duration) -> JoinHandle<()> {
    let period = idle.min(MAX_REAP_INTERVAL).max(Duration::from_secs(1));
    tracing::info!("Evicting sessions idle for {:?}", idle);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = sessions.evict_idle(idle).await;
            if evicted > 0 {
                tracing::info!("Evicted {} idle sessions", evicted);
            }
        }
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Streamable HTTP
        .route(
            "/mcp",
            post(streamable::handle_post)
                .get(streamable::handle_get)
                .delete(streamable::handle_delete),
        )
        // SSE
        .route("/sse", get(sse::handle_stream))
        .route("/messages", post(sse::handle_message))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "findlib",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.len().await,
    }))
}

/// A JSON-RPC error body with a null id, for rejections that happen
/// before any request is dispatched
pub fn error_response(status: StatusCode, error: JsonRpcError) -> Response {
    (
        status,
        Json(JsonRpcResponse::error(serde_json::Value::Null, error)),
    )
        .into_response()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use findlib_mcp::tools::{Tool, ToolRegistry};
    use findlib_mcp::McpServer;
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// A router searching a temp tree holding `lib/app.jar` and `docs/notes.txt`
    pub fn router() -> (Router, Arc<AppState>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("lib")).unwrap();
        std::fs::create_dir_all(temp_dir.path().join("docs")).unwrap();
        std::fs::write(temp_dir.path().join("lib/app.jar"), b"jar").unwrap();
        std::fs::write(temp_dir.path().join("docs/notes.txt"), b"notes").unwrap();

        let mut config = ServerConfig::default();
        config.search.root = Some(temp_dir.path().to_path_buf());
        let state = Arc::new(AppState::new(&config).unwrap());

        (create_router(state.clone()), state, temp_dir)
    }

    /// A router whose server offers only `tools`, with no search root
    pub fn router_with_tools(tools: Vec<Arc<dyn Tool>>) -> (Router, Arc<AppState>) {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        let state = Arc::new(AppState {
            mcp: McpServer::new(registry),
            sessions: SessionStore::new(),
            sse_heartbeat: ServerConfig::default().sse_heartbeat(),
        });

        (create_router(state.clone()), state)
    }

    pub async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    pub async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    #[tokio::test]
    async fn test_health() {
        let (router, _state, _dir) = router();
        let response = send(
            &router,
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_unsupported_verb() {
        let (router, _state, _dir) = router();
        let response = send(&router, Request::put("/mcp").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_bind_moves_past_taken_port() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        match bind_with_retry("127.0.0.1", port, 5).await {
            Ok(listener) => assert_ne!(listener.local_addr().unwrap().port(), port),
            // Every neighbour was taken too; the retry budget still held
            Err(e) => assert!(format!("{:#}", e).contains("Failed to bind")),
        }

        let err = bind_with_retry("127.0.0.1", port, 0).await.unwrap_err();
        assert!(format!("{:#}", err).contains(&port.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_reaper_evicts() {
        let sessions = SessionStore::new();
        let reaper = spawn_idle_reaper(sessions.clone(), Duration::from_secs(1));

        let session = sessions
            .create(crate::session::SessionAdapter::Streamable(
                crate::transport::StreamableAdapter::new(Duration::from_secs(60)),
            ))
            .await;

        // Idle time is wall-clock; the paused runtime only drives the ticker
        std::thread::sleep(std::time::Duration::from_millis(1100));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(sessions.get(session.id()).await.is_none());
        reaper.abort();
    }
}
