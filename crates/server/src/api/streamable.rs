// Streamable HTTP endpoint: session resolution in front of the adapter

use super::error_response;
use crate::config::AppState;
use crate::session::{Session, SessionAdapter};
use crate::sink::ResponseSink;
use crate::transport::{
    streamable::accepts_event_stream, Handshake, ReplyMode, StreamableAdapter, MCP_SESSION_ID,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use findlib_mcp::protocol::{JsonRpcError, JsonRpcPayload};
use std::sync::Arc;

fn invalid_session() -> Response {
    error_response(StatusCode::BAD_REQUEST, JsonRpcError::invalid_session())
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(MCP_SESSION_ID)
        .map(|value| value.to_str().unwrap_or_default())
}

/// Find the session a request is bound to. Only an `initialize` without a
/// session header may mint a new one; the flag reports whether it did.
async fn resolve_session(
    state: &AppState,
    headers: &HeaderMap,
    payload: &JsonRpcPayload,
) -> Result<(Arc<Session>, bool), Response> {
    match session_header(headers) {
        Some(id) => {
            let session = state
                .sessions
                .get(id)
                .await
                .filter(|session| session.streamable().is_some())
                .ok_or_else(|| {
                    tracing::warn!(session = %id, "Rejecting unknown session");
                    invalid_session()
                })?;

            if payload.contains_initialize() {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    JsonRpcError::invalid_request("Invalid Request: Server already initialized"),
                ));
            }
            Ok((session, false))
        }
        None if payload.contains_initialize() => {
            let adapter = StreamableAdapter::new(state.sse_heartbeat);
            let session = state
                .sessions
                .create(SessionAdapter::Streamable(adapter))
                .await;
            Ok((session, true))
        }
        None => {
            tracing::warn!("Rejecting request without a session");
            Err(invalid_session())
        }
    }
}

/// POST /mcp
pub async fn handle_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = match JsonRpcPayload::parse(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::debug!("Rejecting POST body: {}", err);
            return error_response(StatusCode::BAD_REQUEST, err.to_rpc_error());
        }
    };

    let (session, minted) = match resolve_session(&state, &headers, &payload).await {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };
    let Some(adapter) = session.streamable() else {
        return invalid_session();
    };

    let mode = ReplyMode::from_accept(&headers);
    let turn = adapter.acquire_turn().await;
    let (sink, pending) = ResponseSink::new();
    let server = state.mcp.clone();
    let sessions = state.sessions.clone();

    tokio::spawn(async move {
        let Some(adapter) = session.streamable() else {
            return;
        };
        let handshake = match adapter
            .handle_post(&session, &server, payload, mode, turn, sink)
            .await
        {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::debug!(session = %session.id(), "POST reply interrupted: {:#}", e);
                Handshake::Rejected
            }
        };

        // A session only outlives its first POST if the handshake went through
        if minted && handshake != Handshake::Accepted {
            tracing::debug!(session = %session.id(), "Handshake failed, dropping session");
            sessions.remove(session.id()).await;
        }
    });

    pending.into_response().await
}

/// GET /mcp: the session's push stream
pub async fn handle_get(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !accepts_event_stream(&headers) {
        return error_response(
            StatusCode::NOT_ACCEPTABLE,
            JsonRpcError::custom(
                findlib_mcp::protocol::codes::INVALID_SESSION,
                "Not Acceptable: Client must accept text/event-stream",
            ),
        );
    }

    let session = match session_header(&headers) {
        Some(id) => state.sessions.get(id).await,
        None => None,
    };
    let Some(session) = session.filter(|session| session.streamable().is_some()) else {
        return invalid_session();
    };

    let (sink, pending) = ResponseSink::new();
    tokio::spawn(async move {
        if let Some(adapter) = session.streamable() {
            if let Err(e) = adapter.handle_get(&session, sink).await {
                tracing::debug!(session = %session.id(), "Push stream interrupted: {:#}", e);
            }
        }
    });

    pending.into_response().await
}

/// DELETE /mcp: explicit session close
pub async fn handle_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(id) = session_header(&headers) else {
        return invalid_session();
    };

    let known = state
        .sessions
        .get(id)
        .await
        .is_some_and(|session| session.streamable().is_some());
    if !known || state.sessions.remove(id).await.is_none() {
        return error_response(StatusCode::NOT_FOUND, JsonRpcError::invalid_session());
    }

    StatusCode::OK.into_response()
}
