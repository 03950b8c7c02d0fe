// SSE endpoints: GET /sse opens a session's event stream, POST /messages
// feeds it calls

use super::error_response;
use crate::config::AppState;
use crate::session::{SessionAdapter, SessionStore};
use crate::transport::{SseAdapter, MCP_SESSION_ID};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use findlib_mcp::protocol::JsonRpcPayload;
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::Instrument;

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

fn expired_session() -> Response {
    (StatusCode::BAD_REQUEST, "Invalid or expired sessionId").into_response()
}

/// GET /sse
pub async fn handle_stream(State(state): State<Arc<AppState>>) -> Response {
    let (outbound, mut events) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let (adapter, transport) = SseAdapter::new(outbound);
    let session = state.sessions.create(SessionAdapter::Sse(adapter)).await;
    let session_id = session.id().to_string();
    let closed = session.cancellation();

    let server = state.mcp.clone();
    let span = tracing::info_span!("sse_session", session = %session_id);
    tokio::spawn(
        {
            let closed = closed.clone();
            async move {
                if let Err(e) = server.serve(transport, closed).await {
                    tracing::debug!("Serve loop ended: {}", e);
                }
            }
        }
        .instrument(span),
    );

    let endpoint = format!("/messages?sessionId={}", session_id);
    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint));

        loop {
            let message = tokio::select! {
                _ = closed.cancelled() => None,
                message = events.recv() => message,
            };
            let Some(message) = message else { break };
            yield Ok(Event::default().event("message").data(message));
        }
    };

    let stream = CleanupStream {
        inner: Box::pin(stream),
        sessions: state.sessions.clone(),
        session_id: session_id.clone(),
    };

    let mut response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.sse_heartbeat)
                .text("keep-alive"),
        )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(MCP_SESSION_ID), value);
    }
    response
}

/// POST /messages?sessionId=<id>. The reply travels down the stream.
pub async fn handle_message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query.session_id else {
        return expired_session();
    };
    let Some(session) = state.sessions.get(&session_id).await else {
        tracing::warn!(session = %session_id, "Message for unknown SSE session");
        return expired_session();
    };
    let Some(adapter) = session.sse() else {
        return expired_session();
    };

    let payload = match JsonRpcPayload::parse(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::debug!(session = %session_id, "Rejecting message: {}", err);
            return error_response(StatusCode::BAD_REQUEST, err.to_rpc_error());
        }
    };

    if adapter.deliver(payload).await.is_err() {
        return expired_session();
    }
    (StatusCode::ACCEPTED, "Accepted").into_response()
}

/// Stream wrapper that removes the session when the client disconnects
struct CleanupStream<S> {
    inner: Pin<Box<S>>,
    sessions: SessionStore,
    session_id: String,
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for CleanupStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for CleanupStream<S> {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        // Can't await in Drop
        tokio::spawn(async move {
            sessions.remove(&session_id).await;
        });
    }
}
