// Streamable HTTP binding. Each POST carries calls and gets their
// responses back on the same request, either as one JSON body or as a
// short event stream. A GET opens the session's push channel.

use crate::session::Session;
use crate::sink::ResponseSink;
use anyhow::Result;
use axum::http::{
    header::{self, HeaderName},
    HeaderMap, StatusCode,
};
use findlib_mcp::protocol::{codes, JsonRpcError, JsonRpcPayload, JsonRpcResponse};
use findlib_mcp::{McpServer, Notifier, RequestContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

pub const MCP_SESSION_ID: &str = "mcp-session-id";

const EVENT_STREAM: &str = "text/event-stream";
const PUSH_BUFFER: usize = 100;

/// How a POST wants its responses delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Json,
    Stream,
}

impl ReplyMode {
    /// Stream only when the client accepts event streams and not JSON
    pub fn from_accept(headers: &HeaderMap) -> Self {
        let accept = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");

        let accepts = |wanted: &str| {
            accept
                .split(',')
                .map(|part| part.split(';').next().unwrap_or_default().trim())
                .any(|media| media == wanted)
        };

        let json = accepts("application/json") || accepts("application/*") || accepts("*/*");
        if accepts(EVENT_STREAM) && !json {
            Self::Stream
        } else {
            Self::Json
        }
    }
}

/// Whether the client's Accept header allows an event stream at all
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(EVENT_STREAM))
}

/// What became of the `initialize` a POST carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// The POST held no handshake
    NotAttempted,
    Accepted,
    /// Failed, cancelled, or never answered
    Rejected,
}

pub struct StreamableAdapter {
    turn: Arc<Mutex<()>>,
    push: broadcast::Sender<String>,
    stream_open: AtomicBool,
    heartbeat: Duration,
}

/// Clears the open-stream flag when the GET stream ends
struct OpenStream<'a>(&'a AtomicBool);

impl Drop for OpenStream<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl StreamableAdapter {
    pub fn new(heartbeat: Duration) -> Self {
        let (push, _) = broadcast::channel(PUSH_BUFFER);
        Self {
            turn: Arc::new(Mutex::new(())),
            push,
            stream_open: AtomicBool::new(false),
            heartbeat,
        }
    }

    /// Wait for this session's next turn. The lock is fair, so POSTs are
    /// answered in the order they were accepted.
    pub async fn acquire_turn(&self) -> OwnedMutexGuard<()> {
        self.turn.clone().lock_owned().await
    }

    pub fn has_open_stream(&self) -> bool {
        self.stream_open.load(Ordering::SeqCst)
    }

    /// Notifications for the session's GET stream. Dropped when no
    /// stream is open.
    pub fn notifier(&self) -> Notifier {
        let push = self.push.clone();
        Notifier::new(move |notification| {
            if let Ok(json) = serde_json::to_string(&notification) {
                let _ = push.send(json);
            }
        })
    }

    /// Answer one POST. `turn` is held until the reply is complete. A frame
    /// carrying `initialize` only gets the session header once the
    /// handshake succeeded.
    pub async fn handle_post(
        &self,
        session: &Session,
        server: &McpServer,
        payload: JsonRpcPayload,
        mode: ReplyMode,
        turn: OwnedMutexGuard<()>,
        mut sink: ResponseSink,
    ) -> Result<Handshake> {
        let _turn = turn;
        let initialize_id = payload.initialize_id().cloned();
        if initialize_id.is_none() {
            sink.set_header(HeaderName::from_static(MCP_SESSION_ID), session.id())?;
        }

        if !payload.has_requests() {
            let ctx = RequestContext::new()
                .with_session(session.id())
                .with_notifier(self.notifier());
            server.handle_payload(payload, &ctx).await;
            sink.status(StatusCode::ACCEPTED);
            sink.end(None).await?;
            return Ok(Handshake::NotAttempted);
        }

        // Cancelled by session teardown or by the client hanging up
        let call = session.cancellation().child_token();
        {
            let call = call.clone();
            sink.on_abort(move || call.cancel());
        }

        let outcome = |reply: Option<&JsonRpcPayload>| match &initialize_id {
            None => Handshake::NotAttempted,
            Some(id) if reply.is_some_and(|reply| reply.succeeds(id)) => Handshake::Accepted,
            Some(_) => Handshake::Rejected,
        };
        let cancelled = if initialize_id.is_some() {
            Handshake::Rejected
        } else {
            Handshake::NotAttempted
        };

        let handshake = match mode {
            ReplyMode::Json => {
                let ctx = RequestContext::new()
                    .with_session(session.id())
                    .with_notifier(self.notifier());

                let reply = tokio::select! {
                    biased;
                    _ = call.cancelled() => {
                        finish_cancelled(session, sink).await?;
                        return Ok(cancelled);
                    }
                    reply = server.handle_payload(payload, &ctx) => reply,
                };

                let handshake = outcome(reply.as_ref());
                if handshake == Handshake::Accepted {
                    sink.set_header(HeaderName::from_static(MCP_SESSION_ID), session.id())?;
                }
                match reply {
                    Some(reply) => {
                        sink.set_header(header::CONTENT_TYPE, "application/json")?;
                        sink.end(Some(serde_json::to_vec(&reply)?.into())).await?;
                    }
                    None => {
                        sink.status(StatusCode::ACCEPTED);
                        sink.end(None).await?;
                    }
                }
                handshake
            }
            ReplyMode::Stream => {
                sink.set_header(header::CONTENT_TYPE, EVENT_STREAM)?;
                sink.set_header(header::CACHE_CONTROL, "no-cache")?;

                let (notifier, mut notifications) = Notifier::channel();
                let ctx = RequestContext::new()
                    .with_session(session.id())
                    .with_notifier(notifier);

                // Headers go out with the first event, so a handshake holds
                // its events back until the outcome is known
                let live = initialize_id.is_none();
                let handling = server.handle_payload(payload, &ctx);
                tokio::pin!(handling);

                let reply = loop {
                    tokio::select! {
                        biased;
                        _ = call.cancelled() => {
                            finish_cancelled(session, sink).await?;
                            return Ok(cancelled);
                        }
                        Some(notification) = notifications.recv(), if live => {
                            write_event(&mut sink, &notification.into()).await?;
                        }
                        reply = &mut handling => break reply,
                    }
                };

                let handshake = outcome(reply.as_ref());
                if handshake == Handshake::Accepted {
                    sink.set_header(HeaderName::from_static(MCP_SESSION_ID), session.id())?;
                }
                while let Ok(notification) = notifications.try_recv() {
                    write_event(&mut sink, &notification.into()).await?;
                }
                if let Some(reply) = reply {
                    write_event(&mut sink, &reply).await?;
                }
                sink.end(None).await?;
                handshake
            }
        };

        tracing::debug!(session = %session.id(), "POST answered");
        Ok(handshake)
    }

    /// Serve the session's push stream until the client leaves or the
    /// session closes
    pub async fn handle_get(&self, session: &Session, mut sink: ResponseSink) -> Result<()> {
        if self.stream_open.swap(true, Ordering::SeqCst) {
            sink.status(StatusCode::CONFLICT);
            sink.set_header(header::CONTENT_TYPE, "application/json")?;
            let body = JsonRpcResponse::error(
                serde_json::Value::Null,
                JsonRpcError::custom(
                    codes::INVALID_SESSION,
                    "Conflict: Only one SSE stream is allowed per session",
                ),
            );
            sink.end(Some(serde_json::to_vec(&body)?.into())).await?;
            return Ok(());
        }
        let _open = OpenStream(&self.stream_open);

        sink.set_header(header::CONTENT_TYPE, EVENT_STREAM)?;
        sink.set_header(header::CACHE_CONTROL, "no-cache")?;
        sink.set_header(HeaderName::from_static(MCP_SESSION_ID), session.id())?;

        let mut messages = self.push.subscribe();
        let closed = session.cancellation();
        let hung_up = CancellationToken::new();
        {
            let hung_up = hung_up.clone();
            sink.on_abort(move || hung_up.cancel());
        }

        sink.write(": stream open\n\n").await?;
        tracing::debug!(session = %session.id(), "Push stream opened");

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                _ = hung_up.cancelled() => break,
                _ = heartbeat.tick() => sink.write(": keep-alive\n\n").await?,
                message = messages.recv() => match message {
                    Ok(json) => sink.write(format_event(&json)).await?,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(session = %session.id(), "Push stream lagged, missed {} messages", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        tracing::debug!(session = %session.id(), "Push stream closed");
        sink.end(None).await?;
        Ok(())
    }
}

/// The call was cancelled before it produced a reply. A client that hung
/// up gets nothing; a closed session gets the invalid-session answer.
async fn finish_cancelled(session: &Session, mut sink: ResponseSink) -> Result<()> {
    if sink.is_aborted() {
        tracing::debug!(session = %session.id(), "Client went away, dropping reply");
        return Ok(());
    }

    tracing::debug!(session = %session.id(), "Session closed during call");
    if sink.is_streaming() {
        sink.end(None).await?;
        return Ok(());
    }

    sink.status(StatusCode::NOT_FOUND);
    sink.set_header(header::CONTENT_TYPE, "application/json")?;
    let body = JsonRpcResponse::error(serde_json::Value::Null, JsonRpcError::invalid_session());
    sink.end(Some(serde_json::to_vec(&body)?.into())).await?;
    Ok(())
}

async fn write_event(sink: &mut ResponseSink, payload: &JsonRpcPayload) -> Result<()> {
    let json = serde_json::to_string(payload)?;
    sink.write(format_event(&json)).await?;
    Ok(())
}

fn format_event(json: &str) -> String {
    format!("event: message\ndata: {}\n\n", json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn accept(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_reply_mode_from_accept() {
        assert_eq!(ReplyMode::from_accept(&HeaderMap::new()), ReplyMode::Json);
        assert_eq!(ReplyMode::from_accept(&accept("application/json")), ReplyMode::Json);
        assert_eq!(
            ReplyMode::from_accept(&accept("application/json, text/event-stream")),
            ReplyMode::Json
        );
        assert_eq!(ReplyMode::from_accept(&accept("text/event-stream")), ReplyMode::Stream);
        assert_eq!(
            ReplyMode::from_accept(&accept("text/event-stream;q=1, */*;q=0.1")),
            ReplyMode::Json
        );
    }

    #[test]
    fn test_accepts_event_stream() {
        assert!(accepts_event_stream(&accept("text/event-stream")));
        assert!(!accepts_event_stream(&accept("application/json")));
        assert!(!accepts_event_stream(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn test_notifier_reaches_push_subscribers() {
        let adapter = StreamableAdapter::new(Duration::from_secs(60));
        let mut rx = adapter.push.subscribe();

        adapter.notifier().notify(findlib_mcp::protocol::JsonRpcRequest::notification(
            "notifications/progress",
            serde_json::json!({"progressToken": 1, "progress": 0.0}),
        ));

        let json = rx.recv().await.unwrap();
        assert!(json.contains("notifications/progress"));
    }

    #[tokio::test]
    async fn test_turns_are_fifo() {
        let adapter = Arc::new(StreamableAdapter::new(Duration::from_secs(60)));
        let first = adapter.acquire_turn().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut waiters = Vec::new();
        for n in 0..3 {
            let adapter = adapter.clone();
            let tx = tx.clone();
            waiters.push(tokio::spawn(async move {
                let _turn = adapter.acquire_turn().await;
                tx.send(n).unwrap();
            }));
            // Let each waiter queue up before the next one
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(first);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }
}
