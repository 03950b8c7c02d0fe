// Response sink: lets a transport adapter drive an HTTP reply through a
// node-style status/header/write/end interface.
//
// Writes are buffered into a single body unless `Content-Type:
// text/event-stream` is set before the first write; then the head is
// released right away and every write becomes its own body chunk.

use axum::{
    body::Body,
    http::{
        header::{self, HeaderName, HeaderValue, InvalidHeaderValue},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use findlib_mcp::protocol::{JsonRpcError, JsonRpcResponse};
use std::convert::Infallible;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

const STREAM_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Headers were already sent")]
    HeadersSent,

    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    /// The client is no longer reading
    #[error("Response stream closed")]
    Closed,
}

enum SinkBody {
    Buffered(Vec<u8>),
    Streaming(mpsc::Sender<Bytes>),
}

pub struct ResponseSink {
    status: StatusCode,
    headers: HeaderMap,
    head: Option<oneshot::Sender<Response>>,
    body: SinkBody,
    written: bool,
    aborted: CancellationToken,
    finished: CancellationToken,
}

/// The frontend half of a sink: resolves to the HTTP response once the
/// adapter has released the head.
pub struct PendingResponse {
    head: oneshot::Receiver<Response>,
    abort_guard: Option<DropGuard>,
}

impl ResponseSink {
    pub fn new() -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let aborted = CancellationToken::new();

        let sink = Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head: Some(head_tx),
            body: SinkBody::Buffered(Vec::new()),
            written: false,
            aborted: aborted.clone(),
            finished: CancellationToken::new(),
        };
        let pending = PendingResponse {
            head: head_rx,
            abort_guard: Some(aborted.drop_guard()),
        };
        (sink, pending)
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        if self.head.is_none() {
            tracing::debug!("Ignoring status {} after headers were sent", status);
        }
        self.status = status;
        self
    }

    pub fn set_header(&mut self, name: HeaderName, value: &str) -> Result<(), SinkError> {
        if self.head.is_none() {
            return Err(SinkError::HeadersSent);
        }
        self.headers.insert(name, HeaderValue::from_str(value)?);
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, SinkBody::Streaming(_))
    }

    /// Whether the client went away before the reply was finished
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled() && !self.finished.is_cancelled()
    }

    /// Run `callback` if the client disconnects before [`end`](Self::end)
    pub fn on_abort(&self, callback: impl FnOnce() + Send + 'static) {
        let aborted = self.aborted.clone();
        let finished = self.finished.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = finished.cancelled() => {}
                _ = aborted.cancelled() => callback(),
            }
        });
    }

    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), SinkError> {
        let chunk = chunk.into();
        if !self.written && self.wants_stream() {
            self.start_stream()?;
        }
        self.written = true;

        match &mut self.body {
            SinkBody::Buffered(buffer) => {
                buffer.extend_from_slice(&chunk);
                Ok(())
            }
            SinkBody::Streaming(tx) => tx.send(chunk).await.map_err(|_| SinkError::Closed),
        }
    }

    /// Finish the reply, optionally writing a last chunk
    pub async fn end(mut self, chunk: Option<Bytes>) -> Result<(), SinkError> {
        if let Some(chunk) = chunk {
            self.write(chunk).await?;
        }

        // Swapping the body out also drops a stream's sender, ending it
        let body = std::mem::replace(&mut self.body, SinkBody::Buffered(Vec::new()));
        if let SinkBody::Buffered(buffer) = body {
            self.release_head(Body::from(buffer))?;
        }
        Ok(())
    }

    fn wants_stream(&self) -> bool {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"))
    }

    fn start_stream(&mut self) -> Result<(), SinkError> {
        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);

        // The body owns an abort guard: hyper drops it when the client
        // disconnects or after the last chunk.
        let guard = self.aborted.clone().drop_guard();
        let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<_, Infallible>(chunk), (rx, guard)))
        });

        self.release_head(Body::from_stream(stream))?;
        self.body = SinkBody::Streaming(tx);
        Ok(())
    }

    fn release_head(&mut self, body: Body) -> Result<(), SinkError> {
        let head = self.head.take().ok_or(SinkError::HeadersSent)?;

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);

        head.send(response).map_err(|_| SinkError::Closed)
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        self.finished.cancel();
    }
}

impl PendingResponse {
    /// Wait for the head. A sink dropped before releasing it becomes a 500.
    pub async fn into_response(mut self) -> Response {
        let outcome = (&mut self.head).await;
        if let Some(guard) = self.abort_guard.take() {
            guard.disarm();
        }

        match outcome {
            Ok(response) => response,
            Err(_) => {
                tracing::error!("Response sink dropped before replying");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(JsonRpcResponse::error(
                        serde_json::Value::Null,
                        JsonRpcError::internal_error("Internal server error"),
                    )),
                )
                    .into_response()
            }
        }
    }
}
