// SSE binding: one long-lived event stream per client, fed by a serve loop.
// Calls arrive on a companion POST endpoint and their responses are pushed
// down the stream instead of being returned from the POST.

use async_trait::async_trait;
use findlib_mcp::protocol::JsonRpcPayload;
use findlib_mcp::transport::{Transport, TransportError, TransportResult};
use tokio::sync::mpsc;

const INBOUND_BUFFER: usize = 64;

/// The session's handle for feeding client calls into its serve loop
pub struct SseAdapter {
    inbound: mpsc::Sender<JsonRpcPayload>,
}

/// The serve loop's half: reads delivered calls, writes event payloads
pub struct SseTransport {
    inbound: mpsc::Receiver<JsonRpcPayload>,
    outbound: mpsc::Sender<String>,
}

impl SseAdapter {
    /// Pair an adapter with the transport its serve loop will drive.
    /// Everything the loop sends lands on `outbound` as serialized JSON.
    pub fn new(outbound: mpsc::Sender<String>) -> (Self, SseTransport) {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        (
            Self { inbound: tx },
            SseTransport {
                inbound: rx,
                outbound,
            },
        )
    }

    /// Queue a client call. Fails once the serve loop is gone.
    pub async fn deliver(&self, payload: JsonRpcPayload) -> TransportResult<()> {
        self.inbound
            .send(payload)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn receive(&mut self) -> TransportResult<Option<JsonRpcPayload>> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, payload: &JsonRpcPayload) -> TransportResult<()> {
        let json = serde_json::to_string(payload)?;
        tracing::trace!(message = %json, "Pushing SSE message");
        self.outbound
            .send(json)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.inbound.close();
        Ok(())
    }
}
