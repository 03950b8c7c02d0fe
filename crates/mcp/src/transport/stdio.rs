// Newline-delimited JSON-RPC over stdin/stdout

use super::{Transport, TransportResult};
use crate::protocol::JsonRpcPayload;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Stdin, Stdout,
};
use tracing::trace;

/// One JSON value per line in each direction. The process lifetime is the
/// session lifetime, so there is no session id.
pub struct StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    reader: R,
    writer: BufWriter<W>,
}

impl StdioTransport<BufReader<Stdin>, Stdout> {
    /// Create a new transport using actual stdin/stdout
    pub fn new() -> Self {
        Self::from_handles(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl Default for StdioTransport<BufReader<Stdin>, Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a transport from custom reader/writer handles
    pub fn from_handles(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer: BufWriter::new(writer),
        }
    }

    /// Next non-blank line as raw bytes, or `None` at EOF. Bytes are not
    /// decoded here so a line that is not UTF-8 fails as that one frame.
    async fn read_line(&mut self) -> TransportResult<Option<Vec<u8>>> {
        loop {
            let mut line = Vec::new();
            let bytes_read = self.reader.read_until(b'\n', &mut line).await?;

            if bytes_read == 0 {
                trace!("EOF reached on transport input");
                return Ok(None);
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            trace!(message = %String::from_utf8_lossy(&line).trim(), "Received message");
            return Ok(Some(line));
        }
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn receive(&mut self) -> TransportResult<Option<JsonRpcPayload>> {
        match self.read_line().await? {
            Some(line) => Ok(Some(JsonRpcPayload::parse(&line)?)),
            None => Ok(None),
        }
    }

    async fn send(&mut self, payload: &JsonRpcPayload) -> TransportResult<()> {
        let json = serde_json::to_string(payload)?;
        trace!(message = %json, "Sending message");

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.writer.flush().await?;
        Ok(())
    }
}
