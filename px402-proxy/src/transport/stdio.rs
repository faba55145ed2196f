//! Newline-delimited JSON over a reader/writer pair.
//!
//! This is the local side of the proxy: the client process speaks
//! JSON-RPC over our stdin/stdout, one message per line. The transport is
//! generic over the writer so tests can capture output in memory.

use async_trait::async_trait;
use px402::message::Message;
use px402::protocol::HeaderSet;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::Transport;
use crate::error::TransportError;

/// Line-delimited JSON transport over arbitrary async I/O.
pub struct StdioTransport<W> {
    writer: Mutex<W>,
    inbound: Mutex<mpsc::Receiver<Message>>,
    cancel: CancellationToken,
}

impl StdioTransport<Stdout> {
    /// Opens the transport over this process's stdin/stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<W> StdioTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Opens the transport over the given reader/writer pair.
    ///
    /// A background task reads lines from `reader` until EOF or close;
    /// lines that fail to parse are logged and skipped, never fatal.
    pub fn new<R>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let read_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = tokio::select! {
                    () = read_cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Message>(line) {
                            Ok(message) => {
                                if tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "skipping unparsable input line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "stdin read failed");
                        break;
                    }
                }
            }
            // Dropping the sender lets recv drain and then yield None;
            // EOF on the read side does not close the write side.
        });
        Self {
            writer: Mutex::new(writer),
            inbound: Mutex::new(rx),
            cancel,
        }
    }
}

#[async_trait]
impl<W> Transport for StdioTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: Message, _headers: HeaderSet) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Message> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            () = self.cancel.cancelled() => inbound.try_recv().ok(),
            message = inbound.recv() => message,
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_line_delimited_messages() {
        let input = b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}\nnot json\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n".to_vec();
        let transport = StdioTransport::new(std::io::Cursor::new(input), Vec::new());
        let first = transport.recv().await.unwrap();
        assert_eq!(first.as_request().unwrap().method, "ping");
        // The unparsable middle line is skipped, not fatal.
        let second = transport.recv().await.unwrap();
        assert_eq!(second.as_response().unwrap().id, json!(1));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_writes_one_line() {
        let transport = StdioTransport::new(std::io::Cursor::new(Vec::new()), Vec::new());
        let message: Message =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "ping", "id": 1})).unwrap();
        transport
            .send(message.clone(), HeaderSet::new())
            .await
            .unwrap();
        let written = transport.writer.lock().await.clone();
        let text = String::from_utf8(written).unwrap();
        assert!(text.ends_with('\n'));
        let back: Message = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(back, message);
    }

    #[tokio::test]
    async fn test_send_after_close_is_closed_error() {
        let transport = StdioTransport::new(std::io::Cursor::new(Vec::new()), Vec::new());
        transport.close().await;
        transport.close().await; // idempotent
        let message: Message =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "ping"})).unwrap();
        let err = transport.send(message, HeaderSet::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
