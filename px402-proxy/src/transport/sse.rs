//! Stream-kind transport: server-sent events down, HTTP POST up.
//!
//! The session opens with a `GET` carrying `Accept: text/event-stream`.
//! The server's first `endpoint` event announces the URL that accepts
//! message POSTs; subsequent `message` events carry inbound JSON-RPC
//! messages. Connection is only considered established once the endpoint
//! event has arrived — a 200 that never announces an endpoint is a
//! protocol mismatch, not a live session.

use async_trait::async_trait;
use futures_util::StreamExt;
use px402::message::Message;
use px402::protocol::HeaderSet;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Transport, TransportKind};
use crate::error::{ConnectionError, TransportError};

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental server-sent-event parser over arbitrary chunk boundaries.
#[derive(Debug, Default)]
struct SseParser {
    buffer: String,
    event: String,
    data: Vec<String>,
}

impl SseParser {
    /// Feeds a chunk and returns every event completed by it.
    fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        event: if self.event.is_empty() {
                            "message".to_owned()
                        } else {
                            std::mem::take(&mut self.event)
                        },
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                }
                self.event.clear();
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event = value.trim_start().to_owned();
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.trim_start().to_owned());
            }
            // Comment lines (":…") and unknown fields are ignored.
        }
        events
    }
}

/// Event-stream transport.
pub struct SseTransport {
    client: reqwest::Client,
    endpoint: Url,
    inbound: Mutex<mpsc::Receiver<Message>>,
    cancel: CancellationToken,
}

impl SseTransport {
    /// Opens the stream and waits for the `endpoint` announcement.
    ///
    /// # Errors
    ///
    /// Non-2xx statuses surface as [`ConnectionError::Status`]; a stream
    /// that ends (or yields messages) before announcing an endpoint is
    /// [`ConnectionError::StreamEnded`] / a protocol mismatch, both
    /// fallback-eligible.
    pub async fn connect(client: reqwest::Client, url: &Url) -> Result<Self, ConnectionError> {
        let response = client
            .get(url.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        if !content_type.starts_with("text/event-stream") {
            return Err(ConnectionError::ProtocolMismatch {
                kind: TransportKind::Stream,
                reason: format!("content-type is {content_type:?}"),
            });
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();
        let mut endpoint: Option<Url> = None;
        let mut early: Vec<Message> = Vec::new();

        // Read inline until the endpoint event arrives.
        while endpoint.is_none() {
            let Some(chunk) = stream.next().await else {
                return Err(ConnectionError::StreamEnded);
            };
            let chunk = chunk?;
            for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                match event.event.as_str() {
                    "endpoint" => {
                        endpoint = Some(url.join(event.data.trim())?);
                    }
                    "message" => {
                        if let Ok(message) = serde_json::from_str(&event.data) {
                            early.push(message);
                        }
                    }
                    _ => {}
                }
            }
        }
        let endpoint = endpoint.ok_or(ConnectionError::StreamEnded)?;
        tracing::debug!(endpoint = %endpoint, "event stream established");

        let (tx, rx) = mpsc::channel(64);
        for message in early {
            // Channel is empty and larger than any plausible preamble.
            let _ = tx.try_send(message);
        }
        let cancel = CancellationToken::new();
        let read_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    () = read_cancel.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                let Some(Ok(chunk)) = chunk else { break };
                for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                    if event.event != "message" {
                        continue;
                    }
                    match serde_json::from_str::<Message>(&event.data) {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "skipping unparsable stream event");
                        }
                    }
                }
            }
            // Sender drop lets recv drain and then yield None.
        });

        Ok(Self {
            client,
            endpoint,
            inbound: Mutex::new(rx),
            cancel,
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: Message, headers: HeaderSet) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut request = self.client.post(self.endpoint.clone()).json(&message);
        for (name, value) in headers.iter() {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        if let Err(err) = response.error_for_status() {
            return Err(TransportError::Http(err));
        }
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

    #[test]
    fn test_parser_across_chunk_boundaries() {
        let mut parser = SseParser::default();
        assert!(parser.push("event: endpo").is_empty());
        assert!(parser.push("int\ndata: /messages?session=1\n").is_empty());
        let events = parser.push("\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "endpoint".to_owned(),
                data: "/messages?session=1".to_owned(),
            }]
        );
    }

    #[test]
    fn test_parser_defaults_event_name_to_message() {
        let mut parser = SseParser::default();
        let events = parser.push("data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn test_parser_joins_multiline_data_and_skips_comments() {
        let mut parser = SseParser::default();
        let events = parser.push(": keepalive\nevent: message\ndata: one\ndata: two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn test_parser_crlf_lines() {
        let mut parser = SseParser::default();
        let events = parser.push("event: endpoint\r\ndata: /m\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "/m");
    }
}
