//! Request-kind transport: one HTTP POST per message.
//!
//! Each outbound message is POSTed as a JSON-RPC body; when the response
//! body is itself a JSON-RPC message it is queued for `recv`. A TCP-level
//! connect success proves nothing about the application protocol, so
//! [`HttpTransport::connect`] runs a throwaway `initialize` probe before
//! declaring the transport usable.

use async_trait::async_trait;
use px402::message::Message;
use px402::protocol::HeaderSet;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Transport, TransportKind};
use crate::error::{ConnectionError, TransportError};

/// Per-request HTTP transport.
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    inbound_tx: mpsc::Sender<Message>,
    inbound: Mutex<mpsc::Receiver<Message>>,
    cancel: CancellationToken,
}

impl HttpTransport {
    /// Probes the endpoint and opens the transport.
    ///
    /// # Errors
    ///
    /// Probe failures classify per [`ConnectionError::is_fallback_eligible`]:
    /// missing-route statuses and non-JSON-RPC bodies are mismatches the
    /// negotiator may fall back from; transport-level failures are fatal.
    pub async fn connect(client: reqwest::Client, url: &Url) -> Result<Self, ConnectionError> {
        probe(url).await?;
        let (inbound_tx, rx) = mpsc::channel(64);
        Ok(Self {
            client,
            url: url.clone(),
            inbound_tx,
            inbound: Mutex::new(rx),
            cancel: CancellationToken::new(),
        })
    }
}

/// One-shot protocol probe with a throwaway client.
///
/// Sends a JSON-RPC `initialize` and demands a JSON-RPC shaped reply.
async fn probe(url: &Url) -> Result<(), ConnectionError> {
    let body = json!({
        "jsonrpc": "2.0",
        "method": "initialize",
        "params": { "protocolVersion": "2024-11-05", "capabilities": {} },
        "id": 0,
    });
    let response = reqwest::Client::new()
        .post(url.clone())
        .json(&body)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ConnectionError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    let text = response.text().await?;
    if serde_json::from_str::<Message>(&text).is_err() {
        return Err(ConnectionError::ProtocolMismatch {
            kind: TransportKind::Request,
            reason: "initialize reply is not a JSON-RPC message".to_owned(),
        });
    }
    Ok(())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: Message, headers: HeaderSet) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut request = self.client.post(self.url.clone()).json(&message);
        for (name, value) in headers.iter() {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "message POST rejected");
        }
        // Notifications legitimately get empty bodies; anything that
        // parses as a message flows back to the reader.
        if !text.trim().is_empty()
            && let Ok(reply) = serde_json::from_str::<Message>(&text)
            && self.inbound_tx.send(reply).await.is_err()
        {
            return Err(TransportError::Closed);
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
