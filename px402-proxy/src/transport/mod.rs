//! Transport abstraction over stdio, event-stream, and per-request HTTP.
//!
//! A [`Transport`] is a bidirectional message pipe: `send` pushes one
//! message toward the peer (optionally with extra headers, for transports
//! that have headers at all), `recv` pulls the next inbound message, and
//! `close` tears the pipe down idempotently. Everything above this trait
//! is transport-agnostic.

mod http;
mod sse;
mod stdio;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

use async_trait::async_trait;
use px402::message::Message;
use px402::protocol::HeaderSet;

use crate::error::TransportError;

/// The two remote transport kinds the negotiator chooses between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Long-lived event stream with a separate message-post endpoint.
    Stream,
    /// One HTTP request per message.
    Request,
}

impl TransportKind {
    /// Returns the other kind.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Stream => Self::Request,
            Self::Request => Self::Stream,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stream => "stream",
            Self::Request => "request",
        })
    }
}

/// A bidirectional message pipe to one peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one message, attaching `headers` where the transport has a
    /// header channel. Transports without headers ignore them.
    async fn send(&self, message: Message, headers: HeaderSet) -> Result<(), TransportError>;

    /// Receives the next inbound message; `None` once the pipe is closed
    /// and drained.
    async fn recv(&self) -> Option<Message>;

    /// Closes the pipe. Idempotent.
    async fn close(&self);

    /// Whether the pipe has been closed.
    fn is_closed(&self) -> bool;

    /// Stages headers to ride on the next send only.
    ///
    /// The default implementation drops them; only header-capable
    /// wrappers honor staging.
    fn stage_headers(&self, headers: HeaderSet) {
        if !headers.is_empty() {
            tracing::warn!(
                count = headers.len(),
                "staged headers dropped: transport has no header channel"
            );
        }
    }
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.is_closed())
            .finish()
    }
}
