//! Transport negotiation with single-shot fallback.
//!
//! A strategy names the preferred transport kind and whether the other
//! kind may be tried when the first fails for a protocol-shaped reason.
//! The ledger guarantees at most one fallback per logical connection:
//! once both kinds have been attempted, the last failure propagates.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::error::ConnectionError;
use crate::inject::{AuthHeaderInjector, IdentityConfig};
use crate::transport::{HttpTransport, SseTransport, Transport, TransportKind};

/// How the negotiator picks a transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConnectionStrategy {
    /// Try the event stream first, fall back to per-request HTTP.
    StreamFirst,
    /// Try per-request HTTP first, fall back to the event stream.
    RequestFirst,
    /// Event stream only; never fall back.
    StreamOnly,
    /// Per-request HTTP only; never fall back.
    RequestOnly,
}

impl ConnectionStrategy {
    /// The kind attempted first.
    #[must_use]
    pub const fn initial_kind(self) -> TransportKind {
        match self {
            Self::StreamFirst | Self::StreamOnly => TransportKind::Stream,
            Self::RequestFirst | Self::RequestOnly => TransportKind::Request,
        }
    }

    /// Whether this strategy permits trying the other kind at all.
    #[must_use]
    pub const fn allows_fallback(self) -> bool {
        matches!(self, Self::StreamFirst | Self::RequestFirst)
    }
}

/// Records which transport kinds have already been attempted.
#[derive(Debug, Default)]
pub struct FallbackLedger {
    attempted: Vec<TransportKind>,
}

impl FallbackLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an attempt; returns `false` if the kind was already tried.
    pub fn record(&mut self, kind: TransportKind) -> bool {
        if self.attempted.contains(&kind) {
            return false;
        }
        self.attempted.push(kind);
        true
    }

    /// Whether the kind has been attempted.
    #[must_use]
    pub fn contains(&self, kind: TransportKind) -> bool {
        self.attempted.contains(&kind)
    }
}

/// Opens a transport of the requested kind against a URL.
///
/// Abstracted so tests can count and fail attempts deterministically.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens one transport.
    async fn open(
        &self,
        kind: TransportKind,
        url: &Url,
    ) -> Result<Arc<dyn Transport>, ConnectionError>;
}

/// Factory backed by real HTTP/SSE transports on a shared client.
#[derive(Debug, Clone, Default)]
pub struct NativeFactory {
    client: reqwest::Client,
}

impl NativeFactory {
    /// Creates a factory with a fresh HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransportFactory for NativeFactory {
    async fn open(
        &self,
        kind: TransportKind,
        url: &Url,
    ) -> Result<Arc<dyn Transport>, ConnectionError> {
        match kind {
            TransportKind::Stream => {
                let transport = SseTransport::connect(self.client.clone(), url).await?;
                Ok(Arc::new(transport))
            }
            TransportKind::Request => {
                let transport = HttpTransport::connect(self.client.clone(), url).await?;
                Ok(Arc::new(transport))
            }
        }
    }
}

/// Strategy-driven connection negotiator.
pub struct Negotiator {
    factory: Arc<dyn TransportFactory>,
    identity: Option<IdentityConfig>,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("identity", &self.identity.is_some())
            .finish_non_exhaustive()
    }
}

impl Negotiator {
    /// Creates a negotiator over the given factory.
    #[must_use]
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            identity: None,
        }
    }

    /// Attaches identity/header configuration; successful connections are
    /// wrapped in an [`AuthHeaderInjector`].
    #[must_use]
    pub fn with_identity(mut self, identity: IdentityConfig) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Connects per the strategy, falling back at most once.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error once fallback is exhausted or the
    /// failure is not fallback-eligible.
    pub async fn connect(
        &self,
        url: &Url,
        strategy: ConnectionStrategy,
    ) -> Result<Arc<dyn Transport>, ConnectionError> {
        let mut ledger = FallbackLedger::new();
        let mut kind = strategy.initial_kind();
        loop {
            ledger.record(kind);
            tracing::info!(%kind, %url, "attempting connection");
            match self.factory.open(kind, url).await {
                Ok(transport) => {
                    tracing::info!(%kind, "connected");
                    return Ok(self.wrap(transport));
                }
                Err(err) if err.is_fallback_eligible()
                    && strategy.allows_fallback()
                    && !ledger.contains(kind.opposite()) =>
                {
                    tracing::warn!(%kind, error = %err, "falling back to the other transport kind");
                    kind = kind.opposite();
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn wrap(&self, transport: Arc<dyn Transport>) -> Arc<dyn Transport> {
        match &self.identity {
            Some(identity) => Arc::new(AuthHeaderInjector::new(transport, identity.clone())),
            None => transport,
        }
    }
}
