//! Send-path header injection: identity proofs, static headers, and the
//! one-shot payment header slot.
//!
//! The injector wraps only the outbound half of a transport. Every send
//! gets a freshly minted time-bound identity proof (never a cached one),
//! static headers merged around it, and — when a payment cycle staged
//! headers — that staged set exactly once.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use px402::message::Message;
use px402::protocol::HeaderSet;

use crate::error::TransportError;
use crate::transport::Transport;

/// Bearer token header.
pub const AUTHORIZATION_HEADER: &str = "Authorization";
/// Proof mint time, unix seconds.
pub const IDENTITY_TIMESTAMP_HEADER: &str = "X-Identity-Timestamp";
/// Proof expiry, unix seconds.
pub const IDENTITY_EXPIRY_HEADER: &str = "X-Identity-Expiry";

/// Header names static configuration may never override.
pub const RESERVED_IDENTITY_HEADERS: [&str; 3] = [
    AUTHORIZATION_HEADER,
    IDENTITY_TIMESTAMP_HEADER,
    IDENTITY_EXPIRY_HEADER,
];

/// Identity and static-header configuration for outbound sends.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Bearer token, sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
    /// Operator-supplied headers attached to every send.
    pub static_headers: HeaderSet,
    /// Validity window of each minted proof.
    pub proof_ttl: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            token: None,
            static_headers: HeaderSet::new(),
            proof_ttl: Duration::from_secs(60),
        }
    }
}

impl IdentityConfig {
    /// Config with only a bearer token.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }
}

/// Transport wrapper that decorates every outbound send.
pub struct AuthHeaderInjector {
    inner: Arc<dyn Transport>,
    config: IdentityConfig,
    // One staged set at most; a single in-flight payment cycle per
    // connection is a documented limitation.
    pending: Mutex<Option<HeaderSet>>,
}

impl std::fmt::Debug for AuthHeaderInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHeaderInjector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AuthHeaderInjector {
    /// Wraps a transport.
    #[must_use]
    pub fn new(inner: Arc<dyn Transport>, config: IdentityConfig) -> Self {
        Self {
            inner,
            config,
            pending: Mutex::new(None),
        }
    }

    /// Mints a fresh identity proof. Never cached: each call reads the
    /// clock again. Without a token there is no identity to prove, so
    /// nothing is minted and the wrapper only carries the staging slot.
    fn identity_headers(&self) -> HeaderSet {
        let mut headers = HeaderSet::new();
        let Some(token) = &self.config.token else {
            return headers;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let expiry = now.saturating_add(self.config.proof_ttl.as_secs());
        headers.insert(AUTHORIZATION_HEADER, format!("Bearer {token}"));
        headers.insert(IDENTITY_TIMESTAMP_HEADER, now.to_string());
        headers.insert(IDENTITY_EXPIRY_HEADER, expiry.to_string());
        headers
    }

    /// Builds the full header set for one send, consuming any staged set.
    fn assemble(&self, call_headers: HeaderSet) -> HeaderSet {
        let mut headers = self.identity_headers();
        for (name, value) in self.config.static_headers.iter() {
            if RESERVED_IDENTITY_HEADERS
                .iter()
                .any(|reserved| reserved.eq_ignore_ascii_case(name))
            {
                tracing::warn!(header = name, "static header collides with identity; keeping identity value");
                continue;
            }
            headers.insert(name, value);
        }
        headers.merge(call_headers);
        // Cleared synchronously, before the send can resolve.
        let staged = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(staged) = staged {
            headers.merge(staged);
        }
        headers
    }
}

#[async_trait]
impl Transport for AuthHeaderInjector {
    async fn send(&self, message: Message, headers: HeaderSet) -> Result<(), TransportError> {
        let merged = self.assemble(headers);
        self.inner.send(message, merged).await
    }

    async fn recv(&self) -> Option<Message> {
        self.inner.recv().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn stage_headers(&self, headers: HeaderSet) {
        let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(displaced) = slot.replace(headers) {
            tracing::warn!(
                displaced = ?displaced.names().collect::<Vec<_>>(),
                "staged payment headers overwritten before being sent"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    /// Transport that records the headers of every send.
    #[derive(Default)]
    struct RecordingTransport {
        sends: AsyncMutex<Vec<HeaderSet>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, _message: Message, headers: HeaderSet) -> Result<(), TransportError> {
            self.sends.lock().await.push(headers);
            Ok(())
        }

        async fn recv(&self) -> Option<Message> {
            None
        }

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn ping() -> Message {
        serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).unwrap()
    }

    fn injector(config: IdentityConfig) -> (Arc<RecordingTransport>, AuthHeaderInjector) {
        let inner = Arc::new(RecordingTransport::default());
        let injector = AuthHeaderInjector::new(Arc::clone(&inner) as Arc<dyn Transport>, config);
        (inner, injector)
    }

    #[tokio::test]
    async fn test_every_send_carries_fresh_identity() {
        let (inner, injector) = injector(IdentityConfig::bearer("tok"));
        injector.send(ping(), HeaderSet::new()).await.unwrap();
        injector.send(ping(), HeaderSet::new()).await.unwrap();
        let sends = inner.sends.lock().await;
        for sent in sends.iter() {
            assert_eq!(sent.get(AUTHORIZATION_HEADER), Some("Bearer tok"));
            assert!(sent.get(IDENTITY_TIMESTAMP_HEADER).is_some());
            assert!(sent.get(IDENTITY_EXPIRY_HEADER).is_some());
        }
    }

    #[tokio::test]
    async fn test_staged_headers_ride_exactly_one_send() {
        let (inner, injector) = injector(IdentityConfig::default());
        let mut staged = HeaderSet::new();
        staged.insert("X-PAYMENT", "payload");
        injector.stage_headers(staged);
        injector.send(ping(), HeaderSet::new()).await.unwrap();
        injector.send(ping(), HeaderSet::new()).await.unwrap();
        let sends = inner.sends.lock().await;
        assert_eq!(sends[0].get("X-PAYMENT"), Some("payload"));
        assert_eq!(sends[1].get("X-PAYMENT"), None);
    }

    #[tokio::test]
    async fn test_no_proof_minted_without_a_token() {
        let (inner, injector) = injector(IdentityConfig::default());
        injector.send(ping(), HeaderSet::new()).await.unwrap();
        let sends = inner.sends.lock().await;
        assert!(sends[0].is_empty());
    }

    #[tokio::test]
    async fn test_static_header_cannot_shadow_identity() {
        let mut config = IdentityConfig::bearer("real");
        config
            .static_headers
            .insert("authorization", "Bearer forged");
        config.static_headers.insert("X-Custom", "yes");
        let (inner, injector) = injector(config);
        injector.send(ping(), HeaderSet::new()).await.unwrap();
        let sends = inner.sends.lock().await;
        assert_eq!(sends[0].get(AUTHORIZATION_HEADER), Some("Bearer real"));
        assert_eq!(sends[0].get("X-Custom"), Some("yes"));
    }

    #[tokio::test]
    async fn test_stage_overwrites_unconsumed_slot() {
        let (inner, injector) = injector(IdentityConfig::default());
        let mut first = HeaderSet::new();
        first.insert("X-PAYMENT", "stale");
        let mut second = HeaderSet::new();
        second.insert("X-PAYMENT", "current");
        injector.stage_headers(first);
        injector.stage_headers(second);
        injector.send(ping(), HeaderSet::new()).await.unwrap();
        let sends = inner.sends.lock().await;
        assert_eq!(sends[0].get("X-PAYMENT"), Some("current"));
    }
}
