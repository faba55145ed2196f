//! Error types for transport negotiation and proxying.
//!
//! Connection failures split into two classes that drive the negotiator:
//! fallback-eligible failures mean "this endpoint exists but does not
//! speak this transport's protocol", fatal ones mean the endpoint itself
//! is unreachable or broken and switching transport kind cannot help.

use crate::transport::TransportKind;

/// Errors establishing a connection to the remote endpoint.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The endpoint answered, but not in this transport's protocol.
    #[error("remote does not speak the {kind} protocol: {reason}")]
    ProtocolMismatch {
        /// The transport kind that was attempted.
        kind: TransportKind,
        /// What the endpoint actually returned.
        reason: String,
    },

    /// The endpoint returned an HTTP error status.
    #[error("HTTP status {status} from {url}")]
    Status {
        /// The status code.
        status: u16,
        /// The URL that was hit.
        url: String,
    },

    /// The underlying HTTP client failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A URL could not be parsed or joined.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The event stream ended before the session was established.
    #[error("stream ended before announcing a message endpoint")]
    StreamEnded,
}

impl ConnectionError {
    /// Whether this failure justifies one attempt with the other
    /// transport kind.
    ///
    /// Missing-route statuses and protocol mismatches qualify; network
    /// and TLS failures do not, since the other kind would hit the same
    /// wall.
    #[must_use]
    pub fn is_fallback_eligible(&self) -> bool {
        match self {
            Self::ProtocolMismatch { .. } | Self::StreamEnded => true,
            Self::Status { status, .. } => matches!(status, 404 | 405 | 406),
            Self::Http(_) | Self::Url(_) => false,
        }
    }
}

/// Errors on an established transport.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The transport has been closed.
    #[error("transport is closed")]
    Closed,

    /// Message (de)serialization failed.
    #[error("message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// An HTTP send failed.
    #[error("send failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A local I/O write failed.
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_eligibility() {
        let mismatch = ConnectionError::ProtocolMismatch {
            kind: TransportKind::Request,
            reason: "body is HTML".to_owned(),
        };
        assert!(mismatch.is_fallback_eligible());
        assert!(
            ConnectionError::Status {
                status: 404,
                url: "http://example.test/mcp".to_owned(),
            }
            .is_fallback_eligible()
        );
        assert!(
            !ConnectionError::Status {
                status: 500,
                url: "http://example.test/mcp".to_owned(),
            }
            .is_fallback_eligible()
        );
        assert!(ConnectionError::StreamEnded.is_fallback_eligible());
    }
}
