//! Multi-protocol payment challenge detection.
//!
//! Detection is deliberately paranoid-tolerant: the remote server is
//! untrusted and may emit malformed JSON, language-specific literal
//! spellings, or payloads claiming several protocols at once. Every
//! failure inside this module collapses to "no match" — a hostile or
//! buggy remote must never be able to kill the proxy loop from here.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;

use crate::message::Message;
use crate::protocol::{ProtocolDescriptor, ProtocolRegistry};

/// A successful detection: the matched protocol and the payload it should
/// extract from, already normalized (never re-parsed downstream).
#[derive(Debug, Clone)]
pub struct Detection {
    /// Identifier of the matched protocol.
    pub protocol_id: &'static str,
    /// The matched descriptor.
    pub descriptor: Arc<dyn ProtocolDescriptor>,
    /// The normalized payload the descriptor matched against.
    pub payload: Value,
}

impl std::fmt::Debug for dyn ProtocolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolDescriptor")
            .field("id", &self.id())
            .finish()
    }
}

/// Priority-ordered payment protocol detector.
#[derive(Debug, Clone, Default)]
pub struct ProtocolDetector {
    registry: ProtocolRegistry,
}

impl ProtocolDetector {
    /// Creates a detector over the standard protocol registry.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            registry: ProtocolRegistry::standard(),
        }
    }

    /// Creates a detector over a caller-supplied registry.
    #[must_use]
    pub fn new(registry: ProtocolRegistry) -> Self {
        Self { registry }
    }

    /// Returns the underlying registry.
    #[must_use]
    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// Detects a payment challenge in a response message.
    ///
    /// Returns `None` for requests, for responses with no extractable
    /// payload, and for payloads no registered protocol claims. A payload
    /// carrying indicators for two protocols resolves to the
    /// higher-priority one regardless of key order.
    #[must_use]
    pub fn detect(&self, message: &Message) -> Option<Detection> {
        let payload = normalize(message)?;
        for descriptor in self.registry.iter() {
            // A broken predicate in one descriptor must not mask the rest.
            let matched = catch_unwind(AssertUnwindSafe(|| descriptor.matches(&payload)))
                .unwrap_or_else(|_| {
                    tracing::warn!(protocol = descriptor.id(), "detect predicate panicked");
                    false
                });
            if matched {
                return Some(Detection {
                    protocol_id: descriptor.id(),
                    descriptor: Arc::clone(descriptor),
                    payload,
                });
            }
        }
        None
    }
}

/// Pulls the candidate payload out of a response envelope.
///
/// Order: `error.data`, else the error object itself, else `result`. A
/// "content item with embedded serialized text" result has its text parsed
/// as structured data; plain string payloads are parsed the same way.
fn normalize(message: &Message) -> Option<Value> {
    let response = message.as_response()?;
    let candidate = if let Some(error) = &response.error {
        match &error.data {
            Some(data) => data.clone(),
            None => serde_json::to_value(error).ok()?,
        }
    } else {
        response.result.clone()?
    };
    reshape(candidate)
}

/// Unwraps content-item and string payloads into structured values.
fn reshape(candidate: Value) -> Option<Value> {
    if let Some(text) = embedded_content_text(&candidate) {
        return parse_lenient(text);
    }
    if let Value::String(text) = &candidate {
        return parse_lenient(text);
    }
    Some(candidate)
}

/// Returns the text of `content[0]` when the value follows the
/// `{content: [{type: "text", text: …}]}` result shape.
fn embedded_content_text(value: &Value) -> Option<&str> {
    let first = value.get("content")?.as_array()?.first()?;
    if first.get("type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    first.get("text")?.as_str()
}

/// Parses text as JSON, retrying once through the relaxed rewrite.
#[must_use]
pub fn parse_lenient(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    serde_json::from_str(&relax(text)).ok()
}

static SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'([^'\\]*)'").expect("static regex"));
static PY_TRUE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bTrue\b").expect("static regex"));
static PY_FALSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bFalse\b").expect("static regex"));
static PY_NONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bNone\b").expect("static regex"));

/// Rewrites common non-conforming serialization quirks into strict JSON.
///
/// Best-effort by design: single-quoted keys/strings become double-quoted
/// and Python literal spellings become JSON ones. Input that still fails
/// to parse afterwards is simply not a challenge.
fn relax(text: &str) -> String {
    let text = SINGLE_QUOTED.replace_all(text, "\"$1\"");
    let text = PY_TRUE.replace_all(&text, "true");
    let text = PY_FALSE.replace_all(&text, "false");
    PY_NONE.replace_all(&text, "null").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorObject, Response};
    use serde_json::json;

    fn response_with_error_data(data: Value) -> Message {
        Message::Response(Response {
            jsonrpc: "2.0".to_owned(),
            id: json!(1),
            result: None,
            error: Some(ErrorObject {
                code: 402,
                message: "payment required".to_owned(),
                data: Some(data),
            }),
        })
    }

    fn response_with_result(result: Value) -> Message {
        Message::result_response(json!(1), result)
    }

    fn x402_payload() -> Value {
        json!({
            "x402Version": 1,
            "accepts": [{
                "scheme": "exact",
                "network": "base",
                "maxAmountRequired": "1000000",
                "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C"
            }]
        })
    }

    #[test]
    fn test_detects_challenge_in_error_data() {
        let detector = ProtocolDetector::standard();
        let detection = detector
            .detect(&response_with_error_data(x402_payload()))
            .unwrap();
        assert_eq!(detection.protocol_id, "x402");
    }

    #[test]
    fn test_detects_challenge_in_content_item_text() {
        let detector = ProtocolDetector::standard();
        let result = json!({
            "content": [{ "type": "text", "text": x402_payload().to_string() }],
            "isError": true
        });
        let detection = detector.detect(&response_with_result(result)).unwrap();
        assert_eq!(detection.protocol_id, "x402");
    }

    #[test]
    fn test_error_object_itself_is_a_candidate() {
        let detector = ProtocolDetector::standard();
        let msg = Message::Response(Response {
            jsonrpc: "2.0".to_owned(),
            id: json!(2),
            result: None,
            error: Some(ErrorObject {
                code: 402,
                message: "pay up".to_owned(),
                data: None,
            }),
        });
        // `{code: 402}` alone lacks an amount, so this is correctly no match.
        assert!(detector.detect(&msg).is_none());
    }

    #[test]
    fn test_ambiguous_payload_resolves_to_higher_priority() {
        let detector = ProtocolDetector::standard();
        // Indicators for both protocols, fallback keys listed first.
        let mut payload = json!({
            "error": "payment_required",
            "code": 402,
            "amount": "1.0",
        });
        payload
            .as_object_mut()
            .unwrap()
            .extend(x402_payload().as_object().unwrap().clone());
        let detection = detector
            .detect(&response_with_error_data(payload))
            .unwrap();
        assert_eq!(detection.protocol_id, "x402");
    }

    #[test]
    fn test_relaxed_parse_of_pythonic_payload() {
        let detector = ProtocolDetector::standard();
        let text = "{'error': 'payment_required', 'code': 402, 'amount': '2.0', 'transaction': None, 'ok': False}";
        let result = json!({ "content": [{ "type": "text", "text": text }] });
        let detection = detector.detect(&response_with_result(result)).unwrap();
        assert_eq!(detection.protocol_id, "payment-required");
    }

    #[test]
    fn test_unparsable_text_is_no_match_not_a_crash() {
        let detector = ProtocolDetector::standard();
        let result = json!({ "content": [{ "type": "text", "text": "{{{{ not json" }] });
        assert!(detector.detect(&response_with_result(result)).is_none());
    }

    #[test]
    fn test_plain_result_passes_undetected() {
        let detector = ProtocolDetector::standard();
        let msg = response_with_result(json!({"content": [{"type": "text", "text": "hello"}]}));
        assert!(detector.detect(&msg).is_none());
        let msg = response_with_result(json!({"ok": true}));
        assert!(detector.detect(&msg).is_none());
    }

    #[test]
    fn test_requests_never_match() {
        let detector = ProtocolDetector::standard();
        let req: Message = serde_json::from_value(json!({
            "jsonrpc": "2.0", "method": "tools/call", "id": 1,
            "params": x402_payload()
        }))
        .unwrap();
        assert!(detector.detect(&req).is_none());
    }
}
