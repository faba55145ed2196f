//! JSON-RPC 2.0 message envelope for proxied traffic.
//!
//! Every message crossing the proxy is either a [`Request`] or a
//! [`Response`]. Messages are immutable once received: interception points
//! never mutate a message in place, they build a new one and forward that
//! instead.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The JSON-RPC protocol version string carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_owned()
}

/// A message crossing the proxy in either direction.
///
/// Deserialization is untagged: a payload carrying a `method` field parses
/// as a [`Request`], anything else with an `id` parses as a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// A request (or notification, when `id` is absent).
    Request(Request),
    /// A response carrying either a result or an error.
    Response(Response),
}

impl Message {
    /// Returns the message id, if any.
    #[must_use]
    pub fn id(&self) -> Option<&Value> {
        match self {
            Self::Request(req) => req.id.as_ref(),
            Self::Response(resp) => Some(&resp.id),
        }
    }

    /// Returns the inner request, if this is one.
    #[must_use]
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            Self::Response(_) => None,
        }
    }

    /// Returns the inner response, if this is one.
    #[must_use]
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(resp) => Some(resp),
            Self::Request(_) => None,
        }
    }

    /// Builds an error response addressed to `id`.
    #[must_use]
    pub fn error_response(
        id: Value,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self::Response(Response {
            jsonrpc: default_jsonrpc(),
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data,
            }),
        })
    }

    /// Builds a successful response addressed to `id`.
    #[must_use]
    pub fn result_response(id: Value, result: Value) -> Self {
        Self::Response(Response {
            jsonrpc: default_jsonrpc(),
            id,
            result: Some(result),
            error: None,
        })
    }
}

/// A JSON-RPC request envelope: `{method, params, id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version marker, always `"2.0"` on the wire.
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// The method being invoked.
    pub method: String,
    /// Method parameters, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request id; absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Request {
    /// Creates a request with the given method, params, and id.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<Value>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Returns the argument object for a tool-style call.
    ///
    /// Looks for `params.arguments` first (MCP convention), falling back to
    /// `params` itself when it is a plain object.
    #[must_use]
    pub fn arguments(&self) -> Option<&serde_json::Map<String, Value>> {
        let params = self.params.as_ref()?.as_object()?;
        match params.get("arguments").and_then(Value::as_object) {
            Some(args) => Some(args),
            None => Some(params),
        }
    }
}

/// A JSON-RPC response envelope: `{id, result}` or `{id, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version marker, always `"2.0"` on the wire.
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// The id of the request this responds to (may be `null`).
    pub id: Value,
    /// Successful result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Returns `true` if this response carries an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A JSON-RPC error object: `{code, message, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let raw = r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"echo"},"id":7}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        let req = msg.as_request().expect("should parse as request");
        assert_eq!(req.method, "tools/call");
        assert_eq!(req.id, Some(json!(7)));
        let out = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&out).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_response_with_error_parses_as_response() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"code":402,"message":"payment required"}}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        let resp = msg.as_response().expect("should parse as response");
        assert!(resp.is_error());
        assert_eq!(resp.error.as_ref().unwrap().code, 402);
    }

    #[test]
    fn test_method_field_disambiguates_request() {
        // A request without an id (notification) must not parse as a response.
        let raw = r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert!(msg.as_request().is_some());
    }

    #[test]
    fn test_arguments_prefers_mcp_shape() {
        let req = Request::new(
            "tools/call",
            Some(json!({"name": "pay", "arguments": {"approved": true}})),
            Some(json!(1)),
        );
        let args = req.arguments().unwrap();
        assert_eq!(args.get("approved"), Some(&json!(true)));
    }

    #[test]
    fn test_error_response_builder() {
        let msg = Message::error_response(json!(3), -32060, "bad approval", None);
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.id, json!(3));
        assert_eq!(resp.error.as_ref().unwrap().code, -32060);
        assert!(resp.result.is_none());
    }
}
