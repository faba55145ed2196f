//! Error taxonomy for the payment core.
//!
//! Detection-layer failures are swallowed into "no match" so a hostile or
//! buggy remote can never kill the proxy loop. Orchestrator-layer failures
//! are converted into structured JSON-RPC-shaped error responses carrying
//! remediation text, never dropped silently.

use rust_decimal::Decimal;
use serde_json::{Value, json};

use crate::message::Message;

/// JSON-RPC error codes used by structured payment errors.
pub mod codes {
    /// The approval replay was missing or malformed.
    pub const INVALID_APPROVAL: i64 = -32060;
    /// The signer could not be configured for the template's chain.
    pub const CHAIN_CONFIGURATION: i64 = -32061;
    /// Asset or gas balance is insufficient for the payment.
    pub const INSUFFICIENT_FUNDS: i64 = -32062;
    /// The template failed validation after the one permitted repair.
    pub const DATA_CORRUPTION: i64 = -32063;
    /// Signing the payment failed.
    pub const SIGNING_FAILED: i64 = -32064;
    /// The signer's balances could not be queried.
    pub const BALANCE_UNAVAILABLE: i64 = -32065;
}

/// Errors raised by protocol descriptors during extraction or signing.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The payload does not belong to this protocol after all.
    #[error("protocol mismatch: {0}")]
    Mismatch(String),

    /// The payload is structurally unusable.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The challenge names a network outside the known table.
    #[error("unknown network '{0}'")]
    UnknownNetwork(String),

    /// Amount parsing or conversion failed.
    #[error(transparent)]
    Amount(#[from] crate::amount::AmountError),

    /// Underlying JSON error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The signer failed while producing the payment artifact.
    #[error("signing failed: {0}")]
    Signing(#[from] crate::signer::SignerError),
}

/// A funds check that came up short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InsufficientFunds {
    /// The stable-asset balance cannot cover the payment amount.
    #[error("insufficient asset balance: need {required}, have {available} (short {shortfall})")]
    Asset {
        /// Amount the payment requires.
        required: Decimal,
        /// Amount actually available.
        available: Decimal,
        /// Exact shortfall (`required - available`).
        shortfall: Decimal,
    },

    /// The native balance cannot cover the estimated gas.
    #[error("insufficient gas balance: need more than {required}, have {available}")]
    Gas {
        /// Estimated gas cost.
        required: Decimal,
        /// Native balance actually available.
        available: Decimal,
    },
}

impl InsufficientFunds {
    /// Serializes the failure into structured error data.
    #[must_use]
    pub fn to_data(&self) -> Value {
        match self {
            Self::Asset {
                required,
                available,
                shortfall,
            } => json!({
                "kind": "assetShortfall",
                "required": required.normalize().to_string(),
                "available": available.normalize().to_string(),
                "shortfall": shortfall.normalize().to_string(),
            }),
            Self::Gas {
                required,
                available,
            } => json!({
                "kind": "gasShortfall",
                "required": required.normalize().to_string(),
                "available": available.normalize().to_string(),
            }),
        }
    }
}

/// Builds a structured JSON-RPC error response with remediation text.
///
/// Every agent-facing failure goes through here so the response always
/// tells the caller how to fix the problem and retry.
#[must_use]
pub fn structured_error(
    id: Value,
    code: i64,
    message: impl Into<String>,
    remediation: impl Into<String>,
    detail: Option<Value>,
) -> Message {
    let mut data = json!({ "remediation": remediation.into() });
    if let (Some(obj), Some(extra)) = (data.as_object_mut(), detail) {
        obj.insert("detail".to_owned(), extra);
    }
    Message::error_response(id, code, message, Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_shortfall_data() {
        let err = InsufficientFunds::Asset {
            required: Decimal::ONE,
            available: "0.5".parse().unwrap(),
            shortfall: "0.5".parse().unwrap(),
        };
        let data = err.to_data();
        assert_eq!(data["kind"], "assetShortfall");
        assert_eq!(data["shortfall"], "0.5");
    }

    #[test]
    fn test_structured_error_carries_remediation() {
        let msg = structured_error(
            json!(1),
            codes::INVALID_APPROVAL,
            "missing transaction",
            "replay the call with an embedded transaction template",
            None,
        );
        let resp = msg.as_response().unwrap();
        let data = resp.error.as_ref().unwrap().data.as_ref().unwrap();
        assert!(
            data["remediation"]
                .as_str()
                .unwrap()
                .contains("replay the call")
        );
    }
}
