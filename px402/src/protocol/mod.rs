//! Payment protocol descriptors and the priority-ordered registry.
//!
//! Two competing wire protocols for "payment required" challenges must be
//! supported at the same time without static configuration. Each protocol
//! is a [`ProtocolDescriptor`] implementation; the [`ProtocolRegistry`]
//! holds them in an explicit priority order — priority is data, not code
//! order — and a payload carrying indicators for two protocols always
//! resolves to the higher-priority one.

mod fallback;
mod x402;

pub use fallback::DecimalFallbackDescriptor;
pub use x402::X402Descriptor;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProtocolError;
use crate::signer::{Balances, Signer};

/// A payment challenge normalized out of a protocol-specific payload.
///
/// `amount` is always expressed in human-readable decimal units regardless
/// of the wire protocol's native encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentChallenge {
    /// Required amount in human decimal units.
    pub amount: Decimal,
    /// Currency code (e.g., "USDC").
    pub currency: String,
    /// Human-readable description of what is being paid for.
    pub description: String,
    /// Transaction template the agent replays on approval, when the
    /// protocol provides one.
    pub template: Option<TransactionTemplate>,
    /// Identifier of the protocol that produced this challenge.
    pub protocol_id: &'static str,
}

/// The transaction shape an approved payment executes.
///
/// Opaque to the core except for `chain_id` (used to configure the signer)
/// and the fields descriptors validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionTemplate {
    /// Destination address.
    pub to: String,
    /// Calldata, hex-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Transfer value. Atomic integer string for the atomic-unit protocol,
    /// decimal string for the fallback protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Target chain id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Gas limit hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<String>,
    /// Protocol-specific extension data (e.g., a detached authorization).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<Value>,
}

/// A signed payment artifact ready to be turned into headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPayment {
    /// Identifier of the protocol that produced the artifact.
    pub protocol_id: String,
    /// The protocol-specific signed payload.
    pub artifact: Value,
}

/// An ordered set of header name/value pairs.
///
/// Used both for one-time payment credentials and for identity headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSet(BTreeMap<String, String>);

impl HeaderSet {
    /// Creates an empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns the value for `name`, if set.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Merges `other` into `self`, with `other` winning on collisions.
    pub fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Iterates name/value pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the header names in name order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Returns `true` if no headers are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// A snapshot of the payer's funding situation for one challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingSnapshot {
    /// Asset and gas balances at enrichment time.
    pub balances: Balances,
    /// Estimated gas cost in native decimal units.
    pub gas_estimate: Decimal,
    /// `true` when estimation failed and the conservative constant was
    /// substituted.
    pub estimate_degraded: bool,
}

impl FundingSnapshot {
    /// Whether the asset balance covers `amount`.
    #[must_use]
    pub fn asset_sufficient(&self, amount: Decimal) -> bool {
        self.balances.asset >= amount
    }

    /// Whether the gas balance covers the estimate.
    #[must_use]
    pub fn gas_sufficient(&self) -> bool {
        self.balances.gas > self.gas_estimate
    }
}

/// One payment wire protocol: detection, extraction, repair, validation,
/// signing, and presentation.
#[async_trait]
pub trait ProtocolDescriptor: Send + Sync {
    /// Stable identifier of this protocol.
    fn id(&self) -> &'static str;

    /// Cheap structural match against a normalized payload.
    ///
    /// Must never panic on hostile input; the detector additionally
    /// isolates panics and treats them as non-matches.
    fn matches(&self, payload: &Value) -> bool;

    /// Strict extraction of a [`PaymentChallenge`] from a matched payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] when the payload matched cheaply but does
    /// not survive strict parsing.
    fn extract(&self, payload: &Value) -> Result<PaymentChallenge, ProtocolError>;

    /// Whether a replayed template belongs to this protocol.
    fn matches_template(&self, template: &TransactionTemplate) -> bool;

    /// Protocol-specific corruption repair, limited to one known failure
    /// mode. Must be idempotent and must never guess outside its window.
    fn repair(&self, template: TransactionTemplate) -> TransactionTemplate;

    /// Validates a (repaired) template.
    ///
    /// # Errors
    ///
    /// Returns every validation failure verbatim; callers must not coerce.
    fn validate(&self, template: &TransactionTemplate) -> Result<(), Vec<String>>;

    /// Recomputes the required amount from the final transaction payload
    /// itself, never from an earlier challenge.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if no amount can be derived.
    fn required_amount(&self, template: &TransactionTemplate) -> Result<Decimal, ProtocolError>;

    /// Signs the template into a payment artifact.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Signing`] when the signer fails.
    async fn sign(
        &self,
        template: &TransactionTemplate,
        signer: &dyn Signer,
    ) -> Result<SignedPayment, ProtocolError>;

    /// Turns a signed artifact into one-time payment headers.
    fn build_headers(&self, signed: &SignedPayment) -> Result<HeaderSet, ProtocolError>;

    /// Renders a human-readable payment summary.
    fn describe_for_human(&self, challenge: &PaymentChallenge, funding: &FundingSnapshot)
    -> String;

    /// Renders machine-actionable agent instructions, including the exact
    /// replay shape.
    fn describe_for_agent(&self, challenge: &PaymentChallenge) -> Value;
}

/// Explicit, ordered registry of protocol descriptors.
///
/// Mutable only by append-if-absent; list position is priority rank.
#[derive(Clone)]
pub struct ProtocolRegistry {
    descriptors: Vec<Arc<dyn ProtocolDescriptor>>,
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field(
                "descriptors",
                &self.descriptors.iter().map(|d| d.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptors: Vec::new(),
        }
    }

    /// The standard registry: atomic-unit x402 first, decimal fallback last.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(X402Descriptor::new()));
        registry.register(Arc::new(DecimalFallbackDescriptor::new()));
        registry
    }

    /// Appends a descriptor unless one with the same id is already present.
    ///
    /// Returns `true` if the descriptor was added.
    pub fn register(&mut self, descriptor: Arc<dyn ProtocolDescriptor>) -> bool {
        if self.descriptors.iter().any(|d| d.id() == descriptor.id()) {
            return false;
        }
        self.descriptors.push(descriptor);
        true
    }

    /// Iterates descriptors in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProtocolDescriptor>> {
        self.descriptors.iter()
    }

    /// Looks up a descriptor by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn ProtocolDescriptor>> {
        self.descriptors.iter().find(|d| d.id() == id)
    }

    /// Finds the highest-priority descriptor claiming `template`.
    #[must_use]
    pub fn for_template(
        &self,
        template: &TransactionTemplate,
    ) -> Option<&Arc<dyn ProtocolDescriptor>> {
        self.descriptors
            .iter()
            .find(|d| d.matches_template(template))
    }

    /// Returns the number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns `true` if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// The agent-facing approval instructions shared by all protocols.
///
/// The wording is deliberate: agents must surface the cost and wait for an
/// explicit human decision before replaying with approval fields.
#[must_use]
pub(crate) fn replay_instructions(template: Option<&TransactionTemplate>) -> Value {
    let transaction = template
        .and_then(|t| serde_json::to_value(t).ok())
        .unwrap_or(Value::Null);
    json!({
        "instructions": [
            "Do not approve this payment automatically.",
            "Present the amount and cost breakdown to the user and ask for approval.",
            "Wait for the user's explicit decision before continuing.",
            "If the user approves, call the same method again with the same arguments plus the approval fields shown in 'replay'.",
        ],
        "replay": {
            "approved": true,
            "transaction": transaction,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_append_if_absent() {
        let mut registry = ProtocolRegistry::standard();
        let before = registry.len();
        assert!(!registry.register(Arc::new(X402Descriptor::new())));
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn test_standard_priority_order() {
        let registry = ProtocolRegistry::standard();
        let ids: Vec<_> = registry.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["x402", "payment-required"]);
    }

    #[test]
    fn test_header_set_merge_other_wins() {
        let mut base = HeaderSet::new();
        base.insert("X-A", "1");
        base.insert("X-B", "1");
        let mut over = HeaderSet::new();
        over.insert("X-B", "2");
        base.merge(over);
        assert_eq!(base.get("X-A"), Some("1"));
        assert_eq!(base.get("X-B"), Some("2"));
    }

    #[test]
    fn test_template_serde_camel_case() {
        let template = TransactionTemplate {
            to: "0x0000000000000000000000000000000000000001".to_owned(),
            data: None,
            value: Some("1000000".to_owned()),
            chain_id: Some(8453),
            gas_limit: None,
            extension: None,
        };
        let value = serde_json::to_value(&template).unwrap();
        assert_eq!(value["chainId"], 8453);
        assert!(value.get("gasLimit").is_none());
    }
}
