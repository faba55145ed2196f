//! The decimal fallback payment protocol descriptor.
//!
//! Wire shape of the challenge:
//!
//! ```json
//! {
//!   "error": "payment_required",
//!   "code": 402,
//!   "amount": "1.50",
//!   "currency": "USDC",
//!   "description": "Access fee",
//!   "transaction": { "to": "0x…", "data": "0x…", "chainId": 8453 }
//! }
//! ```
//!
//! Amounts are human decimal strings. The server supplies the transaction
//! template directly; signing produces a broadcastable artifact rather
//! than a detached authorization.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};

use super::x402::PAYMENT_PROTOCOL_HEADER;
use super::{
    FundingSnapshot, HeaderSet, PaymentChallenge, ProtocolDescriptor, SignedPayment,
    TransactionTemplate, replay_instructions,
};
use crate::amount::{atomic_to_decimal, parse_decimal};
use crate::error::ProtocolError;
use crate::networks;
use crate::signer::Signer;

/// Header carrying the signed transaction artifact.
pub const X_PAYMENT_TRANSACTION_HEADER: &str = "X-PAYMENT-TRANSACTION";

/// Protocol identifier.
pub const PROTOCOL_ID: &str = "payment-required";

/// Function selector of ERC-20 `transfer(address,uint256)`.
const TRANSFER_SELECTOR: &str = "a9059cbb";

/// Hex-digit length of selector + two ABI words.
const TRANSFER_CALLDATA_LEN: usize = 8 + 64 + 64;

/// The wire challenge body.
#[derive(Debug, Clone, Deserialize)]
struct DecimalChallenge {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    amount: String,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    transaction: Option<TransactionTemplate>,
}

/// Descriptor for the decimal fallback protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecimalFallbackDescriptor;

impl DecimalFallbackDescriptor {
    /// Creates the descriptor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Decodes the amount word out of ERC-20 `transfer` calldata.
fn transfer_calldata_amount(data: &str) -> Option<U256> {
    let digits = data.strip_prefix("0x").unwrap_or(data);
    if digits.len() < TRANSFER_CALLDATA_LEN || !digits.starts_with(TRANSFER_SELECTOR) {
        return None;
    }
    let word = &digits[8 + 64..TRANSFER_CALLDATA_LEN];
    U256::from_str_radix(word, 16).ok()
}

#[async_trait]
impl ProtocolDescriptor for DecimalFallbackDescriptor {
    fn id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn matches(&self, payload: &Value) -> bool {
        let marked = payload.get("error").and_then(Value::as_str) == Some("payment_required")
            || payload.get("code").and_then(Value::as_i64) == Some(402);
        marked && payload.get("amount").is_some()
    }

    fn extract(&self, payload: &Value) -> Result<PaymentChallenge, ProtocolError> {
        let challenge: DecimalChallenge = serde_json::from_value(payload.clone())?;
        if challenge.error.as_deref() != Some("payment_required") && challenge.code != Some(402) {
            return Err(ProtocolError::Mismatch(
                "payload carries no payment_required marker".to_owned(),
            ));
        }
        let amount = parse_decimal(&challenge.amount)?;
        Ok(PaymentChallenge {
            amount,
            currency: challenge.currency.unwrap_or_else(|| "USDC".to_owned()),
            description: challenge
                .description
                .unwrap_or_else(|| "paid resource".to_owned()),
            template: challenge.transaction,
            protocol_id: PROTOCOL_ID,
        })
    }

    fn matches_template(&self, _template: &TransactionTemplate) -> bool {
        // Catch-all: this descriptor sits last in the standard registry.
        true
    }

    fn repair(&self, template: TransactionTemplate) -> TransactionTemplate {
        // No known corruption mode for this protocol; repair is identity.
        template
    }

    fn validate(&self, template: &TransactionTemplate) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if template.to.parse::<Address>().is_err() {
            errors.push(format!("'to' is not a valid address: {}", template.to));
        }
        if let Some(chain_id) = template.chain_id
            && networks::by_chain_id(chain_id).is_none()
        {
            errors.push(format!(
                "chainId {chain_id} is not a supported network (supported: {:?})",
                networks::supported_chain_ids()
            ));
        }
        if let Some(data) = &template.data {
            let digits = data.strip_prefix("0x").unwrap_or(data);
            if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
                errors.push("'data' is not valid hex".to_owned());
            }
        }
        if template.data.is_none()
            && template
                .value
                .as_deref()
                .is_none_or(|v| parse_decimal(v).is_err())
        {
            errors.push("template carries neither transfer calldata nor a decimal value".to_owned());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn required_amount(&self, template: &TransactionTemplate) -> Result<Decimal, ProtocolError> {
        // Prefer the calldata: it is what actually executes, so a tampered
        // or stale surface amount cannot win.
        if let Some(atomic) = template.data.as_deref().and_then(transfer_calldata_amount) {
            let decimals = template
                .chain_id
                .and_then(networks::by_chain_id)
                .map_or(networks::DEFAULT_TOKEN_DECIMALS, |info| info.decimals);
            return Ok(atomic_to_decimal(&atomic.to_string(), decimals)?);
        }
        let value = template.value.as_deref().ok_or_else(|| {
            ProtocolError::Malformed("template carries no derivable amount".to_owned())
        })?;
        Ok(parse_decimal(value)?)
    }

    async fn sign(
        &self,
        template: &TransactionTemplate,
        signer: &dyn Signer,
    ) -> Result<SignedPayment, ProtocolError> {
        let artifact = signer.sign_transaction(template).await?;
        Ok(SignedPayment {
            protocol_id: PROTOCOL_ID.to_owned(),
            artifact: json!({ "transaction": artifact }),
        })
    }

    fn build_headers(&self, signed: &SignedPayment) -> Result<HeaderSet, ProtocolError> {
        let transaction = signed
            .artifact
            .get("transaction")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProtocolError::Malformed("signed artifact carries no transaction".to_owned())
            })?;
        let mut headers = HeaderSet::new();
        headers.insert(X_PAYMENT_TRANSACTION_HEADER, transaction);
        headers.insert(PAYMENT_PROTOCOL_HEADER, PROTOCOL_ID);
        Ok(headers)
    }

    fn describe_for_human(
        &self,
        challenge: &PaymentChallenge,
        funding: &FundingSnapshot,
    ) -> String {
        let mut lines = vec![
            format!(
                "Payment required: {} {} — {}",
                challenge.amount.normalize(),
                challenge.currency,
                challenge.description
            ),
            format!(
                "Asset balance: {} ({})",
                funding.balances.asset.normalize(),
                if funding.asset_sufficient(challenge.amount) {
                    "sufficient"
                } else {
                    "INSUFFICIENT"
                }
            ),
            format!(
                "Gas balance: {} (estimated cost {}, {})",
                funding.balances.gas.normalize(),
                funding.gas_estimate.normalize(),
                if funding.gas_sufficient() {
                    "sufficient"
                } else {
                    "INSUFFICIENT"
                }
            ),
        ];
        if funding.estimate_degraded {
            lines.push(
                "Warning: gas estimation failed; a conservative fallback estimate is shown."
                    .to_owned(),
            );
        }
        lines.join("\n")
    }

    fn describe_for_agent(&self, challenge: &PaymentChallenge) -> Value {
        let mut value = replay_instructions(challenge.template.as_ref());
        if let Some(obj) = value.as_object_mut() {
            obj.insert("protocol".to_owned(), Value::String(PROTOCOL_ID.to_owned()));
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Value {
        json!({
            "error": "payment_required",
            "code": 402,
            "amount": "1.50",
            "currency": "USDC",
            "description": "Access fee",
            "transaction": {
                "to": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
                "data": transfer_data("1500000"),
                "chainId": 8453
            }
        })
    }

    /// Builds `transfer(to, amount)` calldata with the given atomic amount.
    fn transfer_data(atomic: &str) -> String {
        let amount: U256 = atomic.parse().unwrap();
        format!(
            "0x{TRANSFER_SELECTOR}{:0>64}{:064x}",
            "209693bc6afc0c5328ba36faf03c514ef312287c", amount
        )
    }

    #[test]
    fn test_matches_either_marker() {
        let descriptor = DecimalFallbackDescriptor::new();
        assert!(descriptor.matches(&json!({"error": "payment_required", "amount": "1"})));
        assert!(descriptor.matches(&json!({"code": 402, "amount": "1"})));
        assert!(!descriptor.matches(&json!({"code": 402})));
        assert!(!descriptor.matches(&json!({"error": "rate_limited", "amount": "1"})));
    }

    #[test]
    fn test_extract_decimal_amount() {
        let descriptor = DecimalFallbackDescriptor::new();
        let challenge = descriptor.extract(&sample_payload()).unwrap();
        assert_eq!(challenge.amount, "1.5".parse::<Decimal>().unwrap());
        assert!(challenge.template.is_some());
    }

    #[test]
    fn test_required_amount_prefers_calldata() {
        let descriptor = DecimalFallbackDescriptor::new();
        let template = TransactionTemplate {
            to: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".to_owned(),
            data: Some(transfer_data("2000000")),
            // Tampered surface value; the calldata word must win.
            value: Some("0.01".to_owned()),
            chain_id: Some(8453),
            gas_limit: None,
            extension: None,
        };
        let amount = descriptor.required_amount(&template).unwrap();
        assert_eq!(amount, "2".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_required_amount_falls_back_to_value() {
        let descriptor = DecimalFallbackDescriptor::new();
        let template = TransactionTemplate {
            to: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".to_owned(),
            data: None,
            value: Some("0.75".to_owned()),
            chain_id: Some(8453),
            gas_limit: None,
            extension: None,
        };
        assert_eq!(
            descriptor.required_amount(&template).unwrap(),
            "0.75".parse::<Decimal>().unwrap()
        );
    }

    #[test]
    fn test_repair_is_identity() {
        let descriptor = DecimalFallbackDescriptor::new();
        let template = TransactionTemplate {
            to: "anything".to_owned(),
            data: None,
            value: None,
            chain_id: None,
            gas_limit: None,
            extension: None,
        };
        assert_eq!(descriptor.repair(template.clone()), template);
    }

    #[test]
    fn test_validate_unknown_chain() {
        let descriptor = DecimalFallbackDescriptor::new();
        let template = TransactionTemplate {
            to: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".to_owned(),
            data: None,
            value: Some("1.0".to_owned()),
            chain_id: Some(1),
            gas_limit: None,
            extension: None,
        };
        let errors = descriptor.validate(&template).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("chainId 1")));
    }
}
