//! The atomic-unit (x402) payment protocol descriptor.
//!
//! Wire shape of the challenge:
//!
//! ```json
//! {
//!   "x402Version": 1,
//!   "accepts": [{
//!     "scheme": "exact",
//!     "network": "base-sepolia",
//!     "maxAmountRequired": "1000000",
//!     "resource": "mcp://tool/lookup",
//!     "description": "One lookup",
//!     "payTo": "0x…",
//!     "asset": "0x…",
//!     "maxTimeoutSeconds": 600,
//!     "extra": { "name": "USD Coin", "version": "2" }
//!   }],
//!   "error": null
//! }
//! ```
//!
//! Amounts are pure-integer atomic units; a decimal point is a format
//! violation. Payment is authorized via an ERC-3009
//! `TransferWithAuthorization` signed as detached EIP-712 typed data and
//! shipped in a Base64 `X-PAYMENT` header.

use std::time::SystemTime;

use alloy_primitives::{Address, hex};
use async_trait::async_trait;
use base64::prelude::*;
use rand::RngExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    FundingSnapshot, HeaderSet, PaymentChallenge, ProtocolDescriptor, SignedPayment,
    TransactionTemplate, replay_instructions,
};
use crate::amount::atomic_to_decimal;
use crate::error::ProtocolError;
use crate::networks;
use crate::signer::Signer;

/// Header carrying the Base64-encoded signed payment payload.
pub const X_PAYMENT_HEADER: &str = "X-PAYMENT";

/// Header naming the protocol that produced the payment headers.
pub const PAYMENT_PROTOCOL_HEADER: &str = "X-PAYMENT-PROTOCOL";

/// Protocol identifier.
pub const PROTOCOL_ID: &str = "x402";

/// Default authorization validity window when the offer names no timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Upper bound on the wire-supplied timeout.
///
/// The value is untrusted input; anything past a day is clamped so window
/// arithmetic cannot overflow and authorizations stay short-lived.
const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Backdate applied to `validAfter` to absorb clock skew.
const VALID_AFTER_SKEW_SECS: u64 = 60;

/// Expected hex-digit width of the 32-byte authorization nonce.
const NONCE_HEX_WIDTH: usize = 64;

/// Minimum plausible hex-digit width for a truncated nonce.
///
/// Below this the field is not a short nonce, it is garbage; repair must
/// not guess.
const NONCE_MIN_PLAUSIBLE_WIDTH: usize = 32;

/// One entry of the challenge's `accepts` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtomicOffer {
    scheme: String,
    network: String,
    max_amount_required: String,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    description: Option<String>,
    pay_to: String,
    #[serde(default)]
    asset: Option<String>,
    #[serde(default)]
    max_timeout_seconds: Option<u64>,
    #[serde(default)]
    extra: Option<OfferExtra>,
}

/// EIP-712 domain overrides carried in an offer's `extra`.
#[derive(Debug, Clone, Deserialize)]
struct OfferExtra {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Descriptor for the atomic-unit x402 protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct X402Descriptor;

impl X402Descriptor {
    /// Creates the descriptor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    format!("0x{}", hex::encode(bytes))
}

/// Returns the detached authorization object inside a template, if any.
fn authorization(template: &TransactionTemplate) -> Option<&Value> {
    template.extension.as_ref()?.get("authorization")
}

fn extension_str<'a>(template: &'a TransactionTemplate, key: &str) -> Option<&'a str> {
    template.extension.as_ref()?.get(key)?.as_str()
}

fn is_pure_integer(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[async_trait]
impl ProtocolDescriptor for X402Descriptor {
    fn id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn matches(&self, payload: &Value) -> bool {
        payload.get("x402Version").is_some()
            && payload.get("accepts").is_some_and(Value::is_array)
    }

    fn extract(&self, payload: &Value) -> Result<PaymentChallenge, ProtocolError> {
        let accepts = payload
            .get("accepts")
            .and_then(Value::as_array)
            .ok_or_else(|| ProtocolError::Malformed("missing accepts list".to_owned()))?;

        // First strictly-parseable offer wins; the list is already in the
        // server's preference order.
        let offer = accepts
            .iter()
            .find_map(|entry| serde_json::from_value::<AtomicOffer>(entry.clone()).ok())
            .ok_or_else(|| ProtocolError::Malformed("no parseable accepts entry".to_owned()))?;

        let info = networks::by_name(&offer.network)
            .ok_or_else(|| ProtocolError::UnknownNetwork(offer.network.clone()))?;

        let amount = atomic_to_decimal(&offer.max_amount_required, info.decimals)?;

        let asset = match &offer.asset {
            Some(raw) => raw
                .parse::<Address>()
                .map_err(|_| ProtocolError::Malformed(format!("invalid asset address '{raw}'")))?,
            None => info.asset,
        };

        let now = now_secs();
        let timeout = offer
            .max_timeout_seconds
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);
        let extra = offer.extra.as_ref();
        let authorization = json!({
            // Filled with the signer's address at signing time.
            "from": "",
            "to": offer.pay_to,
            "value": offer.max_amount_required,
            "validAfter": (now.saturating_sub(VALID_AFTER_SKEW_SECS)).to_string(),
            "validBefore": now.saturating_add(timeout).to_string(),
            "nonce": random_nonce(),
        });

        let template = TransactionTemplate {
            to: asset.to_string(),
            data: None,
            value: Some(offer.max_amount_required.clone()),
            chain_id: Some(info.chain_id),
            gas_limit: None,
            extension: Some(json!({
                "scheme": offer.scheme,
                "network": offer.network,
                "payTo": offer.pay_to,
                "asset": asset.to_string(),
                "assetName": extra.and_then(|e| e.name.clone()).unwrap_or_else(|| info.asset_name.to_owned()),
                "assetVersion": extra.and_then(|e| e.version.clone()).unwrap_or_else(|| info.asset_version.to_owned()),
                "resource": offer.resource.clone(),
                "authorization": authorization,
            })),
        };

        let description = offer
            .description
            .filter(|d| !d.is_empty())
            .or(offer.resource)
            .unwrap_or_else(|| "paid resource".to_owned());

        Ok(PaymentChallenge {
            amount,
            currency: "USDC".to_owned(),
            description,
            template: Some(template),
            protocol_id: PROTOCOL_ID,
        })
    }

    fn matches_template(&self, template: &TransactionTemplate) -> bool {
        authorization(template).is_some()
    }

    fn repair(&self, mut template: TransactionTemplate) -> TransactionTemplate {
        // One known corruption: the fixed-width nonce loses leading zeros
        // in transit. Left-pad back to 32 bytes, but only when the observed
        // width is plausible for that failure mode.
        let Some(nonce) = authorization(&template)
            .and_then(|auth| auth.get("nonce"))
            .and_then(Value::as_str)
        else {
            return template;
        };
        let digits = nonce.strip_prefix("0x").unwrap_or(nonce);
        let plausible = digits.len() >= NONCE_MIN_PLAUSIBLE_WIDTH
            && digits.len() < NONCE_HEX_WIDTH
            && digits.bytes().all(|b| b.is_ascii_hexdigit());
        if !plausible {
            return template;
        }
        let width = NONCE_HEX_WIDTH;
        let repaired = format!("0x{digits:0>width$}");
        if let Some(auth) = template
            .extension
            .as_mut()
            .and_then(|ext| ext.get_mut("authorization"))
            .and_then(Value::as_object_mut)
        {
            auth.insert("nonce".to_owned(), Value::String(repaired));
        }
        template
    }

    fn validate(&self, template: &TransactionTemplate) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if template.to.parse::<Address>().is_err() {
            errors.push(format!("'to' is not a valid address: {}", template.to));
        }
        match template.chain_id {
            None => errors.push("chainId is missing".to_owned()),
            Some(id) if networks::by_chain_id(id).is_none() => {
                errors.push(format!(
                    "chainId {id} is not a supported network (supported: {:?})",
                    networks::supported_chain_ids()
                ));
            }
            Some(_) => {}
        }

        let Some(auth) = authorization(template) else {
            errors.push("authorization extension is missing".to_owned());
            return Err(errors);
        };

        match auth.get("to").and_then(Value::as_str) {
            Some(to) if to.parse::<Address>().is_ok() => {}
            Some(to) => errors.push(format!("authorization 'to' is not a valid address: {to}")),
            None => errors.push("authorization 'to' is missing".to_owned()),
        }
        if let Some(from) = auth.get("from").and_then(Value::as_str)
            && !from.is_empty()
            && from.parse::<Address>().is_err()
        {
            errors.push(format!("authorization 'from' is not a valid address: {from}"));
        }
        match auth.get("value").and_then(Value::as_str) {
            Some(value) if is_pure_integer(value) => {}
            Some(value) => errors.push(format!(
                "authorization 'value' must be a pure integer in atomic units: {value}"
            )),
            None => errors.push("authorization 'value' is missing".to_owned()),
        }
        match auth.get("nonce").and_then(Value::as_str) {
            Some(nonce) => {
                let digits = nonce.strip_prefix("0x").unwrap_or(nonce);
                if digits.len() != NONCE_HEX_WIDTH
                    || !digits.bytes().all(|b| b.is_ascii_hexdigit())
                {
                    errors.push(format!(
                        "authorization nonce must be a 32-byte hex quantity, got {} digits",
                        digits.len()
                    ));
                }
            }
            None => errors.push("authorization nonce is missing".to_owned()),
        }
        let valid_after = auth
            .get("validAfter")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok());
        let valid_before = auth
            .get("validBefore")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok());
        if let (Some(after), Some(before)) = (valid_after, valid_before)
            && after >= before
        {
            errors.push(format!(
                "authorization validity window is empty: validAfter {after} >= validBefore {before}"
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn required_amount(&self, template: &TransactionTemplate) -> Result<Decimal, ProtocolError> {
        let value = authorization(template)
            .and_then(|auth| auth.get("value"))
            .and_then(Value::as_str)
            .or(template.value.as_deref())
            .ok_or_else(|| {
                ProtocolError::Malformed("template carries no payment value".to_owned())
            })?;
        let decimals = template
            .chain_id
            .and_then(networks::by_chain_id)
            .map_or(networks::DEFAULT_TOKEN_DECIMALS, |info| info.decimals);
        Ok(atomic_to_decimal(value, decimals)?)
    }

    async fn sign(
        &self,
        template: &TransactionTemplate,
        signer: &dyn Signer,
    ) -> Result<SignedPayment, ProtocolError> {
        let auth = authorization(template)
            .ok_or_else(|| ProtocolError::Malformed("authorization extension missing".to_owned()))?
            .clone();
        let mut message = auth;
        if let Some(obj) = message.as_object_mut() {
            let from_unset = obj
                .get("from")
                .and_then(Value::as_str)
                .is_none_or(str::is_empty);
            if from_unset {
                obj.insert("from".to_owned(), Value::String(signer.address()));
            }
        }

        let chain_id = template
            .chain_id
            .ok_or_else(|| ProtocolError::Malformed("template has no chainId".to_owned()))?;
        let domain = json!({
            "name": extension_str(template, "assetName").unwrap_or(networks::DEFAULT_USDC_NAME),
            "version": extension_str(template, "assetVersion").unwrap_or(networks::DEFAULT_USDC_VERSION),
            "chainId": chain_id,
            "verifyingContract": template.to,
        });
        let types = json!({
            "TransferWithAuthorization": [
                { "name": "from", "type": "address" },
                { "name": "to", "type": "address" },
                { "name": "value", "type": "uint256" },
                { "name": "validAfter", "type": "uint256" },
                { "name": "validBefore", "type": "uint256" },
                { "name": "nonce", "type": "bytes32" },
            ],
        });

        let signature = signer.sign_typed(&domain, &types, &message).await?;
        let network = extension_str(template, "network").unwrap_or_default().to_owned();
        let scheme = extension_str(template, "scheme").unwrap_or("exact").to_owned();

        Ok(SignedPayment {
            protocol_id: PROTOCOL_ID.to_owned(),
            artifact: json!({
                "x402Version": 1,
                "scheme": scheme,
                "network": network,
                "payload": {
                    "signature": signature,
                    "authorization": message,
                },
            }),
        })
    }

    fn build_headers(&self, signed: &SignedPayment) -> Result<HeaderSet, ProtocolError> {
        let encoded = BASE64_STANDARD.encode(serde_json::to_vec(&signed.artifact)?);
        let mut headers = HeaderSet::new();
        headers.insert(X_PAYMENT_HEADER, encoded);
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
                "Asset balance: {} {} ({})",
                funding.balances.asset.normalize(),
                challenge.currency,
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

    fn sample_challenge() -> Value {
        json!({
            "x402Version": 1,
            "accepts": [{
                "scheme": "exact",
                "network": "base-sepolia",
                "maxAmountRequired": "1000000",
                "resource": "mcp://tool/lookup",
                "description": "One lookup",
                "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
                "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
                "maxTimeoutSeconds": 300,
                "extra": { "name": "USDC", "version": "2" }
            }],
            "error": null
        })
    }

    fn template_with_nonce(nonce: &str) -> TransactionTemplate {
        TransactionTemplate {
            to: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_owned(),
            data: None,
            value: Some("1000000".to_owned()),
            chain_id: Some(84532),
            gas_limit: None,
            extension: Some(json!({
                "scheme": "exact",
                "network": "base-sepolia",
                "authorization": {
                    "from": "",
                    "to": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
                    "value": "1000000",
                    "validAfter": "0",
                    "validBefore": "99999999999",
                    "nonce": nonce,
                },
            })),
        }
    }

    #[test]
    fn test_extract_atomic_amount_as_decimal() {
        let descriptor = X402Descriptor::new();
        let challenge = descriptor.extract(&sample_challenge()).unwrap();
        assert_eq!(challenge.amount, Decimal::ONE);
        assert_eq!(challenge.protocol_id, "x402");
        let template = challenge.template.unwrap();
        assert_eq!(template.chain_id, Some(84532));
        let nonce = authorization(&template)
            .and_then(|a| a.get("nonce"))
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(nonce.len(), 2 + NONCE_HEX_WIDTH);
    }

    #[test]
    fn test_nonce_generation_is_fresh_and_full_width() {
        let first = random_nonce();
        let second = random_nonce();
        assert_eq!(first.len(), 2 + NONCE_HEX_WIDTH);
        assert!(first.strip_prefix("0x").unwrap().bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn test_extract_clamps_absurd_timeout() {
        let descriptor = X402Descriptor::new();
        let mut payload = sample_challenge();
        payload["accepts"][0]["maxTimeoutSeconds"] = json!(u64::MAX);
        // A hostile timeout must not panic extraction or produce an
        // unordered validity window.
        let challenge = descriptor.extract(&payload).unwrap();
        let template = challenge.template.unwrap();
        let auth = authorization(&template).unwrap();
        let after: u64 = auth["validAfter"].as_str().unwrap().parse().unwrap();
        let before: u64 = auth["validBefore"].as_str().unwrap().parse().unwrap();
        assert!(after < before);
        assert!(before - after <= MAX_TIMEOUT_SECS + VALID_AFTER_SKEW_SECS);
    }

    #[test]
    fn test_extract_rejects_decimal_point_amount() {
        let descriptor = X402Descriptor::new();
        let mut payload = sample_challenge();
        payload["accepts"][0]["maxAmountRequired"] = json!("1.5");
        assert!(descriptor.extract(&payload).is_err());
    }

    #[test]
    fn test_extract_unknown_network() {
        let descriptor = X402Descriptor::new();
        let mut payload = sample_challenge();
        payload["accepts"][0]["network"] = json!("mainnet-of-nowhere");
        assert!(matches!(
            descriptor.extract(&payload),
            Err(ProtocolError::UnknownNetwork(_))
        ));
    }

    #[test]
    fn test_repair_pads_short_nonce() {
        let descriptor = X402Descriptor::new();
        let short = format!("0x{}", "a".repeat(40));
        let repaired = descriptor.repair(template_with_nonce(&short));
        let nonce = authorization(&repaired)
            .and_then(|a| a.get("nonce"))
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(nonce.len(), 2 + NONCE_HEX_WIDTH);
        assert!(nonce.starts_with(&format!("0x{}", "0".repeat(24))));
    }

    #[test]
    fn test_repair_is_idempotent() {
        let descriptor = X402Descriptor::new();
        let short = format!("0x{}", "b".repeat(33));
        let once = descriptor.repair(template_with_nonce(&short));
        let twice = descriptor.repair(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_repair_never_guesses_outside_window() {
        let descriptor = X402Descriptor::new();
        // Too short to be a truncated nonce.
        let garbage = format!("0x{}", "c".repeat(8));
        let untouched = descriptor.repair(template_with_nonce(&garbage));
        let nonce = authorization(&untouched)
            .and_then(|a| a.get("nonce"))
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(nonce, garbage);
        // Non-hex content is never padded either.
        let not_hex = format!("0x{}", "z".repeat(40));
        let untouched = descriptor.repair(template_with_nonce(&not_hex));
        let nonce = authorization(&untouched)
            .and_then(|a| a.get("nonce"))
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(nonce, not_hex);
    }

    #[test]
    fn test_validate_accepts_repaired_template() {
        let descriptor = X402Descriptor::new();
        let template = descriptor.repair(template_with_nonce(&format!("0x{}", "d".repeat(40))));
        assert!(descriptor.validate(&template).is_ok());
    }

    #[test]
    fn test_validate_reports_all_errors_verbatim() {
        let descriptor = X402Descriptor::new();
        let mut template = template_with_nonce("0xdeadbeef");
        template.to = "not-an-address".to_owned();
        template.chain_id = Some(1);
        let errors = descriptor.validate(&template).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("'to' is not a valid address")));
        assert!(errors.iter().any(|e| e.contains("chainId 1")));
        assert!(errors.iter().any(|e| e.contains("nonce")));
    }

    #[test]
    fn test_required_amount_from_final_payload() {
        let descriptor = X402Descriptor::new();
        let mut template = template_with_nonce(&format!("0x{}", "e".repeat(64)));
        // Tampered surface value must not matter: the authorization wins.
        template.value = Some("999999999".to_owned());
        let amount = descriptor.required_amount(&template).unwrap();
        assert_eq!(amount, Decimal::ONE);
    }

    #[test]
    fn test_matches_cheap_detect() {
        let descriptor = X402Descriptor::new();
        assert!(descriptor.matches(&sample_challenge()));
        assert!(!descriptor.matches(&json!({"error": "payment_required"})));
        assert!(!descriptor.matches(&json!({"x402Version": 1, "accepts": "nope"})));
    }
}
