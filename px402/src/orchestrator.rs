//! The stateless payment orchestrator.
//!
//! Two entry points, both fully reconstructible from the messages they are
//! handed: [`PaymentOrchestrator::enrich_challenge`] turns a detected
//! challenge into something a human and an agent can act on, and
//! [`PaymentOrchestrator::authorize`] turns an approved replay into
//! one-time payment headers. No field of the orchestrator persists between
//! the two calls — the signer handle and the protocol registry are
//! configuration, not session state.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{Value, json};

use crate::detect::{Detection, ProtocolDetector, parse_lenient};
use crate::error::{InsufficientFunds, codes, structured_error};
use crate::message::{Message, Request, Response};
use crate::protocol::{
    FundingSnapshot, HeaderSet, PaymentChallenge, ProtocolRegistry, TransactionTemplate,
};
use crate::signer::{Balances, Signer};

/// Conservative gas-cost substitute when estimation fails, in native
/// decimal units. Deliberately generous for a simple token transfer so a
/// degraded estimate errs toward "insufficient" rather than a surprise
/// mid-payment failure.
pub const FALLBACK_GAS_COST: Decimal = Decimal::from_parts(5, 0, 0, false, 4);

/// Remediation boilerplate appended to every retryable failure.
const RETRY_HINT: &str = "then retry the original call with the same parameters";

/// Stateless challenge enrichment and payment authorization.
pub struct PaymentOrchestrator {
    signer: Arc<dyn Signer>,
    detector: ProtocolDetector,
}

impl std::fmt::Debug for PaymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentOrchestrator")
            .field("detector", &self.detector)
            .finish_non_exhaustive()
    }
}

/// Whether a request carries explicit payment-approval markers.
///
/// The proxy uses this to decide when to route a local→remote message
/// through [`PaymentOrchestrator::authorize`].
#[must_use]
pub fn has_approval_markers(request: &Request) -> bool {
    request
        .arguments()
        .and_then(|args| args.get("approved"))
        .is_some_and(approved_flag)
}

fn approved_flag(value: &Value) -> bool {
    matches!(value, Value::Bool(true)) || value.as_str() == Some("true")
}

impl PaymentOrchestrator {
    /// Creates an orchestrator over the standard protocol registry.
    #[must_use]
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self {
            signer,
            detector: ProtocolDetector::standard(),
        }
    }

    /// Creates an orchestrator over a caller-supplied registry.
    #[must_use]
    pub fn with_registry(signer: Arc<dyn Signer>, registry: ProtocolRegistry) -> Self {
        Self {
            signer,
            detector: ProtocolDetector::new(registry),
        }
    }

    /// Returns the detector this orchestrator shares with the proxy.
    #[must_use]
    pub fn detector(&self) -> &ProtocolDetector {
        &self.detector
    }

    /// Entry A: enriches a detected payment challenge for consumption.
    ///
    /// Non-challenges and strict-extraction failures return the original
    /// message unchanged; signer failures return a structured error
    /// response in its place. Estimation failure alone never fails the
    /// flow — a conservative constant is substituted and annotated.
    pub async fn enrich_challenge(
        &self,
        response: &Message,
        last_request: Option<&Request>,
    ) -> Message {
        let Some(detection) = self.detector.detect(response) else {
            return response.clone();
        };
        let challenge = match detection.descriptor.extract(&detection.payload) {
            Ok(challenge) => challenge,
            Err(err) => {
                tracing::warn!(
                    protocol = detection.protocol_id,
                    error = %err,
                    "challenge matched cheaply but failed strict extraction"
                );
                return response.clone();
            }
        };
        let id = response.id().cloned().unwrap_or(Value::Null);

        if let Some(chain_id) = challenge.template.as_ref().and_then(|t| t.chain_id)
            && let Err(err) = self.signer.configure_for_chain(chain_id).await
        {
            return structured_error(
                id,
                codes::CHAIN_CONFIGURATION,
                format!("cannot configure signer for chain {chain_id}: {err}"),
                format!("point the signer at a supported network, {RETRY_HINT}"),
                Some(json!({ "error": "ChainConfigurationError", "chainId": chain_id })),
            );
        }

        let balances = match self.signer.balances().await {
            Ok(balances) => balances,
            Err(err) => {
                return structured_error(
                    id,
                    codes::BALANCE_UNAVAILABLE,
                    format!("balance query failed: {err}"),
                    format!("check signer connectivity and funding, {RETRY_HINT}"),
                    Some(json!({ "error": "BalanceUnavailable" })),
                );
            }
        };

        let funding = self
            .funding_snapshot(challenge.template.as_ref(), balances)
            .await;
        let enrichment = self.build_enrichment(&detection, &challenge, &funding, last_request);
        attach_enrichment(response, id, enrichment)
    }

    /// Entry B: validates and signs an approved payment replay.
    ///
    /// # Errors
    ///
    /// Returns a structured error response (ready to send to the local
    /// side) for every failure mode; nothing is dropped silently.
    pub async fn authorize(&self, request: &Request) -> Result<HeaderSet, Box<Message>> {
        let id = request.id.clone().unwrap_or(Value::Null);
        let args = request.arguments().ok_or_else(|| {
            Box::new(structured_error(
                id.clone(),
                codes::INVALID_APPROVAL,
                "approval replay carries no arguments",
                "replay the call with {approved: true, transaction: <template>}",
                None,
            ))
        })?;

        if !args.get("approved").is_some_and(approved_flag) {
            return Err(Box::new(structured_error(
                id,
                codes::INVALID_APPROVAL,
                "approval flag is missing or not true",
                "replay the call with approved set to true",
                None,
            )));
        }
        let raw_template = args.get("transaction").ok_or_else(|| {
            Box::new(structured_error(
                id.clone(),
                codes::INVALID_APPROVAL,
                "approval replay carries no transaction template",
                "replay the call including the transaction template from the challenge",
                None,
            ))
        })?;

        let template = parse_template(raw_template).ok_or_else(|| {
            Box::new(structured_error(
                id.clone(),
                codes::INVALID_APPROVAL,
                "transaction template could not be parsed",
                "replay the call with the template exactly as provided in the challenge",
                None,
            ))
        })?;

        let descriptor = self
            .detector
            .registry()
            .for_template(&template)
            .ok_or_else(|| {
                Box::new(structured_error(
                    id.clone(),
                    codes::INVALID_APPROVAL,
                    "no registered payment protocol claims this template",
                    "replay the call with an unmodified template from the challenge",
                    None,
                ))
            })?;

        let repaired = descriptor.repair(template);

        if let Err(errors) = descriptor.validate(&repaired) {
            return Err(Box::new(structured_error(
                id,
                codes::DATA_CORRUPTION,
                "transaction template failed validation",
                "fix the listed fields and replay with the same parameters",
                Some(json!({ "error": "DataCorruptionError", "validationErrors": errors })),
            )));
        }

        // The amount comes from the final payload itself, never from a
        // remembered challenge a tampered replay could contradict.
        let required = match descriptor.required_amount(&repaired) {
            Ok(amount) => amount,
            Err(err) => {
                return Err(Box::new(structured_error(
                    id,
                    codes::DATA_CORRUPTION,
                    format!("cannot derive required amount from template: {err}"),
                    "replay with an unmodified template from the challenge",
                    Some(json!({ "error": "DataCorruptionError" })),
                )));
            }
        };

        if let Some(chain_id) = repaired.chain_id
            && let Err(err) = self.signer.configure_for_chain(chain_id).await
        {
            return Err(Box::new(structured_error(
                id,
                codes::CHAIN_CONFIGURATION,
                format!("cannot configure signer for chain {chain_id}: {err}"),
                format!("point the signer at a supported network, {RETRY_HINT}"),
                Some(json!({ "error": "ChainConfigurationError", "chainId": chain_id })),
            )));
        }

        let balances = match self.signer.balances().await {
            Ok(balances) => balances,
            Err(err) => {
                return Err(Box::new(structured_error(
                    id,
                    codes::BALANCE_UNAVAILABLE,
                    format!("balance query failed: {err}"),
                    format!("check signer connectivity, {RETRY_HINT}"),
                    Some(json!({ "error": "BalanceUnavailable" })),
                )));
            }
        };

        if balances.asset < required {
            let shortfall = InsufficientFunds::Asset {
                required,
                available: balances.asset,
                shortfall: required - balances.asset,
            };
            return Err(Box::new(structured_error(
                id,
                codes::INSUFFICIENT_FUNDS,
                shortfall.to_string(),
                format!("fund the payer address with the shortfall, {RETRY_HINT}"),
                Some(shortfall_detail(&shortfall)),
            )));
        }

        let funding = self.funding_snapshot(Some(&repaired), balances).await;
        if !funding.gas_sufficient() {
            let shortfall = InsufficientFunds::Gas {
                required: funding.gas_estimate,
                available: balances.gas,
            };
            return Err(Box::new(structured_error(
                id,
                codes::INSUFFICIENT_FUNDS,
                shortfall.to_string(),
                format!("fund the payer address with native gas, {RETRY_HINT}"),
                Some(shortfall_detail(&shortfall)),
            )));
        }

        let signed = match descriptor.sign(&repaired, self.signer.as_ref()).await {
            Ok(signed) => signed,
            Err(err) => {
                return Err(Box::new(structured_error(
                    id,
                    codes::SIGNING_FAILED,
                    format!("payment signing failed: {err}"),
                    format!("check the signer, {RETRY_HINT}"),
                    Some(json!({ "error": "SigningError" })),
                )));
            }
        };
        descriptor.build_headers(&signed).map_err(|err| {
            Box::new(structured_error(
                id,
                codes::SIGNING_FAILED,
                format!("payment header construction failed: {err}"),
                format!("check the signer, {RETRY_HINT}"),
                Some(json!({ "error": "SigningError" })),
            ))
        })
    }

    /// Estimates gas for the template, substituting [`FALLBACK_GAS_COST`]
    /// when estimation fails or no template exists.
    async fn funding_snapshot(
        &self,
        template: Option<&TransactionTemplate>,
        balances: Balances,
    ) -> FundingSnapshot {
        let (gas_estimate, estimate_degraded) = match template {
            Some(template) => match self.signer.estimate_cost(template).await {
                Ok(estimate) => (estimate, false),
                Err(err) => {
                    tracing::warn!(error = %err, "gas estimation failed; using fallback constant");
                    (FALLBACK_GAS_COST, true)
                }
            },
            None => (FALLBACK_GAS_COST, true),
        };
        FundingSnapshot {
            balances,
            gas_estimate,
            estimate_degraded,
        }
    }

    fn build_enrichment(
        &self,
        detection: &Detection,
        challenge: &PaymentChallenge,
        funding: &FundingSnapshot,
        last_request: Option<&Request>,
    ) -> Value {
        let asset_ok = funding.asset_sufficient(challenge.amount);
        let gas_ok = funding.gas_sufficient();
        let total = challenge.amount + funding.gas_estimate;

        let mut warnings: Vec<String> = Vec::new();
        if funding.estimate_degraded {
            warnings
                .push("gas estimation unavailable; showing a conservative fallback".to_owned());
        }
        if !asset_ok {
            warnings.push(format!(
                "asset balance is short by {}",
                (challenge.amount - funding.balances.asset).normalize()
            ));
        }
        if !gas_ok {
            warnings.push("gas balance does not cover the estimated cost".to_owned());
        }

        let mut agent = detection.descriptor.describe_for_agent(challenge);
        if let (Some(obj), Some(request)) = (agent.as_object_mut(), last_request) {
            // Anchor the replay to the request that triggered the challenge.
            obj.insert(
                "replayMethod".to_owned(),
                Value::String(request.method.clone()),
            );
            if let Some(params) = &request.params {
                obj.insert("replayParams".to_owned(), params.clone());
            }
        }

        json!({
            "payment": {
                "protocol": detection.protocol_id,
                "amount": challenge.amount.normalize().to_string(),
                "currency": challenge.currency,
                "description": challenge.description,
            },
            "funding": {
                "assetBalance": funding.balances.asset.normalize().to_string(),
                "gasBalance": funding.balances.gas.normalize().to_string(),
                "gasEstimate": funding.gas_estimate.normalize().to_string(),
                "estimateDegraded": funding.estimate_degraded,
                "assetSufficient": asset_ok,
                "gasSufficient": gas_ok,
            },
            "costBreakdown": {
                "amount": challenge.amount.normalize().to_string(),
                "estimatedGas": funding.gas_estimate.normalize().to_string(),
                "total": total.normalize().to_string(),
            },
            "humanSummary": detection.descriptor.describe_for_human(challenge, funding),
            "agent": agent,
            "warnings": warnings,
        })
    }
}

/// Shortfall data tagged with the error class name.
fn shortfall_detail(shortfall: &InsufficientFunds) -> Value {
    let mut detail = shortfall.to_data();
    if let Some(obj) = detail.as_object_mut() {
        obj.insert(
            "error".to_owned(),
            Value::String("InsufficientFundsError".to_owned()),
        );
    }
    detail
}

/// Parses a replayed template from either object or serialized-text form.
fn parse_template(raw: &Value) -> Option<TransactionTemplate> {
    match raw {
        Value::String(text) => serde_json::from_value(parse_lenient(text)?).ok(),
        other => serde_json::from_value(other.clone()).ok(),
    }
}

/// Wraps the enrichment back into a response shaped like the original.
fn attach_enrichment(original: &Message, id: Value, enrichment: Value) -> Message {
    let Some(response) = original.as_response() else {
        return original.clone();
    };
    if let Some(error) = &response.error {
        let mut data = enrichment;
        if let (Some(obj), Some(prior)) = (data.as_object_mut(), &error.data) {
            obj.insert("original".to_owned(), prior.clone());
        }
        return Message::Response(Response {
            jsonrpc: response.jsonrpc.clone(),
            id,
            result: None,
            error: Some(crate::message::ErrorObject {
                code: error.code,
                message: error.message.clone(),
                data: Some(data),
            }),
        });
    }
    // Result-carrying original: replace the result with a content item
    // holding the serialized enrichment.
    let text = enrichment.to_string();
    Message::result_response(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": true,
        }),
    )
}
