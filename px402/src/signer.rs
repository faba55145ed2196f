//! The external signing collaborator consumed by the payment core.
//!
//! All blockchain-specific work (key custody, balance queries, gas
//! estimation, transaction and typed-data signing, broadcast) lives behind
//! the [`Signer`] trait. The proxy core consumes it and never implements
//! it; callers inject an implementation when constructing the orchestrator.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::networks::UnknownChainError;
use crate::protocol::TransactionTemplate;

/// Asset and gas balances for the signer's identity, in human decimal units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balances {
    /// Stable-asset balance available for payments.
    pub asset: Decimal,
    /// Native-unit balance available for gas.
    pub gas: Decimal,
}

/// Errors surfaced by a [`Signer`] implementation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SignerError {
    /// The requested chain id is not supported by this signer.
    #[error(transparent)]
    UnsupportedChain(#[from] UnknownChainError),

    /// A balance query failed.
    #[error("balance query failed: {0}")]
    Balance(String),

    /// Gas/cost estimation failed.
    #[error("cost estimation failed: {0}")]
    Estimate(String),

    /// Signing failed.
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Identity, funds, and signing capability for paying challenges.
///
/// Implementations may suspend on network I/O; the orchestrator performs a
/// short bounded chain of awaited calls per payment cycle and imposes no
/// timeout of its own — timeouts surface from here as ordinary errors.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Returns the payer address as a hex string.
    fn address(&self) -> String;

    /// Queries current asset and gas balances.
    async fn balances(&self) -> Result<Balances, SignerError>;

    /// Points the signer at the given chain.
    ///
    /// Fails with [`SignerError::UnsupportedChain`] (listing the supported
    /// ids) for chains outside the known table.
    async fn configure_for_chain(&self, chain_id: u64) -> Result<(), SignerError>;

    /// Estimates the gas cost of executing `template`, in native decimal units.
    async fn estimate_cost(&self, template: &TransactionTemplate) -> Result<Decimal, SignerError>;

    /// Signs `template` into a broadcastable artifact.
    async fn sign_transaction(&self, template: &TransactionTemplate)
    -> Result<String, SignerError>;

    /// Signs EIP-712 typed data, returning the signature hex.
    ///
    /// Used by the atomic-unit protocol's detached-authorization signing.
    async fn sign_typed(
        &self,
        domain: &Value,
        types: &Value,
        message: &Value,
    ) -> Result<String, SignerError>;
}
