//! Known network configurations and stable-asset deployments.
//!
//! The atomic-unit payment protocol names networks by human-readable name
//! (`"base"`, `"base-sepolia"`); the signer and transaction templates work
//! in numeric chain ids. This module is the fixed table joining the two,
//! including the USDC deployment used as the payment medium on each chain.

use alloy_primitives::{Address, address};

/// Base Mainnet chain ID.
pub const BASE_MAINNET: u64 = 8453;

/// Base Sepolia (testnet) chain ID.
pub const BASE_SEPOLIA: u64 = 84532;

/// USDC contract address on Base Mainnet.
pub const USDC_BASE: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");

/// USDC contract address on Base Sepolia.
pub const USDC_BASE_SEPOLIA: Address = address!("036CbD53842c5426634e7929541eC2318f3dCF7e");

/// Default EIP-712 domain name for USDC.
pub const DEFAULT_USDC_NAME: &str = "USD Coin";

/// Default EIP-712 domain version for USDC.
pub const DEFAULT_USDC_VERSION: &str = "2";

/// Default token decimals for USDC.
pub const DEFAULT_TOKEN_DECIMALS: u8 = 6;

/// A known network with its stable-asset deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Human-readable network name as it appears on the wire (e.g., "base").
    pub name: &'static str,
    /// Numeric chain id.
    pub chain_id: u64,
    /// Stable-asset (USDC) contract address on this network.
    pub asset: Address,
    /// Token decimals of the stable asset.
    pub decimals: u8,
    /// EIP-712 domain name of the asset contract.
    pub asset_name: &'static str,
    /// EIP-712 domain version of the asset contract.
    pub asset_version: &'static str,
}

/// All networks the proxy can pay on.
pub const KNOWN_NETWORKS: &[NetworkInfo] = &[
    NetworkInfo {
        name: "base",
        chain_id: BASE_MAINNET,
        asset: USDC_BASE,
        decimals: DEFAULT_TOKEN_DECIMALS,
        asset_name: DEFAULT_USDC_NAME,
        asset_version: DEFAULT_USDC_VERSION,
    },
    NetworkInfo {
        name: "base-sepolia",
        chain_id: BASE_SEPOLIA,
        asset: USDC_BASE_SEPOLIA,
        decimals: DEFAULT_TOKEN_DECIMALS,
        asset_name: DEFAULT_USDC_NAME,
        asset_version: DEFAULT_USDC_VERSION,
    },
];

/// Looks up a network by its wire name.
#[must_use]
pub fn by_name(name: &str) -> Option<&'static NetworkInfo> {
    KNOWN_NETWORKS.iter().find(|info| info.name == name)
}

/// Looks up a network by its chain id.
#[must_use]
pub fn by_chain_id(chain_id: u64) -> Option<&'static NetworkInfo> {
    KNOWN_NETWORKS.iter().find(|info| info.chain_id == chain_id)
}

/// Returns all supported chain ids, in table order.
#[must_use]
pub fn supported_chain_ids() -> Vec<u64> {
    KNOWN_NETWORKS.iter().map(|info| info.chain_id).collect()
}

/// Error for a chain id outside the known table.
///
/// The message lists every supported id so an agent can self-correct.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown chain id {requested}; supported chain ids: {supported:?}")]
pub struct UnknownChainError {
    /// The chain id that was requested.
    pub requested: u64,
    /// The chain ids the table does support.
    pub supported: Vec<u64>,
}

/// Resolves a chain id against the known table.
///
/// # Errors
///
/// Returns [`UnknownChainError`] listing the supported ids when the chain
/// is not in the table. Signer implementations call this from
/// `configure_for_chain`.
pub fn require_known_chain(chain_id: u64) -> Result<&'static NetworkInfo, UnknownChainError> {
    by_chain_id(chain_id).ok_or_else(|| UnknownChainError {
        requested: chain_id,
        supported: supported_chain_ids(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_mainnet_usdc_address() {
        let info = by_chain_id(8453).unwrap();
        assert_eq!(
            info.asset,
            address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913")
        );
        assert_eq!(info.name, "base");
    }

    #[test]
    fn test_base_sepolia_usdc_address() {
        let info = by_chain_id(84532).unwrap();
        assert_eq!(
            info.asset,
            address!("036CbD53842c5426634e7929541eC2318f3dCF7e")
        );
    }

    #[test]
    fn test_unknown_chain_lists_supported_ids() {
        let err = require_known_chain(1).unwrap_err();
        assert_eq!(err.requested, 1);
        assert_eq!(err.supported, vec![8453, 84532]);
        let text = err.to_string();
        assert!(text.contains("8453"));
        assert!(text.contains("84532"));
    }

    #[test]
    fn test_name_lookup() {
        assert_eq!(by_name("base-sepolia").unwrap().chain_id, 84532);
        assert!(by_name("ethereum").is_none());
    }
}
