//! Chain-specific types and error definitions.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Chain ID type for strong typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ChainId> for u64 {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asset moved by a transfer: the chain's native coin or an ERC20 contract.
///
/// Serialized as `"native"` or the checksummed contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Token {
    Native,
    Erc20(Address),
}

impl Token {
    /// Decimals of the native coin on every supported EVM chain.
    pub const NATIVE_DECIMALS: u8 = 18;

    pub fn is_native(&self) -> bool {
        matches!(self, Token::Native)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Native => f.write_str("native"),
            Token::Erc20(address) => write!(f, "{}", address),
        }
    }
}

impl FromStr for Token {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("native") {
            return Ok(Token::Native);
        }
        let address: Address = trimmed
            .parse()
            .map_err(|e| format!("invalid token '{}': {}", trimmed, e))?;
        if address.is_zero() {
            return Err("token contract address must not be zero".to_string());
        }
        Ok(Token::Erc20(address))
    }
}

impl TryFrom<String> for Token {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.to_string()
    }
}

/// Errors that can occur during blockchain operations.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// RPC connection or request failed.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// RPC request timed out.
    #[error("RPC timeout after {0} seconds")]
    Timeout(u64),

    /// The node rejected the transaction because its nonce was already used.
    #[error("Nonce too low: {0}")]
    NonceTooLow(String),

    /// A transaction with the same nonce is already pending with a higher price.
    #[error("Replacement underpriced: {0}")]
    Underpriced(String),

    /// The sender cannot cover value plus gas.
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// A contract call reverted.
    #[error("Execution reverted: {0}")]
    Reverted(String),

    /// Gas price exceeded maximum allowed.
    #[error("Gas price {current_gwei} gwei exceeds maximum {max_gwei} gwei")]
    GasPriceTooHigh { current_gwei: u64, max_gwei: u64 },

    /// Chain configuration mismatch.
    #[error("Chain ID mismatch: expected {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },

    /// No RPC endpoint is configured for the chain.
    #[error("Chain {0} is not configured")]
    UnknownChain(ChainId),
}

impl ChainError {
    /// Classify a raw node error message.
    ///
    /// Nodes do not agree on error codes for these conditions, so the message
    /// text is the only portable signal.
    pub fn from_rpc_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("nonce too low") || lower.contains("already known") {
            ChainError::NonceTooLow(message)
        } else if lower.contains("replacement transaction underpriced")
            || lower.contains("transaction underpriced")
        {
            ChainError::Underpriced(message)
        } else if lower.contains("insufficient funds") {
            ChainError::InsufficientFunds(message)
        } else if lower.contains("execution reverted") {
            ChainError::Reverted(message)
        } else {
            ChainError::Rpc(message)
        }
    }
}

/// Result type for blockchain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// What the chain currently knows about a broadcast transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Known to the node's pending pool, not yet mined.
    Pending,
    /// Mined successfully.
    Included { block_number: u64, confirmations: u32 },
    /// Mined but reverted.
    Reverted { block_number: u64 },
    /// Neither mined nor pending: evicted, or never propagated.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_conversion() {
        let chain_id = ChainId::from(8453u64);
        assert_eq!(chain_id.0, 8453);
        assert_eq!(u64::from(chain_id), 8453);
        assert_eq!(chain_id.to_string(), "8453");
    }

    #[test]
    fn test_token_parsing() {
        assert_eq!("native".parse::<Token>().unwrap(), Token::Native);
        assert_eq!("NATIVE".parse::<Token>().unwrap(), Token::Native);

        let usdc: Token = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".parse().unwrap();
        assert!(matches!(usdc, Token::Erc20(_)));
        assert!(!usdc.is_native());

        assert!("0x0000000000000000000000000000000000000000".parse::<Token>().is_err());
        assert!("usdc".parse::<Token>().is_err());
    }

    #[test]
    fn test_token_serde() {
        let json = serde_json::to_string(&Token::Native).unwrap();
        assert_eq!(json, "\"native\"");
        let token: Token =
            serde_json::from_str("\"0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913\"").unwrap();
        assert!(matches!(token, Token::Erc20(_)));
    }

    #[test]
    fn test_rpc_message_classification() {
        assert!(matches!(
            ChainError::from_rpc_message("nonce too low: next nonce 5, tx nonce 3"),
            ChainError::NonceTooLow(_)
        ));
        assert!(matches!(
            ChainError::from_rpc_message("replacement transaction underpriced"),
            ChainError::Underpriced(_)
        ));
        assert!(matches!(
            ChainError::from_rpc_message("insufficient funds for gas * price + value"),
            ChainError::InsufficientFunds(_)
        ));
        assert!(matches!(
            ChainError::from_rpc_message("connection refused"),
            ChainError::Rpc(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = ChainError::Timeout(10);
        assert_eq!(err.to_string(), "RPC timeout after 10 seconds");

        let err = ChainError::GasPriceTooHigh {
            current_gwei: 600,
            max_gwei: 500,
        };
        assert!(err.to_string().contains("600"));
    }
}
