//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (wallets reference configured chains,
//!   limits reference configured wallets)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check each wallet kind carries the settings it needs
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::AppConfig;
use crate::limits::parse_amount;
use crate::wallet::handle::ProviderKind;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate `config`, collecting every problem found.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut chain_ids = HashSet::new();
    for (i, chain) in config.chains.iter().enumerate() {
        let field = format!("chains[{}]", i);
        if !chain_ids.insert(chain.chain_id) {
            errors.push(ValidationError::new(
                format!("{}.chain_id", field),
                format!("duplicate chain {}", chain.chain_id),
            ));
        }
        if chain.rpc_url.parse::<url::Url>().is_err() {
            errors.push(ValidationError::new(
                format!("{}.rpc_url", field),
                format!("invalid URL '{}'", chain.rpc_url),
            ));
        }
        if chain.rpc_timeout_secs == 0 {
            errors.push(ValidationError::new(
                format!("{}.rpc_timeout_secs", field),
                "must be greater than 0",
            ));
        }
        if chain.confirmation_blocks == 0 {
            errors.push(ValidationError::new(
                format!("{}.confirmation_blocks", field),
                "must be at least 1",
            ));
        }
        if !(chain.gas_price_multiplier.is_finite() && chain.gas_price_multiplier >= 1.0) {
            errors.push(ValidationError::new(
                format!("{}.gas_price_multiplier", field),
                "must be a finite value >= 1.0",
            ));
        }
    }

    let mut wallet_ids = HashSet::new();
    for (i, wallet) in config.wallets.iter().enumerate() {
        let field = format!("wallets[{}]", i);
        if wallet.id.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.id", field), "must not be empty"));
        } else if !wallet_ids.insert(wallet.id.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.id", field),
                format!("duplicate wallet '{}'", wallet.id),
            ));
        }
        if !chain_ids.contains(&wallet.chain_id) {
            errors.push(ValidationError::new(
                format!("{}.chain_id", field),
                format!("chain {} is not configured", wallet.chain_id),
            ));
        }
        if wallet.address.is_some_and(|a| a.is_zero()) {
            errors.push(ValidationError::new(
                format!("{}.address", field),
                "must not be the zero address",
            ));
        }

        match wallet.kind {
            ProviderKind::Native => {
                if wallet.key_env.as_deref().map_or(true, str::is_empty) {
                    errors.push(ValidationError::new(
                        format!("{}.key_env", field),
                        "native wallets require key_env",
                    ));
                }
            }
            ProviderKind::Custodial => {
                if wallet.address.is_none() {
                    errors.push(ValidationError::new(
                        format!("{}.address", field),
                        "custodial wallets require an address",
                    ));
                }
                match &wallet.custody {
                    Some(custody) => {
                        if custody.endpoint.parse::<url::Url>().is_err() {
                            errors.push(ValidationError::new(
                                format!("{}.custody.endpoint", field),
                                format!("invalid URL '{}'", custody.endpoint),
                            ));
                        }
                        if custody.remote_wallet_id.is_empty() {
                            errors.push(ValidationError::new(
                                format!("{}.custody.remote_wallet_id", field),
                                "must not be empty",
                            ));
                        }
                    }
                    None => errors.push(ValidationError::new(
                        format!("{}.custody", field),
                        "custodial wallets require a custody section",
                    )),
                }
            }
            ProviderKind::Multisig => {
                if wallet.address.is_none() {
                    errors.push(ValidationError::new(
                        format!("{}.address", field),
                        "multisig wallets require the contract address",
                    ));
                }
                if wallet.multisig.is_none() {
                    errors.push(ValidationError::new(
                        format!("{}.multisig", field),
                        "multisig wallets require a multisig section",
                    ));
                }
            }
        }
    }

    for (i, limit) in config.spending_limits.iter().enumerate() {
        let field = format!("spending_limits[{}]", i);
        if !wallet_ids.contains(limit.wallet.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.wallet", field),
                format!("unknown wallet '{}'", limit.wallet),
            ));
        }
        let decimals = limit.decimals.unwrap_or(crate::chain::Token::NATIVE_DECIMALS);
        if let Err(e) = parse_amount(&limit.cap, decimals) {
            errors.push(ValidationError::new(format!("{}.cap", field), e.to_string()));
        }
        if limit.period_secs == 0 {
            errors.push(ValidationError::new(
                format!("{}.period_secs", field),
                "must be greater than 0",
            ));
        }
    }

    if config.submitter.max_attempts == 0 {
        errors.push(ValidationError::new("submitter.max_attempts", "must be at least 1"));
    }
    if config.submitter.base_delay_ms > config.submitter.max_delay_ms {
        errors.push(ValidationError::new(
            "submitter.base_delay_ms",
            "must not exceed max_delay_ms",
        ));
    }
    if config.tracker.poll_interval_ms == 0 {
        errors.push(ValidationError::new("tracker.poll_interval_ms", "must be greater than 0"));
    }
    if config.tracker.finality_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "tracker.finality_timeout_secs",
            "must be greater than 0",
        ));
    }
    if config.custody.approval_timeout_secs == 0 || config.custody.poll_interval_ms == 0 {
        errors.push(ValidationError::new("custody", "timeouts must be greater than 0"));
    }
    if config.multisig.confirmation_timeout_secs == 0 || config.multisig.poll_interval_ms == 0 {
        errors.push(ValidationError::new("multisig", "timeouts must be greater than 0"));
    }

    if config.api.enabled {
        if config.api.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "api.bind_address",
                format!("invalid socket address '{}'", config.api.bind_address),
            ));
        }
        if config.api.api_key.is_empty() {
            errors.push(ValidationError::new("api.api_key", "must not be empty"));
        }
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Token;
    use crate::config::schema::{ChainConfig, SpendingLimitConfig, WalletConfig};

    fn base_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.chains.push(ChainConfig {
            chain_id: 8453,
            ..ChainConfig::default()
        });
        config.wallets.push(WalletConfig {
            id: "treasury".into(),
            kind: ProviderKind::Native,
            chain_id: 8453,
            address: None,
            key_env: Some("TREASURY_KEY".into()),
            custody: None,
            multisig: None,
        });
        config
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = base_config();
        config.wallets.push(WalletConfig {
            id: "treasury".into(),
            kind: ProviderKind::Custodial,
            chain_id: 1,
            address: None,
            key_env: None,
            custody: None,
            multisig: None,
        });
        config.spending_limits.push(SpendingLimitConfig {
            wallet: "ghost".into(),
            token: Token::Native,
            cap: "abc".into(),
            decimals: None,
            period_secs: 0,
        });
        config.submitter.max_attempts = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"wallets[1].id"));
        assert!(fields.contains(&"wallets[1].chain_id"));
        assert!(fields.contains(&"wallets[1].address"));
        assert!(fields.contains(&"wallets[1].custody"));
        assert!(fields.contains(&"spending_limits[0].wallet"));
        assert!(fields.contains(&"spending_limits[0].cap"));
        assert!(fields.contains(&"spending_limits[0].period_secs"));
        assert!(fields.contains(&"submitter.max_attempts"));
    }

    #[test]
    fn test_native_requires_key_env() {
        let mut config = base_config();
        config.wallets[0].key_env = None;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "wallets[0].key_env");
    }
}
