//! HTTP mapping of service errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::WalletError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// Stable machine-readable code of an error.
pub fn error_code(err: &WalletError) -> &'static str {
    match err {
        WalletError::NonceConflict(_) => "nonce_conflict",
        WalletError::InsufficientFunds(_) => "insufficient_funds",
        WalletError::SpendingLimitExceeded { .. } => "spending_limit_exceeded",
        WalletError::ProviderUnavailable(_) => "provider_unavailable",
        WalletError::SignatureRejected(_) => "signature_rejected",
        WalletError::ConfirmationTimeout(_) => "confirmation_timeout",
        WalletError::Validation(_) => "validation",
        WalletError::UnknownWallet(_) => "unknown_wallet",
        WalletError::DuplicateTransaction(_) => "duplicate_transaction",
        WalletError::NotFound(_) => "not_found",
        WalletError::StatusRegression { .. } => "status_regression",
        WalletError::NotResubmittable { .. } => "not_resubmittable",
        WalletError::Rejected(_) => "rejected",
        WalletError::Storage(_) => "storage",
        WalletError::ShuttingDown => "shutting_down",
    }
}

pub fn status_code(err: &WalletError) -> StatusCode {
    match err {
        WalletError::Validation(_) => StatusCode::BAD_REQUEST,
        WalletError::UnknownWallet(_) | WalletError::NotFound(_) => StatusCode::NOT_FOUND,
        WalletError::DuplicateTransaction(_)
        | WalletError::NotResubmittable { .. }
        | WalletError::StatusRegression { .. }
        | WalletError::NonceConflict(_) => StatusCode::CONFLICT,
        WalletError::SpendingLimitExceeded { .. }
        | WalletError::InsufficientFunds(_)
        | WalletError::SignatureRejected(_)
        | WalletError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WalletError::ProviderUnavailable(_) | WalletError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        WalletError::ConfirmationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        WalletError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for WalletError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: error_code(&self),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::Token;
    use crate::wallet::WalletId;
    use alloy::primitives::U256;

    #[test]
    fn test_status_mapping() {
        let exceeded = WalletError::SpendingLimitExceeded {
            wallet: WalletId::from("w"),
            token: Token::Native,
            requested: U256::from(2),
            remaining: U256::from(1),
        };
        assert_eq!(status_code(&exceeded), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error_code(&exceeded), "spending_limit_exceeded");
        assert_eq!(
            status_code(&WalletError::UnknownWallet(WalletId::from("w"))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_code(&WalletError::ShuttingDown), StatusCode::SERVICE_UNAVAILABLE);
    }
}
