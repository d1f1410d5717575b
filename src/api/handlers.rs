use alloy::primitives::Address;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::api::server::ApiState;
use crate::chain::types::Token;
use crate::error::{WalletError, WalletResult};
use crate::limits::{parse_amount, LimitStatus};
use crate::tx::record::{TransactionRecord, TxId, TxStatus};
use crate::tx::submitter::TransferRequest;
use crate::wallet::{WalletHandle, WalletId};

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    pub wallet_id: WalletId,
    pub to: Address,
    pub token: Token,
    /// Human units, e.g. `"12.5"`.
    pub amount: String,
    #[serde(default)]
    pub transaction_id: Option<TxId>,
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub transaction_id: TxId,
    pub status: TxStatus,
}

#[derive(Debug, Deserialize)]
pub struct LimitBody {
    /// Human units.
    pub cap: String,
    pub period_secs: u64,
    /// Looked up on chain when omitted.
    #[serde(default)]
    pub decimals: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct WalletView {
    #[serde(flatten)]
    pub handle: WalletHandle,
    pub limits: Vec<LimitStatus>,
}

#[derive(Debug, Serialize)]
pub struct WatchCancelled {
    pub cancelled: bool,
}

#[derive(Serialize)]
pub struct HealthStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub wallets: usize,
}

fn parse_tx_id(raw: &str) -> WalletResult<TxId> {
    raw.parse()
        .map_err(|_| WalletError::Validation(format!("invalid transaction id '{}'", raw)))
}

pub async fn health(State(state): State<ApiState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        wallets: state.service.wallets().len(),
    })
}

pub async fn submit_transfer(
    State(state): State<ApiState>,
    Json(body): Json<TransferBody>,
) -> WalletResult<(StatusCode, Json<Accepted>)> {
    let decimals = state.service.token_decimals(&body.wallet_id, body.token).await?;
    let amount = parse_amount(&body.amount, decimals)?;
    let mut request = TransferRequest::new(body.wallet_id, body.to, body.token, amount);
    request.transaction_id = body.transaction_id;

    let id = state.service.submit(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            transaction_id: id,
            status: TxStatus::Building,
        }),
    ))
}

pub async fn get_transaction(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> WalletResult<Json<TransactionRecord>> {
    let id = parse_tx_id(&id)?;
    Ok(Json(state.service.get_status(&id)?))
}

pub async fn resubmit_transaction(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> WalletResult<(StatusCode, Json<Accepted>)> {
    let id = parse_tx_id(&id)?;
    let new_id = state.service.resubmit(&id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            transaction_id: new_id,
            status: TxStatus::Building,
        }),
    ))
}

pub async fn cancel_watch(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> WalletResult<Json<WatchCancelled>> {
    let id = parse_tx_id(&id)?;
    let cancelled = state.service.cancel_watch(&id)?;
    Ok(Json(WatchCancelled { cancelled }))
}

pub async fn configure_limit(
    State(state): State<ApiState>,
    Path((wallet_id, token)): Path<(String, String)>,
    Json(body): Json<LimitBody>,
) -> WalletResult<Json<LimitStatus>> {
    let wallet_id = WalletId::new(wallet_id);
    let token: Token = token.parse().map_err(WalletError::Validation)?;
    let decimals = match body.decimals {
        Some(d) => d,
        None => state.service.token_decimals(&wallet_id, token).await?,
    };
    let cap = parse_amount(&body.cap, decimals)?;
    state
        .service
        .configure_spending_limit(&wallet_id, token, cap, Duration::from_secs(body.period_secs))?;

    let status = state
        .service
        .limit_status(&wallet_id, token)
        .ok_or_else(|| WalletError::Storage("limit vanished after configuration".to_string()))?;
    Ok(Json(status))
}

pub async fn list_wallets(State(state): State<ApiState>) -> Json<Vec<WalletView>> {
    let wallets = state
        .service
        .wallets()
        .into_iter()
        .map(|handle| WalletView {
            limits: state.service.limit_statuses(&handle.id),
            handle,
        })
        .collect();
    Json(wallets)
}
