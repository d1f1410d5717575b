//! Remote managed custody.
//!
//! # Data Flow
//! ```text
//! transfer
//!     → gas estimate + balance check
//!     → RemoteSigner::request_signature
//!         → signed            → broadcast
//!         → pending_approval  → poll until signed | rejected | timeout
//!         → rejected          → SignatureRejected
//! ```
//!
//! # Security
//! - The custody API key is read from the environment and never logged
//! - The signed payload is decoded and checked against the request (signer,
//!   chain, nonce, destination, value and calldata) before it is broadcast

use alloy::consensus::transaction::SignerRecoverable;
use alloy::consensus::{Transaction, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{keccak256, Address, Bytes, U256};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::chain::rpc::ChainRpc;
use crate::chain::types::ChainId;
use crate::config::schema::{CustodialWalletConfig, CustodyConfig};
use crate::nonce::Reservation;
use crate::wallet::native::PreparedCall;
use crate::wallet::provider::{broadcast_checked, ensure_funds, ProviderError, ProviderResult, Submission, UnsignedTransfer};

/// Unsigned transaction handed to the custody service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    /// Idempotency key; the same transfer and nonce always map to the same key.
    pub idempotency_key: String,
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u128,
}

impl SignRequest {
    pub(crate) fn new(transfer: &UnsignedTransfer, call: &PreparedCall) -> Self {
        Self {
            idempotency_key: format!("{}:{}", transfer.reference, transfer.nonce),
            chain_id: transfer.chain_id.0,
            from: transfer.from,
            to: call.to,
            value: call.value,
            data: call.data.clone(),
            nonce: transfer.nonce,
            gas_limit: call.gas_limit,
            gas_price: call.gas_price,
        }
    }
}

/// State of a signature request on the custody side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignResponse {
    Signed { raw_transaction: Bytes },
    PendingApproval { request_id: String },
    Rejected { reason: String },
}

/// The custody service collaborator.
#[async_trait]
pub trait RemoteSigner: Send + Sync {
    /// Submit an unsigned transaction for signing.
    async fn request_signature(&self, request: &SignRequest) -> ProviderResult<SignResponse>;

    /// Current state of a pending request.
    async fn poll_signature(&self, request_id: &str) -> ProviderResult<SignResponse>;
}

/// HTTP client for the custody API.
pub struct HttpCustodySigner {
    client: reqwest::Client,
    endpoint: String,
    remote_wallet_id: String,
}

impl HttpCustodySigner {
    pub fn new(
        endpoint: &str,
        remote_wallet_id: &str,
        api_key: &str,
        request_timeout: Duration,
    ) -> ProviderResult<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| ProviderError::Rejected("custody API key is not a valid header".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("HTTP client init failed: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            remote_wallet_id: remote_wallet_id.to_string(),
        })
    }

    /// Build a client from wallet config, reading the API key from the
    /// environment variable it names.
    pub fn from_config(wallet: &CustodialWalletConfig, custody: &CustodyConfig) -> ProviderResult<Self> {
        let api_key = std::env::var(&wallet.api_key_env).map_err(|_| {
            ProviderError::Rejected(format!("Environment variable {} not set", wallet.api_key_env))
        })?;
        Self::new(
            &wallet.endpoint,
            &wallet.remote_wallet_id,
            &api_key,
            Duration::from_secs(custody.request_timeout_secs),
        )
    }

    async fn handle(response: Result<reqwest::Response, reqwest::Error>) -> ProviderResult<SignResponse> {
        let response = response.map_err(|e| ProviderError::Unavailable(format!("custody request failed: {}", e)))?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Unavailable(format!("custody service returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::SignatureRejected(format!(
                "custody service returned {}: {}",
                status, body
            )));
        }
        response
            .json::<SignResponse>()
            .await
            .map_err(|e| ProviderError::Rejected(format!("malformed custody response: {}", e)))
    }
}

#[async_trait]
impl RemoteSigner for HttpCustodySigner {
    async fn request_signature(&self, request: &SignRequest) -> ProviderResult<SignResponse> {
        let url = format!("{}/v1/wallets/{}/sign", self.endpoint, self.remote_wallet_id);
        Self::handle(self.client.post(url).json(request).send().await).await
    }

    async fn poll_signature(&self, request_id: &str) -> ProviderResult<SignResponse> {
        let url = format!("{}/v1/sign-requests/{}", self.endpoint, request_id);
        Self::handle(self.client.get(url).send().await).await
    }
}

impl fmt::Debug for HttpCustodySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCustodySigner")
            .field("endpoint", &self.endpoint)
            .field("remote_wallet_id", &self.remote_wallet_id)
            .finish_non_exhaustive()
    }
}

/// Build, remote-sign, broadcast.
pub struct CustodialProvider {
    signer: Arc<dyn RemoteSigner>,
    address: Address,
    chain_id: ChainId,
    rpc: Arc<dyn ChainRpc>,
    approval_timeout: Duration,
    poll_interval: Duration,
}

impl CustodialProvider {
    pub fn new(
        signer: Arc<dyn RemoteSigner>,
        address: Address,
        chain_id: ChainId,
        rpc: Arc<dyn ChainRpc>,
        custody: &CustodyConfig,
    ) -> Self {
        Self {
            signer,
            address,
            chain_id,
            rpc,
            approval_timeout: Duration::from_secs(custody.approval_timeout_secs),
            poll_interval: Duration::from_millis(custody.poll_interval_ms),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn account_nonce(&self) -> ProviderResult<u64> {
        Ok(self.rpc.get_account_nonce(self.chain_id, self.address).await?)
    }

    pub async fn sign_and_send(
        &self,
        transfer: &UnsignedTransfer,
        reservation: &Reservation,
    ) -> ProviderResult<Submission> {
        let call = PreparedCall::prepare(&self.rpc, transfer).await?;
        ensure_funds(
            &self.rpc,
            self.chain_id,
            self.address,
            transfer.token,
            transfer.amount,
            call.gas_cost(),
        )
        .await?;

        let request = SignRequest::new(transfer, &call);
        let raw = self.await_signature(&request).await?;
        verify_signed(&raw, &request)?;

        reservation.wait_turn().await;
        let local_hash = keccak256(&raw);
        let tx_hash = broadcast_checked(&self.rpc, self.chain_id, raw, local_hash).await?;
        reservation.finish_turn().await;

        tracing::info!(
            tx_hash = %tx_hash,
            nonce = transfer.nonce,
            from = %self.address,
            "Custodial transaction broadcast"
        );
        Ok(Submission {
            backend_tx_id: tx_hash,
            approvals: None,
        })
    }

    async fn await_signature(&self, request: &SignRequest) -> ProviderResult<Bytes> {
        let deadline = Instant::now() + self.approval_timeout;
        let mut response = self.signer.request_signature(request).await?;
        loop {
            match response {
                SignResponse::Signed { raw_transaction } => return Ok(raw_transaction),
                SignResponse::Rejected { reason } => {
                    tracing::warn!(key = %request.idempotency_key, reason = %reason, "Custody signer declined");
                    return Err(ProviderError::SignatureRejected(reason));
                }
                SignResponse::PendingApproval { request_id } => {
                    if Instant::now() >= deadline {
                        return Err(ProviderError::SignatureRejected(format!(
                            "approval of {} not granted within {}s",
                            request_id,
                            self.approval_timeout.as_secs()
                        )));
                    }
                    tracing::debug!(request_id = %request_id, "Awaiting custody approval");
                    tokio::time::sleep(self.poll_interval).await;
                    response = self.signer.poll_signature(&request_id).await?;
                }
            }
        }
    }
}

/// Decode a signed payload and make sure it is the transaction we asked for.
fn verify_signed(raw: &Bytes, request: &SignRequest) -> ProviderResult<()> {
    let mismatch = |what: &str| {
        ProviderError::SignatureRejected(format!(
            "signed transaction {} does not match the request {}",
            what, request.idempotency_key
        ))
    };
    let envelope = TxEnvelope::decode_2718(&mut raw.as_ref())
        .map_err(|e| ProviderError::SignatureRejected(format!("undecodable signed transaction: {}", e)))?;

    let signer = envelope
        .recover_signer()
        .map_err(|e| ProviderError::SignatureRejected(format!("unrecoverable signature: {}", e)))?;
    if signer != request.from {
        return Err(mismatch("signer"));
    }
    if envelope.chain_id() != Some(request.chain_id) {
        return Err(mismatch("chain id"));
    }
    if envelope.nonce() != request.nonce {
        return Err(ProviderError::SignatureRejected(format!(
            "signed nonce {} does not match reserved nonce {}",
            envelope.nonce(),
            request.nonce
        )));
    }
    if envelope.to() != Some(request.to) || envelope.value() != request.value {
        return Err(mismatch("destination or value"));
    }
    if envelope.input() != &request.data {
        return Err(mismatch("calldata"));
    }
    Ok(())
}

impl fmt::Debug for CustodialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustodialProvider")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}
