//! Shared utilities for integration testing: in-memory stand-ins for the
//! chain, the custody service and the multisig contract.

#![allow(dead_code)]

use alloy::consensus::{Transaction, TxEnvelope};
use alloy::eips::eip2718::{Decodable2718, Encodable2718};
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{keccak256, Address, Bytes, TxHash, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_wallet::chain::erc20::transfer_call;
use agent_wallet::chain::{ChainError, ChainId, ChainResult, ChainRpc, ReceiptStatus, Token};
use agent_wallet::config::schema::{
    AppConfig, CustodyConfig, MultisigConfig, SubmitterConfig, TrackerConfig,
};
use agent_wallet::tx::{TransactionRecord, TxId};
use agent_wallet::wallet::custodial::{CustodialProvider, RemoteSigner, SignRequest, SignResponse};
use agent_wallet::wallet::multisig::{MultisigBackend, MultisigProvider, Proposal, ProposedCall};
use agent_wallet::wallet::native::{parse_private_key, NativeProvider};
use agent_wallet::wallet::{Approvals, ProviderError, ProviderResult, WalletId, WalletProvider, WalletRegistry};
use agent_wallet::WalletService;

pub const CHAIN: ChainId = ChainId(31337);

/// Deterministic test key.
pub fn signer(seed: u64) -> PrivateKeySigner {
    parse_private_key(&format!("{:064x}", seed)).unwrap()
}

pub fn recipient() -> Address {
    Address::repeat_byte(0x42)
}

pub fn ether(n: u64) -> U256 {
    U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
}

/// Fast timings so tests under paused time stay short.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.api.enabled = false;
    config.submitter = SubmitterConfig {
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 50,
        max_nonce_resyncs: 3,
    };
    config.tracker = TrackerConfig {
        poll_interval_ms: 50,
        finality_timeout_secs: 30,
        eviction_grace_polls: 3,
    };
    config.custody = CustodyConfig {
        approval_timeout_secs: 5,
        poll_interval_ms: 100,
        request_timeout_secs: 5,
    };
    config.multisig = MultisigConfig {
        confirmation_timeout_secs: 10,
        poll_interval_ms: 100,
    };
    config
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// How the mock answers receipt queries for transactions it has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    Confirm,
    Pending,
    Evict,
}

#[derive(Debug, Clone)]
pub struct Broadcast {
    pub nonce: u64,
    pub hash: TxHash,
    pub to: Option<Address>,
    pub value: U256,
}

pub struct MockChain {
    nonces: Mutex<HashMap<Address, u64>>,
    balances: Mutex<HashMap<(Address, Token), U256>>,
    broadcasts: Mutex<Vec<Broadcast>>,
    known: Mutex<HashSet<TxHash>>,
    receipts: Mutex<HashMap<TxHash, ReceiptStatus>>,
    receipt_mode: Mutex<ReceiptMode>,
    broadcast_failures: Mutex<VecDeque<ChainError>>,
    gas_price_failures: AtomicU32,
    receipt_failures: AtomicU32,
    pub nonce_queries: AtomicU32,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            nonces: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            known: Mutex::new(HashSet::new()),
            receipts: Mutex::new(HashMap::new()),
            receipt_mode: Mutex::new(ReceiptMode::Confirm),
            broadcast_failures: Mutex::new(VecDeque::new()),
            gas_price_failures: AtomicU32::new(0),
            receipt_failures: AtomicU32::new(0),
            nonce_queries: AtomicU32::new(0),
        }
    }
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.nonces.lock().unwrap().insert(address, nonce);
    }

    pub fn set_balance(&self, address: Address, token: Token, balance: U256) {
        self.balances.lock().unwrap().insert((address, token), balance);
    }

    pub fn set_receipt_mode(&self, mode: ReceiptMode) {
        *self.receipt_mode.lock().unwrap() = mode;
    }

    pub fn set_receipt(&self, hash: TxHash, status: ReceiptStatus) {
        self.receipts.lock().unwrap().insert(hash, status);
    }

    /// Make the next broadcasts fail with `err`, in order.
    pub fn fail_broadcast(&self, err: ChainError) {
        self.broadcast_failures.lock().unwrap().push_back(err);
    }

    /// Make the next `n` gas price lookups fail.
    pub fn fail_gas_price(&self, n: u32) {
        self.gas_price_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_receipts(&self, n: u32) {
        self.receipt_failures.store(n, Ordering::SeqCst);
    }

    /// Register a transaction sent by someone other than the service.
    pub fn add_known(&self, hash: TxHash) {
        self.known.lock().unwrap().insert(hash);
    }

    pub fn broadcasts(&self) -> Vec<Broadcast> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn broadcast_nonces(&self) -> Vec<u64> {
        self.broadcasts().iter().map(|b| b.nonce).collect()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn get_account_nonce(&self, _chain: ChainId, address: Address) -> ChainResult<u64> {
        self.nonce_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.nonces.lock().unwrap().get(&address).copied().unwrap_or(0))
    }

    async fn broadcast_raw_transaction(&self, _chain: ChainId, raw: Bytes) -> ChainResult<TxHash> {
        if let Some(err) = self.broadcast_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let envelope = TxEnvelope::decode_2718(&mut raw.as_ref())
            .map_err(|e| ChainError::Rpc(format!("undecodable transaction: {}", e)))?;
        let hash = keccak256(&raw);
        self.known.lock().unwrap().insert(hash);
        self.broadcasts.lock().unwrap().push(Broadcast {
            nonce: envelope.nonce(),
            hash,
            to: envelope.to(),
            value: envelope.value(),
        });
        Ok(hash)
    }

    async fn get_transaction_receipt(&self, _chain: ChainId, tx_hash: TxHash) -> ChainResult<ReceiptStatus> {
        if Self::take_failure(&self.receipt_failures) {
            return Err(ChainError::Timeout(1));
        }
        if let Some(status) = self.receipts.lock().unwrap().get(&tx_hash) {
            return Ok(*status);
        }
        if !self.known.lock().unwrap().contains(&tx_hash) {
            return Ok(ReceiptStatus::Unknown);
        }
        Ok(match *self.receipt_mode.lock().unwrap() {
            ReceiptMode::Confirm => ReceiptStatus::Included {
                block_number: 1,
                confirmations: 1,
            },
            ReceiptMode::Pending => ReceiptStatus::Pending,
            ReceiptMode::Evict => ReceiptStatus::Unknown,
        })
    }

    async fn get_token_balance(&self, _chain: ChainId, address: Address, token: Token) -> ChainResult<U256> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&(address, token))
            .copied()
            .unwrap_or_else(|| ether(1_000_000)))
    }

    async fn get_token_decimals(&self, _chain: ChainId, token: Token) -> ChainResult<u8> {
        Ok(if token.is_native() { 18 } else { 6 })
    }

    async fn get_block_number(&self, _chain: ChainId) -> ChainResult<u64> {
        Ok(1)
    }

    async fn get_gas_price(&self, _chain: ChainId) -> ChainResult<u128> {
        if Self::take_failure(&self.gas_price_failures) {
            return Err(ChainError::Rpc("connection refused".to_string()));
        }
        Ok(1_000_000_000)
    }

    async fn estimate_gas(
        &self,
        _chain: ChainId,
        _from: Address,
        _to: Address,
        _value: U256,
        data: Bytes,
    ) -> ChainResult<u64> {
        Ok(if data.is_empty() { 21_000 } else { 65_000 })
    }

    fn confirmation_blocks(&self, _chain: ChainId) -> u32 {
        1
    }
}

// ---------------------------------------------------------------------------
// Custody service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerMode {
    Sign,
    /// Answer `pending_approval` for this many polls, then sign.
    Pending(u32),
    PendingForever,
    Reject(String),
    Unavailable,
    /// Sign something other than what was requested.
    Tamper(Tamper),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tamper {
    /// Token transfer to another recipient for a larger amount.
    Calldata,
    ChainId,
    /// Signed by a key other than the wallet's.
    Key,
}

pub struct MockSigner {
    wallet: EthereumWallet,
    pub address: Address,
    mode: Mutex<SignerMode>,
    pending: Mutex<HashMap<String, (SignRequest, u32)>>,
    pub requests: Mutex<Vec<SignRequest>>,
}

impl MockSigner {
    pub fn new(seed: u64, mode: SignerMode) -> Arc<Self> {
        let key = signer(seed);
        let address = key.address();
        Arc::new(Self {
            wallet: EthereumWallet::from(key),
            address,
            mode: Mutex::new(mode),
            pending: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: SignerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    async fn sign(&self, request: &SignRequest, tamper: Option<Tamper>) -> ProviderResult<SignResponse> {
        let mut request = request.clone();
        let mut wallet = self.wallet.clone();
        match tamper {
            Some(Tamper::Calldata) => {
                let (_, _, data) = transfer_call(
                    Token::Erc20(request.to),
                    Address::repeat_byte(0x66),
                    U256::from(1_000_000_000_000u64),
                );
                request.data = data;
            }
            Some(Tamper::ChainId) => request.chain_id = 999,
            Some(Tamper::Key) => {
                let other = signer(0xbad);
                request.from = other.address();
                wallet = EthereumWallet::from(other);
            }
            None => {}
        }
        let envelope = TransactionRequest::default()
            .with_from(request.from)
            .with_to(request.to)
            .with_value(request.value)
            .with_input(request.data.clone())
            .with_nonce(request.nonce)
            .with_chain_id(request.chain_id)
            .with_gas_limit(request.gas_limit)
            .with_gas_price(request.gas_price)
            .build(&wallet)
            .await
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        Ok(SignResponse::Signed {
            raw_transaction: Bytes::from(envelope.encoded_2718()),
        })
    }
}

#[async_trait]
impl RemoteSigner for MockSigner {
    async fn request_signature(&self, request: &SignRequest) -> ProviderResult<SignResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mode = self.mode.lock().unwrap().clone();
        let polls = match mode {
            SignerMode::Sign => return self.sign(request, None).await,
            SignerMode::Tamper(tamper) => return self.sign(request, Some(tamper)).await,
            SignerMode::Reject(reason) => return Ok(SignResponse::Rejected { reason }),
            SignerMode::Unavailable => {
                return Err(ProviderError::Unavailable("custody service returned 503".to_string()))
            }
            SignerMode::Pending(polls) => polls,
            SignerMode::PendingForever => u32::MAX,
        };
        let request_id = format!("sr_{}", request.idempotency_key);
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), (request.clone(), polls));
        Ok(SignResponse::PendingApproval { request_id })
    }

    async fn poll_signature(&self, request_id: &str) -> ProviderResult<SignResponse> {
        let ready = {
            let mut pending = self.pending.lock().unwrap();
            let Some((request, remaining)) = pending.get_mut(request_id) else {
                return Ok(SignResponse::Rejected {
                    reason: "unknown request".to_string(),
                });
            };
            if *remaining == 0 {
                Some(request.clone())
            } else {
                *remaining = remaining.saturating_sub(1);
                None
            }
        };
        match ready {
            Some(request) => self.sign(&request, None).await,
            None => Ok(SignResponse::PendingApproval {
                request_id: request_id.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Multisig contract
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MultisigState {
    count: u64,
    threshold: u32,
    approvals: HashMap<u64, u32>,
    executed: HashMap<u64, TxHash>,
    /// Approval count each proposal had when it was executed.
    executed_with: HashMap<u64, u32>,
    calls: HashMap<u64, (Address, U256, Bytes)>,
    /// Proposals that report an error after being recorded.
    lost_receipts: u32,
    /// Proposals that report an error and are recorded on the next count query.
    late_landings: u32,
    landing: Option<(Address, U256, Bytes)>,
}

impl MultisigState {
    fn record(&mut self, call: (Address, U256, Bytes)) -> u64 {
        let id = self.count;
        self.count += 1;
        self.approvals.insert(id, 1);
        self.calls.insert(id, call);
        id
    }
}

pub struct MockMultisig {
    chain: Arc<MockChain>,
    state: Mutex<MultisigState>,
}

impl MockMultisig {
    pub fn new(chain: Arc<MockChain>, threshold: u32) -> Arc<Self> {
        Arc::new(Self {
            chain,
            state: Mutex::new(MultisigState {
                threshold,
                ..Default::default()
            }),
        })
    }

    /// Another owner approves `proposal_id`.
    pub fn approve(&self, proposal_id: u64) {
        *self.state.lock().unwrap().approvals.entry(proposal_id).or_insert(0) += 1;
    }

    /// The next `n` proposals are recorded but their submission errors.
    pub fn lose_receipts(&self, n: u32) {
        self.state.lock().unwrap().lost_receipts = n;
    }

    /// The next `n` proposals error and only show up on the contract later.
    pub fn land_late(&self, n: u32) {
        self.state.lock().unwrap().late_landings = n;
    }

    pub fn proposals(&self) -> u64 {
        self.state.lock().unwrap().count
    }

    pub fn executed_with(&self, proposal_id: u64) -> Option<u32> {
        self.state.lock().unwrap().executed_with.get(&proposal_id).copied()
    }
}

#[async_trait]
impl MultisigBackend for MockMultisig {
    async fn proposal_count(&self) -> ProviderResult<u64> {
        let mut state = self.state.lock().unwrap();
        if let Some(call) = state.landing.take() {
            state.record(call);
        }
        Ok(state.count)
    }

    async fn propose(&self, to: Address, value: U256, data: Bytes) -> ProviderResult<Proposal> {
        let mut state = self.state.lock().unwrap();
        if state.late_landings > 0 {
            state.late_landings -= 1;
            state.landing = Some((to, value, data));
            return Err(ProviderError::Unavailable("proposal receipt timed out".to_string()));
        }
        let id = state.record((to, value, data));
        if state.lost_receipts > 0 {
            state.lost_receipts -= 1;
            return Err(ProviderError::Unavailable("proposal receipt timed out".to_string()));
        }
        Ok(Proposal {
            id,
            tx_hash: Some(keccak256(format!("propose-{}", id))),
        })
    }

    async fn proposal(&self, proposal_id: u64) -> ProviderResult<Option<ProposedCall>> {
        let state = self.state.lock().unwrap();
        Ok(state.calls.get(&proposal_id).map(|(to, value, data)| ProposedCall {
            to: *to,
            value: *value,
            data: data.clone(),
            executed: state.executed.contains_key(&proposal_id),
        }))
    }

    async fn confirm(&self, _proposal_id: u64) -> ProviderResult<()> {
        Ok(())
    }

    async fn approvals(&self, proposal_id: u64) -> ProviderResult<Approvals> {
        let state = self.state.lock().unwrap();
        Ok(Approvals {
            count: state.approvals.get(&proposal_id).copied().unwrap_or(0),
            threshold: state.threshold,
        })
    }

    async fn execute(&self, proposal_id: u64) -> ProviderResult<Option<TxHash>> {
        let hash = {
            let mut state = self.state.lock().unwrap();
            if state.executed.contains_key(&proposal_id) {
                return Ok(None);
            }
            let approvals = state.approvals.get(&proposal_id).copied().unwrap_or(0);
            if approvals < state.threshold {
                return Err(ProviderError::Rejected("not enough confirmations".to_string()));
            }
            let hash = keccak256(format!("execute-{}", proposal_id));
            state.executed.insert(proposal_id, hash);
            state.executed_with.insert(proposal_id, approvals);
            hash
        };
        self.chain.add_known(hash);
        Ok(Some(hash))
    }
}

// ---------------------------------------------------------------------------
// Service harness
// ---------------------------------------------------------------------------

pub fn multisig_address() -> Address {
    Address::repeat_byte(0x55)
}

enum WalletSpec {
    Native(u64),
    Custodial(Arc<MockSigner>),
    Multisig(Arc<MockMultisig>),
}

pub struct Harness {
    pub service: Arc<WalletService>,
    pub chain: Arc<MockChain>,
    pub registry: Arc<WalletRegistry>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: test_config(),
            chain: MockChain::new(),
            wallets: Vec::new(),
        }
    }

    pub fn address(&self, wallet: &str) -> Address {
        self.registry.get(&WalletId::from(wallet)).unwrap().handle.address
    }

    pub async fn wait_terminal(&self, id: &TxId) -> TransactionRecord {
        tokio::time::timeout(Duration::from_secs(600), self.service.wait_for_terminal(id))
            .await
            .expect("transaction did not reach a terminal status")
            .unwrap()
    }

    /// Wait until `id` satisfies `f`.
    pub async fn wait_until<F>(&self, id: &TxId, f: F) -> TransactionRecord
    where
        F: Fn(&TransactionRecord) -> bool,
    {
        let mut rx = self.service.subscribe(id).unwrap();
        let record = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|r| f(r)))
            .await
            .expect("condition not reached")
            .unwrap()
            .clone();
        record
    }
}

pub struct HarnessBuilder {
    config: AppConfig,
    chain: Arc<MockChain>,
    wallets: Vec<(String, WalletSpec)>,
}

impl HarnessBuilder {
    pub fn config(mut self, f: impl FnOnce(&mut AppConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn chain(mut self, chain: Arc<MockChain>) -> Self {
        self.chain = chain;
        self
    }

    pub fn journal(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        self.config(move |c| c.storage.journal_path = Some(path))
    }

    pub fn native(mut self, id: &str, seed: u64) -> Self {
        self.wallets.push((id.to_string(), WalletSpec::Native(seed)));
        self
    }

    pub fn custodial(mut self, id: &str, signer: Arc<MockSigner>) -> Self {
        self.wallets.push((id.to_string(), WalletSpec::Custodial(signer)));
        self
    }

    pub fn multisig(mut self, id: &str, backend: Arc<MockMultisig>) -> Self {
        self.wallets.push((id.to_string(), WalletSpec::Multisig(backend)));
        self
    }

    pub async fn build(self) -> Harness {
        let rpc: Arc<dyn ChainRpc> = self.chain.clone();
        let registry = Arc::new(WalletRegistry::new());
        for (id, spec) in self.wallets {
            let provider = match spec {
                WalletSpec::Native(seed) => {
                    WalletProvider::Native(NativeProvider::new(signer(seed), CHAIN, rpc.clone()))
                }
                WalletSpec::Custodial(remote) => WalletProvider::Custodial(CustodialProvider::new(
                    remote.clone(),
                    remote.address,
                    CHAIN,
                    rpc.clone(),
                    &self.config.custody,
                )),
                WalletSpec::Multisig(backend) => WalletProvider::Multisig(MultisigProvider::new(
                    backend,
                    multisig_address(),
                    CHAIN,
                    rpc.clone(),
                    &self.config.multisig,
                )),
            };
            registry.register(WalletId::new(id), CHAIN, provider).unwrap();
        }
        let service = WalletService::start(&self.config, registry.clone(), rpc)
            .await
            .unwrap();
        Harness {
            service: Arc::new(service),
            chain: self.chain,
            registry,
        }
    }
}
