//! In-crate provider double for unit tests.

use alloy_primitives::{Address, Bytes, B256, U256};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use crate::chain::{
    receiver_stream, ChainError, ChainLog, ChainProvider, ContractMetadata, LogSubscription,
    OnChainVault,
};

pub struct MockChainProvider {
    head: AtomicU64,
    code: Mutex<Bytes>,
    logs: Mutex<Vec<ChainLog>>,
    /// `None` symbol makes `symbol()` revert for that token
    tokens: HashMap<Address, (Option<String>, u8)>,
    vaults: HashMap<U256, OnChainVault>,
    block_number_failures: Mutex<VecDeque<ChainError>>,
    query_failures: Mutex<VecDeque<ChainError>>,
    live: Mutex<Vec<(B256, mpsc::Sender<Result<ChainLog, ChainError>>)>>,
    streaming: bool,
    pub block_number_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub symbol_calls: AtomicUsize,
    pub decimals_calls: AtomicUsize,
}

impl MockChainProvider {
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            code: Mutex::new(Bytes::from_static(&[0x60, 0x80])),
            logs: Mutex::new(Vec::new()),
            tokens: HashMap::new(),
            vaults: HashMap::new(),
            block_number_failures: Mutex::new(VecDeque::new()),
            query_failures: Mutex::new(VecDeque::new()),
            live: Mutex::new(Vec::new()),
            streaming: false,
            block_number_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            symbol_calls: AtomicUsize::new(0),
            decimals_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_head(self, head: u64) -> Self {
        self.head.store(head, Ordering::SeqCst);
        self
    }

    pub fn with_token(mut self, token: Address, symbol: &str, decimals: u8) -> Self {
        self.tokens.insert(token, (Some(symbol.to_string()), decimals));
        self
    }

    /// Token whose `symbol()` reverts but whose `decimals()` answers.
    pub fn with_decimals_only(mut self, token: Address, decimals: u8) -> Self {
        self.tokens.insert(token, (None, decimals));
        self
    }

    pub fn with_vault(mut self, id: U256, vault: OnChainVault) -> Self {
        self.vaults.insert(id, vault);
        self
    }

    pub fn with_logs(self, logs: Vec<ChainLog>) -> Self {
        *self.logs.lock() = logs;
        self
    }

    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn without_code(self) -> Self {
        *self.code.lock() = Bytes::new();
        self
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push_log(&self, log: ChainLog) {
        self.logs.lock().push(log);
    }

    pub fn fail_block_number(&self, errors: impl IntoIterator<Item = ChainError>) {
        self.block_number_failures.lock().extend(errors);
    }

    pub fn fail_queries(&self, errors: impl IntoIterator<Item = ChainError>) {
        self.query_failures.lock().extend(errors);
    }

    /// Deliver `log` to every open subscription for its topic.
    pub async fn emit_live(&self, log: ChainLog) {
        let senders: Vec<_> = self
            .live
            .lock()
            .iter()
            .filter(|(topic, _)| Some(*topic) == log.topic0())
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(Ok(log.clone())).await;
        }
    }

    /// End every open subscription with a disconnect error.
    pub async fn drop_live(&self) {
        let senders: Vec<_> = self.live.lock().drain(..).map(|(_, tx)| tx).collect();
        for tx in senders {
            let _ = tx
                .send(Err(ChainError::WebSocketError("connection reset".to_string())))
                .await;
        }
    }

    pub fn live_subscriptions(&self) -> usize {
        self.live.lock().len()
    }
}

#[async_trait::async_trait]
impl ChainProvider for MockChainProvider {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.block_number_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.block_number_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn code_at(&self, _address: Address) -> Result<Bytes, ChainError> {
        Ok(self.code.lock().clone())
    }

    async fn query_logs(
        &self,
        contract: Address,
        topic: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainLog>, ChainError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.query_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|log| {
                log.address == contract
                    && log.topic0() == Some(topic)
                    && log.block_number >= from_block
                    && log.block_number <= to_block
            })
            .cloned()
            .collect())
    }

    async fn subscribe(&self, _contract: Address, topic: B256) -> Result<LogSubscription, ChainError> {
        if !self.streaming {
            return Err(ChainError::SubscriptionUnsupported);
        }
        let (tx, rx) = mpsc::channel(64);
        self.live.lock().push((topic, tx));
        Ok(receiver_stream(rx))
    }

    async fn token_symbol(&self, token: Address) -> Result<String, ChainError> {
        self.symbol_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .get(&token)
            .and_then(|(symbol, _)| symbol.clone())
            .ok_or_else(|| ChainError::RpcError("execution reverted".to_string()))
    }

    async fn token_decimals(&self, token: Address) -> Result<u8, ChainError> {
        self.decimals_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .get(&token)
            .map(|(_, decimals)| *decimals)
            .ok_or_else(|| ChainError::RpcError("execution reverted".to_string()))
    }

    async fn vault_by_id(&self, _contract: Address, vault_id: U256) -> Result<OnChainVault, ChainError> {
        Ok(self.vaults.get(&vault_id).cloned().unwrap_or(OnChainVault {
            owner: Address::ZERO,
            token: Address::ZERO,
            balance: U256::ZERO,
            unlock_time: U256::ZERO,
            active: false,
        }))
    }

    async fn contract_metadata(&self, _contract: Address) -> Result<ContractMetadata, ChainError> {
        Ok(ContractMetadata {
            platform_fee_bps: U256::from(50u64),
            fee_recipient: Address::repeat_byte(0xFE),
        })
    }
}
