//! Scripted chain provider and log builders shared by the integration tests.

#![allow(dead_code)]

use alloy_primitives::{Address, Bytes, LogData, B256, U256};
use alloy_sol_types::SolEvent;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use vault_sync::chain::{
    ChainError, ChainLog, ChainProvider, ContractMetadata, Deposited, LogSubscription,
    OnChainVault, PlatformFeeUpdated, VaultCreated, Withdrawn,
};
use vault_sync::store::{User, UserRole};

pub fn contract() -> Address {
    Address::repeat_byte(0xCC)
}

pub fn owner() -> Address {
    Address::repeat_byte(0xAA)
}

pub fn users() -> Vec<User> {
    vec![
        User {
            id: "user-1".to_string(),
            address: format!("{:#x}", owner()),
            email: Some("owner@example.com".to_string()),
            name: Some("Owner".to_string()),
            role: UserRole::User,
        },
        User {
            id: "admin-1".to_string(),
            address: format!("{:#x}", Address::repeat_byte(0x01)),
            email: None,
            name: None,
            role: UserRole::Admin,
        },
    ]
}

fn log(data: LogData, block: u64, tx: u8) -> ChainLog {
    ChainLog {
        address: contract(),
        topics: data.topics().to_vec(),
        data: data.data.clone(),
        block_number: block,
        transaction_hash: B256::repeat_byte(tx),
        transaction_index: 0,
        log_index: 0,
    }
}

pub fn created(vault_id: u64, block: u64, tx: u8) -> ChainLog {
    let data = VaultCreated {
        vaultId: U256::from(vault_id),
        user: owner(),
        token: Address::ZERO,
        unlockTime: U256::from(1_900_000_000u64),
    }
    .encode_log_data();
    log(data, block, tx)
}

pub fn deposited(vault_id: u64, amount: u128, block: u64, tx: u8) -> ChainLog {
    let data = Deposited {
        vaultId: U256::from(vault_id),
        user: owner(),
        token: Address::ZERO,
        amount: U256::from(amount),
    }
    .encode_log_data();
    log(data, block, tx)
}

pub fn withdrawn(vault_id: u64, amount: u128, fee: u128, block: u64, tx: u8) -> ChainLog {
    let data = Withdrawn {
        vaultId: U256::from(vault_id),
        user: owner(),
        token: Address::ZERO,
        amount: U256::from(amount),
        platformFee: U256::from(fee),
    }
    .encode_log_data();
    log(data, block, tx)
}

pub fn fee_updated(old_fee: u64, new_fee: u64, block: u64, tx: u8) -> ChainLog {
    let data = PlatformFeeUpdated {
        oldFee: U256::from(old_fee),
        newFee: U256::from(new_fee),
    }
    .encode_log_data();
    log(data, block, tx)
}

type LiveSender = mpsc::Sender<Result<ChainLog, ChainError>>;

/// Provider whose chain is a list of logs and a head height the test moves.
pub struct ScriptedProvider {
    head: AtomicU64,
    logs: Mutex<Vec<ChainLog>>,
    offline: AtomicBool,
    streaming: bool,
    /// Every subscription errors as soon as it is polled
    failing_streams: bool,
    live: Mutex<Vec<(B256, LiveSender)>>,
    pub block_number_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(head: u64, logs: Vec<ChainLog>) -> Self {
        Self {
            head: AtomicU64::new(head),
            logs: Mutex::new(logs),
            offline: AtomicBool::new(false),
            streaming: false,
            failing_streams: false,
            live: Mutex::new(Vec::new()),
            block_number_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn failing_streams(mut self) -> Self {
        self.streaming = true;
        self.failing_streams = true;
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn add_log(&self, log: ChainLog) {
        self.logs.lock().push(log);
    }

    pub fn open_subscriptions(&self) -> usize {
        self.live.lock().len()
    }

    /// Deliver a log on the live stream without adding it to history.
    pub async fn emit(&self, log: ChainLog) {
        let senders: Vec<LiveSender> = self
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

    /// Break every live subscription.
    pub async fn disconnect(&self) {
        let senders: Vec<LiveSender> = self.live.lock().drain(..).map(|(_, tx)| tx).collect();
        for tx in senders {
            let _ = tx
                .send(Err(ChainError::WebSocketError("socket closed".to_string())))
                .await;
        }
    }

    fn check_online(&self) -> Result<(), ChainError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChainError::RpcError("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChainProvider for ScriptedProvider {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.block_number_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        self.check_online()?;
        if address == contract() {
            Ok(Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]))
        } else {
            Ok(Bytes::new())
        }
    }

    async fn query_logs(
        &self,
        contract: Address,
        topic: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainLog>, ChainError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|l| {
                l.address == contract
                    && l.topic0() == Some(topic)
                    && (from_block..=to_block).contains(&l.block_number)
            })
            .cloned()
            .collect())
    }

    async fn subscribe(&self, _contract: Address, topic: B256) -> Result<LogSubscription, ChainError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if !self.streaming {
            return Err(ChainError::SubscriptionUnsupported);
        }
        if self.failing_streams {
            return Ok(stream::once(async {
                Err(ChainError::WebSocketError("connection reset".to_string()))
            })
            .boxed());
        }
        let (tx, rx) = mpsc::channel(32);
        self.live.lock().push((topic, tx));
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn token_symbol(&self, _token: Address) -> Result<String, ChainError> {
        Err(ChainError::RpcError("execution reverted".to_string()))
    }

    async fn token_decimals(&self, _token: Address) -> Result<u8, ChainError> {
        Err(ChainError::RpcError("execution reverted".to_string()))
    }

    async fn vault_by_id(&self, _contract: Address, vault_id: U256) -> Result<OnChainVault, ChainError> {
        self.check_online()?;
        Ok(OnChainVault {
            owner: owner(),
            token: Address::ZERO,
            balance: vault_id * U256::from(10u64).pow(U256::from(18u64)),
            unlock_time: U256::from(1_900_000_000u64),
            active: true,
        })
    }

    async fn contract_metadata(&self, _contract: Address) -> Result<ContractMetadata, ChainError> {
        self.check_online()?;
        Ok(ContractMetadata {
            platform_fee_bps: U256::from(50u64),
            fee_recipient: Address::repeat_byte(0xFE),
        })
    }
}
