//! Alloy-backed provider: HTTP for queries and contract reads, a raw
//! `eth_subscribe` WebSocket session per topic for live logs.

use alloy::providers::Provider;
use alloy::rpc::types::Filter;
use alloy::sol;
use alloy_primitives::{Address, Bytes, B256, U256};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::provider::{ChainProvider, ContractMetadata, LogSubscription, OnChainVault};
use super::{ChainError, ChainLog};

sol! {
    #[sol(rpc)]
    interface IERC20Metadata {
        function symbol() external view returns (string memory);
        function decimals() external view returns (uint8);
    }

    #[sol(rpc)]
    interface ITimeLockVault {
        struct VaultInfo {
            address owner;
            address token;
            uint256 balance;
            uint256 unlockTime;
            bool active;
        }

        function getVault(uint256 vaultId) external view returns (VaultInfo memory);
        function platformFee() external view returns (uint256);
        function feeRecipient() external view returns (address);
    }
}

/// Buffered logs per live subscription before the session applies backpressure
const SUBSCRIPTION_BUFFER: usize = 256;

/// Provider backed by an alloy HTTP provider.
pub struct AlloyChainProvider<P> {
    provider: P,
    ws_url: Option<String>,
    ping_interval: Duration,
    pong_timeout: Duration,
}

impl<P> AlloyChainProvider<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    /// Create a provider. `ws_url` is used for live subscriptions; when it is
    /// `None` it is derived from `rpc_url` (`https` → `wss`, `http` → `ws`).
    pub fn new(provider: P, rpc_url: &str, ws_url: Option<String>) -> Self {
        Self {
            provider,
            ws_url: ws_url.or_else(|| derive_ws_url(rpc_url)),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    pub fn ws_url(&self) -> Option<&str> {
        self.ws_url.as_deref()
    }
}

/// Derive WebSocket URL from HTTP RPC URL
pub fn derive_ws_url(rpc_url: &str) -> Option<String> {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        Some(format!("wss://{}", rest))
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        Some(format!("ws://{}", rest))
    } else if rpc_url.starts_with("ws://") || rpc_url.starts_with("wss://") {
        Some(rpc_url.to_string())
    } else {
        None
    }
}

#[async_trait::async_trait]
impl<P> ChainProvider for AlloyChainProvider<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::from_rpc_message(e.to_string()))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        self.provider
            .get_code_at(address)
            .await
            .map_err(|e| ChainError::from_rpc_message(e.to_string()))
    }

    async fn query_logs(
        &self,
        contract: Address,
        topic: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainLog>, ChainError> {
        let filter = Filter::new()
            .address(contract)
            .event_signature(topic)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| ChainError::from_rpc_message(e.to_string()))?;

        Ok(logs
            .into_iter()
            .map(|log| ChainLog {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                block_number: log.block_number.unwrap_or(0),
                transaction_hash: log.transaction_hash.unwrap_or(B256::ZERO),
                transaction_index: log.transaction_index.unwrap_or(0),
                log_index: log.log_index.unwrap_or(0),
            })
            .collect())
    }

    async fn subscribe(&self, contract: Address, topic: B256) -> Result<LogSubscription, ChainError> {
        let ws_url = self
            .ws_url
            .clone()
            .ok_or(ChainError::SubscriptionUnsupported)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let session = WsSession {
            ws_url,
            contract,
            topic,
            ping_interval: self.ping_interval,
            pong_timeout: self.pong_timeout,
        };
        tokio::spawn(session.run(tx));

        Ok(receiver_stream(rx))
    }

    async fn token_symbol(&self, token: Address) -> Result<String, ChainError> {
        IERC20Metadata::new(token, &self.provider)
            .symbol()
            .call()
            .await
            .map_err(|e| ChainError::from_rpc_message(e.to_string()))
    }

    async fn token_decimals(&self, token: Address) -> Result<u8, ChainError> {
        IERC20Metadata::new(token, &self.provider)
            .decimals()
            .call()
            .await
            .map_err(|e| ChainError::from_rpc_message(e.to_string()))
    }

    async fn vault_by_id(&self, contract: Address, vault_id: U256) -> Result<OnChainVault, ChainError> {
        let info = ITimeLockVault::new(contract, &self.provider)
            .getVault(vault_id)
            .call()
            .await
            .map_err(|e| ChainError::from_rpc_message(e.to_string()))?;

        Ok(OnChainVault {
            owner: info.owner,
            token: info.token,
            balance: info.balance,
            unlock_time: info.unlockTime,
            active: info.active,
        })
    }

    async fn contract_metadata(&self, contract: Address) -> Result<ContractMetadata, ChainError> {
        let vault = ITimeLockVault::new(contract, &self.provider);

        let platform_fee_bps = vault
            .platformFee()
            .call()
            .await
            .map_err(|e| ChainError::from_rpc_message(e.to_string()))?;
        let fee_recipient = vault
            .feeRecipient()
            .call()
            .await
            .map_err(|e| ChainError::from_rpc_message(e.to_string()))?;

        Ok(ContractMetadata {
            platform_fee_bps,
            fee_recipient,
        })
    }
}

/// Adapt an mpsc receiver into a boxed stream.
pub(crate) fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> futures_util::stream::BoxStream<'static, T> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// One WebSocket session carrying a single-topic log subscription.
struct WsSession {
    ws_url: String,
    contract: Address,
    topic: B256,
    ping_interval: Duration,
    pong_timeout: Duration,
}

impl WsSession {
    async fn run(self, tx: mpsc::Sender<Result<ChainLog, ChainError>>) {
        if let Err(e) = self.stream_logs(&tx).await {
            tracing::warn!(topic = %self.topic, error = %e, "Log subscription ended");
            let _ = tx.send(Err(e)).await;
        }
    }

    async fn stream_logs(&self, tx: &mpsc::Sender<Result<ChainLog, ChainError>>) -> Result<(), ChainError> {
        let (ws_stream, _) = connect_async(self.ws_url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe_msg = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["logs", {
                "address": format!("{:?}", self.contract),
                "topics": [format!("{:?}", self.topic)]
            }]
        });

        write
            .send(Message::Text(subscribe_msg.to_string().into()))
            .await
            .map_err(|e| ChainError::SubscriptionError(e.to_string()))?;

        let mut ping_interval = interval(self.ping_interval);
        let mut pong_check_interval = interval(Duration::from_secs(10));
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!(topic = %self.topic, "Subscriber dropped, closing session");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping_interval.tick() => {
                    write
                        .send(Message::Ping(vec![].into()))
                        .await
                        .map_err(|e| ChainError::WebSocketError(format!("ping failed: {}", e)))?;
                }
                _ = pong_check_interval.tick() => {
                    let elapsed = last_pong.elapsed();
                    if elapsed > self.pong_timeout {
                        return Err(ChainError::WebSocketError(format!(
                            "no pong received for {}s",
                            elapsed.as_secs()
                        )));
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match parse_ws_frame(&text) {
                            WsFrame::Confirmed(id) => {
                                tracing::info!(topic = %self.topic, subscription = %id, "Subscription confirmed");
                            }
                            WsFrame::Log(log) => {
                                if tx.send(Ok(log)).await.is_err() {
                                    return Ok(());
                                }
                            }
                            WsFrame::Removed(log) => {
                                tracing::warn!(
                                    block = log.block_number,
                                    tx_hash = %log.transaction_hash,
                                    "Ignoring log removed by reorg"
                                );
                            }
                            WsFrame::Malformed(reason) => {
                                tracing::warn!(topic = %self.topic, reason = %reason, "Skipping malformed log notification");
                            }
                            WsFrame::Failed(e) => return Err(e),
                            WsFrame::Ignored => {}
                        },
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Err(ChainError::WebSocketError("closed by server".to_string()));
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(ChainError::WebSocketError("stream ended".to_string()));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
enum WsFrame {
    Confirmed(String),
    Log(ChainLog),
    Removed(ChainLog),
    /// Undecodable notification; the session keeps running
    Malformed(String),
    /// JSON-RPC error reported by the node; ends the session
    Failed(ChainError),
    Ignored,
}

/// Interpret one text frame from an `eth_subscribe` session.
fn parse_ws_frame(text: &str) -> WsFrame {
    let json: serde_json::Value = match serde_json::from_str(text) {
        Ok(json) => json,
        Err(e) => return WsFrame::Malformed(e.to_string()),
    };

    if let Some(error) = json.get("error") {
        return WsFrame::Failed(ChainError::from_rpc_message(error.to_string()));
    }

    if let Some(id) = json.get("result").and_then(|r| r.as_str()) {
        return WsFrame::Confirmed(id.to_string());
    }

    let Some(result) = json.get("params").and_then(|p| p.get("result")) else {
        return WsFrame::Ignored;
    };

    let log = match parse_log_object(result) {
        Ok(log) => log,
        Err(e) => return WsFrame::Malformed(e.to_string()),
    };
    if result.get("removed").and_then(|v| v.as_bool()).unwrap_or(false) {
        return WsFrame::Removed(log);
    }
    WsFrame::Log(log)
}

fn parse_log_object(result: &serde_json::Value) -> Result<ChainLog, ChainError> {
    let address_str = result
        .get("address")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChainError::EventParseError {
            reason: "Missing address".to_string(),
        })?;
    let address: Address = address_str
        .parse()
        .map_err(|_| ChainError::EventParseError {
            reason: format!("Invalid address {}", address_str),
        })?;

    let transaction_hash: B256 = result
        .get("transactionHash")
        .and_then(|v| v.as_str())
        .map(|s| s.parse::<B256>())
        .transpose()
        .map_err(|_| ChainError::EventParseError {
            reason: "Invalid tx hash".to_string(),
        })?
        .unwrap_or(B256::ZERO);

    let topics: Vec<B256> = result
        .get("topics")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str())
                .filter_map(|s| s.parse().ok())
                .collect()
        })
        .unwrap_or_default();

    let data_str = result.get("data").and_then(|v| v.as_str()).unwrap_or("0x");
    let data = hex::decode(data_str.trim_start_matches("0x")).map_err(|e| {
        ChainError::EventParseError {
            reason: format!("Invalid log data: {}", e),
        }
    })?;

    Ok(ChainLog {
        address,
        topics,
        data: data.into(),
        block_number: hex_quantity(result.get("blockNumber")),
        transaction_hash,
        transaction_index: hex_quantity(result.get("transactionIndex")),
        log_index: hex_quantity(result.get("logIndex")),
    })
}

fn hex_quantity(value: Option<&serde_json::Value>) -> u64 {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .unwrap_or(0)
}
