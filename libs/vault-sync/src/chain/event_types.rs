//! Event types for the time-locked vault contract
//!
//! The contract emits five events:
//! - VaultCreated: a user opened a new time-locked vault
//! - Deposited / Withdrawn: funds moved in or out of a vault
//! - PlatformFeeUpdated / FeeRecipientUpdated: administrative changes

use alloy_primitives::{Address, Bytes, Log as PrimitiveLog, B256, U256};
use alloy_sol_types::{sol, SolEvent};
use chrono::{DateTime, Utc};

sol! {
    /// Emitted when a user creates a vault
    #[derive(Debug)]
    event VaultCreated(
        uint256 indexed vaultId,
        address indexed user,
        address indexed token,
        uint256 unlockTime
    );

    /// Emitted when funds are deposited into a vault
    #[derive(Debug)]
    event Deposited(
        uint256 indexed vaultId,
        address indexed user,
        address token,
        uint256 amount
    );

    /// Emitted when funds are withdrawn from a vault, net of the platform fee
    #[derive(Debug)]
    event Withdrawn(
        uint256 indexed vaultId,
        address indexed user,
        address token,
        uint256 amount,
        uint256 platformFee
    );

    /// Emitted when the platform fee (basis points) changes
    #[derive(Debug)]
    event PlatformFeeUpdated(uint256 oldFee, uint256 newFee);

    /// Emitted when the fee recipient changes
    #[derive(Debug)]
    event FeeRecipientUpdated(address indexed oldRecipient, address indexed newRecipient);
}

/// A raw log as delivered by the provider, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl ChainLog {
    /// Chain order key: (block, transaction, log).
    pub fn ordering_key(&self) -> (u64, u64, u64) {
        (self.block_number, self.transaction_index, self.log_index)
    }

    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

/// Event categories the pipeline subscribes to and replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    VaultCreated,
    Deposited,
    Withdrawn,
    PlatformFeeUpdated,
    FeeRecipientUpdated,
}

impl EventTopic {
    pub const ALL: [EventTopic; 5] = [
        EventTopic::VaultCreated,
        EventTopic::Deposited,
        EventTopic::Withdrawn,
        EventTopic::PlatformFeeUpdated,
        EventTopic::FeeRecipientUpdated,
    ];

    /// Event signature hash (topic0)
    pub fn signature(&self) -> B256 {
        match self {
            EventTopic::VaultCreated => VaultCreated::SIGNATURE_HASH,
            EventTopic::Deposited => Deposited::SIGNATURE_HASH,
            EventTopic::Withdrawn => Withdrawn::SIGNATURE_HASH,
            EventTopic::PlatformFeeUpdated => PlatformFeeUpdated::SIGNATURE_HASH,
            EventTopic::FeeRecipientUpdated => FeeRecipientUpdated::SIGNATURE_HASH,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventTopic::VaultCreated => "VaultCreated",
            EventTopic::Deposited => "Deposited",
            EventTopic::Withdrawn => "Withdrawn",
            EventTopic::PlatformFeeUpdated => "PlatformFeeUpdated",
            EventTopic::FeeRecipientUpdated => "FeeRecipientUpdated",
        }
    }

    pub fn from_signature(signature: B256) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.signature() == signature)
    }
}

/// Where an event came from on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMeta {
    pub contract: Address,
    pub tx_hash: B256,
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    /// Timestamp when event was received
    pub received_at: DateTime<Utc>,
}

impl LogMeta {
    fn from_log(log: &ChainLog) -> Self {
        Self {
            contract: log.address,
            tx_hash: log.transaction_hash,
            block_number: log.block_number,
            transaction_index: log.transaction_index,
            log_index: log.log_index,
            received_at: Utc::now(),
        }
    }

    /// Lowercase 0x-prefixed transaction hash, the idempotency key for appends.
    pub fn tx_hash_hex(&self) -> String {
        format!("{:#x}", self.tx_hash)
    }

    /// `tx_hash:log_index`, unique per log across live delivery and replay.
    pub fn event_key(&self) -> String {
        format!("{}:{}", self.tx_hash_hex(), self.log_index)
    }
}

#[derive(Debug, Clone)]
pub struct VaultCreatedEvent {
    pub vault_id: U256,
    pub user: Address,
    pub token: Address,
    /// Unix seconds
    pub unlock_time: U256,
    pub meta: LogMeta,
}

#[derive(Debug, Clone)]
pub struct DepositedEvent {
    pub vault_id: U256,
    pub user: Address,
    pub token: Address,
    /// Raw token units
    pub amount: U256,
    pub meta: LogMeta,
}

#[derive(Debug, Clone)]
pub struct WithdrawnEvent {
    pub vault_id: U256,
    pub user: Address,
    pub token: Address,
    /// Raw token units paid to the user
    pub amount: U256,
    /// Raw token units kept by the platform
    pub platform_fee: U256,
    pub meta: LogMeta,
}

#[derive(Debug, Clone)]
pub struct PlatformFeeUpdatedEvent {
    pub old_fee: U256,
    pub new_fee: U256,
    pub meta: LogMeta,
}

#[derive(Debug, Clone)]
pub struct FeeRecipientUpdatedEvent {
    pub old_recipient: Address,
    pub new_recipient: Address,
    pub meta: LogMeta,
}

/// Wrapper enum for decoded vault contract events
#[derive(Debug, Clone)]
pub enum VaultEvent {
    Created(VaultCreatedEvent),
    Deposited(DepositedEvent),
    Withdrawn(WithdrawnEvent),
    PlatformFeeUpdated(PlatformFeeUpdatedEvent),
    FeeRecipientUpdated(FeeRecipientUpdatedEvent),
}

impl VaultEvent {
    pub fn meta(&self) -> &LogMeta {
        match self {
            VaultEvent::Created(e) => &e.meta,
            VaultEvent::Deposited(e) => &e.meta,
            VaultEvent::Withdrawn(e) => &e.meta,
            VaultEvent::PlatformFeeUpdated(e) => &e.meta,
            VaultEvent::FeeRecipientUpdated(e) => &e.meta,
        }
    }

    pub fn topic(&self) -> EventTopic {
        match self {
            VaultEvent::Created(_) => EventTopic::VaultCreated,
            VaultEvent::Deposited(_) => EventTopic::Deposited,
            VaultEvent::Withdrawn(_) => EventTopic::Withdrawn,
            VaultEvent::PlatformFeeUpdated(_) => EventTopic::PlatformFeeUpdated,
            VaultEvent::FeeRecipientUpdated(_) => EventTopic::FeeRecipientUpdated,
        }
    }

    /// Vault the event belongs to; `None` for administrative events
    pub fn vault_id(&self) -> Option<U256> {
        match self {
            VaultEvent::Created(e) => Some(e.vault_id),
            VaultEvent::Deposited(e) => Some(e.vault_id),
            VaultEvent::Withdrawn(e) => Some(e.vault_id),
            VaultEvent::PlatformFeeUpdated(_) | VaultEvent::FeeRecipientUpdated(_) => None,
        }
    }

    pub fn ordering_key(&self) -> (u64, u64, u64) {
        let meta = self.meta();
        (meta.block_number, meta.transaction_index, meta.log_index)
    }

    pub fn is_admin(&self) -> bool {
        self.vault_id().is_none()
    }
}

/// Decode a raw log into a VaultEvent
pub fn parse_log(log: &ChainLog) -> Result<VaultEvent, EventParseError> {
    let topic0 = log.topic0().ok_or(EventParseError::NoTopics)?;
    let topic = EventTopic::from_signature(topic0).ok_or(EventParseError::UnknownSignature(topic0))?;

    let primitive = PrimitiveLog::new(log.address, log.topics.clone(), log.data.clone())
        .ok_or_else(|| EventParseError::DecodeError("too many topics".to_string()))?;
    let meta = LogMeta::from_log(log);

    let event = match topic {
        EventTopic::VaultCreated => {
            let decoded = VaultCreated::decode_log(&primitive)
                .map_err(|e| EventParseError::DecodeError(e.to_string()))?;
            VaultEvent::Created(VaultCreatedEvent {
                vault_id: decoded.vaultId,
                user: decoded.user,
                token: decoded.token,
                unlock_time: decoded.unlockTime,
                meta,
            })
        }
        EventTopic::Deposited => {
            let decoded = Deposited::decode_log(&primitive)
                .map_err(|e| EventParseError::DecodeError(e.to_string()))?;
            VaultEvent::Deposited(DepositedEvent {
                vault_id: decoded.vaultId,
                user: decoded.user,
                token: decoded.token,
                amount: decoded.amount,
                meta,
            })
        }
        EventTopic::Withdrawn => {
            let decoded = Withdrawn::decode_log(&primitive)
                .map_err(|e| EventParseError::DecodeError(e.to_string()))?;
            VaultEvent::Withdrawn(WithdrawnEvent {
                vault_id: decoded.vaultId,
                user: decoded.user,
                token: decoded.token,
                amount: decoded.amount,
                platform_fee: decoded.platformFee,
                meta,
            })
        }
        EventTopic::PlatformFeeUpdated => {
            let decoded = PlatformFeeUpdated::decode_log(&primitive)
                .map_err(|e| EventParseError::DecodeError(e.to_string()))?;
            VaultEvent::PlatformFeeUpdated(PlatformFeeUpdatedEvent {
                old_fee: decoded.oldFee,
                new_fee: decoded.newFee,
                meta,
            })
        }
        EventTopic::FeeRecipientUpdated => {
            let decoded = FeeRecipientUpdated::decode_log(&primitive)
                .map_err(|e| EventParseError::DecodeError(e.to_string()))?;
            VaultEvent::FeeRecipientUpdated(FeeRecipientUpdatedEvent {
                old_recipient: decoded.oldRecipient,
                new_recipient: decoded.newRecipient,
                meta,
            })
        }
    };

    Ok(event)
}

/// Errors that can occur during event parsing
#[derive(Debug, Clone)]
pub enum EventParseError {
    /// Log has no topics
    NoTopics,
    /// Failed to decode event data
    DecodeError(String),
    /// Unknown event signature
    UnknownSignature(B256),
}

impl std::fmt::Display for EventParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventParseError::NoTopics => write!(f, "Log has no topics"),
            EventParseError::DecodeError(msg) => write!(f, "Failed to decode event: {}", msg),
            EventParseError::UnknownSignature(sig) => {
                write!(f, "Unknown event signature: {}", sig)
            }
        }
    }
}

impl std::error::Error for EventParseError {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::LogData;

    fn chain_log(data: LogData, block_number: u64, tx_byte: u8) -> ChainLog {
        ChainLog {
            address: Address::repeat_byte(0xCC),
            topics: data.topics().to_vec(),
            data: data.data.clone(),
            block_number,
            transaction_hash: B256::repeat_byte(tx_byte),
            transaction_index: 0,
            log_index: 0,
        }
    }

    #[test]
    fn test_signatures_are_distinct() {
        for (i, a) in EventTopic::ALL.iter().enumerate() {
            assert_ne!(a.signature(), B256::ZERO);
            for (j, b) in EventTopic::ALL.iter().enumerate() {
                if i != j {
                    assert_ne!(a.signature(), b.signature(), "{} vs {}", a.name(), b.name());
                }
            }
            assert_eq!(EventTopic::from_signature(a.signature()), Some(*a));
        }
    }

    #[test]
    fn test_parse_deposit() {
        let data = Deposited {
            vaultId: U256::from(7),
            user: Address::repeat_byte(0xAA),
            token: Address::ZERO,
            amount: U256::from(1_500_000_000_000_000_000u128),
        }
        .encode_log_data();

        let event = parse_log(&chain_log(data, 120, 0x11)).unwrap();
        match &event {
            VaultEvent::Deposited(e) => {
                assert_eq!(e.vault_id, U256::from(7));
                assert_eq!(e.user, Address::repeat_byte(0xAA));
                assert_eq!(e.amount, U256::from(1_500_000_000_000_000_000u128));
                assert_eq!(e.meta.block_number, 120);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(event.topic(), EventTopic::Deposited);
        assert_eq!(event.vault_id(), Some(U256::from(7)));
        assert!(!event.is_admin());
    }

    #[test]
    fn test_parse_withdrawal_with_fee() {
        let data = Withdrawn {
            vaultId: U256::from(3),
            user: Address::repeat_byte(0xAB),
            token: Address::repeat_byte(0x10),
            amount: U256::from(990u64),
            platformFee: U256::from(10u64),
        }
        .encode_log_data();

        match parse_log(&chain_log(data, 5, 0x22)).unwrap() {
            VaultEvent::Withdrawn(e) => {
                assert_eq!(e.amount, U256::from(990u64));
                assert_eq!(e.platform_fee, U256::from(10u64));
                assert_eq!(e.token, Address::repeat_byte(0x10));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_admin_event() {
        let data = PlatformFeeUpdated {
            oldFee: U256::from(50u64),
            newFee: U256::from(75u64),
        }
        .encode_log_data();

        let event = parse_log(&chain_log(data, 9, 0x33)).unwrap();
        assert!(event.is_admin());
        assert_eq!(event.topic(), EventTopic::PlatformFeeUpdated);
    }

    #[test]
    fn test_parse_rejects_unknown_and_empty() {
        let mut log = chain_log(LogData::new_unchecked(vec![], Bytes::new()), 1, 0x44);
        assert!(matches!(parse_log(&log), Err(EventParseError::NoTopics)));

        log.topics = vec![B256::repeat_byte(0x99)];
        assert!(matches!(
            parse_log(&log),
            Err(EventParseError::UnknownSignature(_))
        ));
    }

    #[test]
    fn test_parse_rejects_truncated_payload() {
        let mut log = chain_log(
            Deposited {
                vaultId: U256::from(1),
                user: Address::ZERO,
                token: Address::ZERO,
                amount: U256::from(1u64),
            }
            .encode_log_data(),
            1,
            0x55,
        );
        log.data = Bytes::from(vec![0u8; 3]);
        assert!(matches!(parse_log(&log), Err(EventParseError::DecodeError(_))));
    }

    #[test]
    fn test_tx_hash_hex_is_lowercase() {
        let data = PlatformFeeUpdated {
            oldFee: U256::ZERO,
            newFee: U256::from(1u64),
        }
        .encode_log_data();
        let event = parse_log(&chain_log(data, 1, 0xAB)).unwrap();
        let hex = event.meta().tx_hash_hex();
        assert!(hex.starts_with("0xabab"));
        assert_eq!(hex.len(), 66);
    }
}
