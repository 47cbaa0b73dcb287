//! Chain access: event definitions, the provider seam and the connection
//! lifecycle.

mod alloy_provider;
mod connection;
mod errors;
mod event_types;
mod provider;

pub use alloy_provider::{derive_ws_url, AlloyChainProvider};
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, DEFAULT_MAX_RECONNECT_ATTEMPTS,
};
pub use errors::ChainError;
pub use event_types::{
    parse_log, ChainLog, DepositedEvent, EventParseError, EventTopic, FeeRecipientUpdatedEvent,
    LogMeta, PlatformFeeUpdatedEvent, VaultCreatedEvent, VaultEvent, WithdrawnEvent,
};
pub use event_types::{Deposited, FeeRecipientUpdated, PlatformFeeUpdated, VaultCreated, Withdrawn};
pub use provider::{ChainProvider, ContractMetadata, LogSubscription, OnChainVault};

pub(crate) use alloy_provider::receiver_stream;
