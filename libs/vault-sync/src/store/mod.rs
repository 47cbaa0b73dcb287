//! Domain records and the store collaborator.
//!
//! The store is external to the pipeline; [`VaultStore`] is the seam. Appends
//! are conditional on the transaction hash so replayed and live events can
//! overlap without double-counting.

mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultStatus {
    Active,
    Inactive,
}

/// A deposit appended from a `Deposited` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Display units, already scaled by token decimals
    pub amount: String,
    /// Unique within the owning vault
    pub transaction_hash: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// A withdrawal appended from a `Withdrawn` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub amount: String,
    pub platform_fee: String,
    pub transaction_hash: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// Local mirror of an on-chain vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    /// Decimal vault id, unique and immutable
    pub vault_id: String,
    pub user_address: String,
    pub token_address: String,
    pub token_symbol: String,
    pub token_decimals: u8,
    /// Display units. Only ever replaced wholesale by a resync.
    pub balance: String,
    /// Unix seconds, fixed at creation
    pub unlock_time: u64,
    pub status: VaultStatus,
    pub deposits: Vec<Deposit>,
    pub withdrawals: Vec<Withdrawal>,
    pub created_tx_hash: Option<String>,
    pub created_block: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create a vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVault {
    pub vault_id: String,
    pub user_address: String,
    pub token_address: String,
    pub token_symbol: String,
    pub token_decimals: u8,
    pub balance: String,
    pub unlock_time: u64,
    pub status: VaultStatus,
    pub created_tx_hash: Option<String>,
    pub created_block: Option<u64>,
}

impl NewVault {
    pub fn into_vault(self, created_at: DateTime<Utc>) -> Vault {
        Vault {
            vault_id: self.vault_id,
            user_address: self.user_address,
            token_address: self.token_address,
            token_symbol: self.token_symbol,
            token_decimals: self.token_decimals,
            balance: self.balance,
            unlock_time: self.unlock_time,
            status: self.status,
            deposits: Vec::new(),
            withdrawals: Vec::new(),
            created_tx_hash: self.created_tx_hash,
            created_block: self.created_block,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Lowercase 0x-prefixed wallet address
    pub address: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub role: UserRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    VaultCreated,
    Deposit,
    Withdrawal,
    PlatformFeeUpdated,
    FeeRecipientUpdated,
}

impl NotificationKind {
    /// Admin broadcasts are high priority, owner notifications normal.
    pub fn priority(self) -> NotificationPriority {
        match self {
            Self::PlatformFeeUpdated | Self::FeeRecipientUpdated => NotificationPriority::High,
            Self::VaultCreated | Self::Deposit | Self::Withdrawal => NotificationPriority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: String,
    pub address: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub metadata: serde_json::Value,
    pub priority: NotificationPriority,
    /// Source event key (`tx_hash:log_index`); at most one notification per
    /// user and key is stored
    pub dedupe_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub user_id: String,
    pub address: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub metadata: serde_json::Value,
    pub priority: NotificationPriority,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(Vault),
    /// Vault already existed; it is returned unchanged
    Existing(Vault),
}

impl UpsertOutcome {
    pub fn vault(&self) -> &Vault {
        match self {
            UpsertOutcome::Created(v) | UpsertOutcome::Existing(v) => v,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// A record with the same transaction hash already exists on the vault
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    VaultNotFound(String),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::VaultNotFound(id) => write!(f, "Vault {} not found", id),
            StoreError::Backend(msg) => write!(f, "Store backend error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Document store for vaults, users and notifications.
///
/// `append_deposit` and `append_withdrawal` must check-and-append atomically
/// with respect to other writers of the same vault.
#[async_trait::async_trait]
pub trait VaultStore: Send + Sync {
    async fn find_vault_by_id(&self, vault_id: &str) -> Result<Option<Vault>, StoreError>;

    /// Create the vault unless one with the same id exists.
    async fn upsert_vault(&self, vault: NewVault) -> Result<UpsertOutcome, StoreError>;

    /// Overwrite balance and status from upstream truth.
    async fn set_vault_balance(
        &self,
        vault_id: &str,
        balance: String,
        status: VaultStatus,
    ) -> Result<(), StoreError>;

    async fn append_deposit(
        &self,
        vault_id: &str,
        amount: String,
        tx_hash: &str,
        block_number: u64,
    ) -> Result<AppendOutcome, StoreError>;

    async fn append_withdrawal(
        &self,
        vault_id: &str,
        amount: String,
        platform_fee: String,
        tx_hash: &str,
        block_number: u64,
    ) -> Result<AppendOutcome, StoreError>;

    async fn find_user_by_address(&self, address: &str) -> Result<Option<User>, StoreError>;

    async fn find_users_by_role(&self, role: UserRole) -> Result<Vec<User>, StoreError>;

    /// Store a notification. Returns `None` when one with the same user and
    /// dedupe key already exists.
    async fn create_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Option<Notification>, StoreError>;
}
