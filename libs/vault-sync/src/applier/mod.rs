//! Event application: one decoded event becomes one domain mutation plus
//! notifications.
//!
//! Application is idempotent per (vault, transaction hash). The applier relies
//! on the store's conditional append, so live and replayed deliveries of the
//! same event may race without producing duplicate records.

mod token_metadata;

pub use token_metadata::{
    format_bps, scale_amount, TokenInfo, TokenMetadataResolver, DEFAULT_DECIMALS, NATIVE_TOKEN,
    UNKNOWN_SYMBOL,
};

use alloy_primitives::{Address, U256};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::chain::{
    parse_log, ChainError, ChainLog, ChainProvider, DepositedEvent, FeeRecipientUpdatedEvent,
    LogMeta, PlatformFeeUpdatedEvent, VaultCreatedEvent, VaultEvent, WithdrawnEvent,
};
use crate::email::EmailSender;
use crate::executor::{endpoints, RequestExecutor};
use crate::store::{
    AppendOutcome, NewNotification, NewVault, NotificationKind, StoreError, User, UserRole, Vault,
    VaultStatus, VaultStore,
};

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    VaultCreated { vault_id: String },
    VaultAlreadyExists { vault_id: String },
    DepositRecorded { vault_id: String },
    WithdrawalRecorded { vault_id: String },
    /// A record with the same transaction hash was already present
    Duplicate { vault_id: String },
    /// Deposit or withdrawal for a vault the store does not know
    VaultMissing { vault_id: String },
    /// `already_notified` counts admins who had this event from an earlier
    /// delivery
    AdminBroadcast {
        recipients: usize,
        already_notified: usize,
    },
}

#[derive(Debug, Clone)]
pub enum ApplyError {
    Store(StoreError),
    Chain(ChainError),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::Store(e) => write!(f, "{}", e),
            ApplyError::Chain(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ApplyError {}

impl From<StoreError> for ApplyError {
    fn from(err: StoreError) -> Self {
        ApplyError::Store(err)
    }
}

impl From<ChainError> for ApplyError {
    fn from(err: ChainError) -> Self {
        ApplyError::Chain(err)
    }
}

pub struct EventApplier {
    store: Arc<dyn VaultStore>,
    email: Arc<dyn EmailSender>,
    tokens: TokenMetadataResolver,
    provider: Arc<dyn ChainProvider>,
    executor: Arc<RequestExecutor>,
    contract: Address,
}

impl EventApplier {
    pub fn new(
        store: Arc<dyn VaultStore>,
        email: Arc<dyn EmailSender>,
        provider: Arc<dyn ChainProvider>,
        executor: Arc<RequestExecutor>,
        contract: Address,
        native_symbol: impl Into<String>,
    ) -> Self {
        let tokens = TokenMetadataResolver::new(provider.clone(), executor.clone(), native_symbol);
        Self {
            store,
            email,
            tokens,
            provider,
            executor,
            contract,
        }
    }

    pub fn tokens(&self) -> &TokenMetadataResolver {
        &self.tokens
    }

    /// Decode and apply a raw log. Decode and apply failures are logged and
    /// swallowed so one bad log never stops its batch.
    pub async fn apply_log(&self, log: &ChainLog) -> Option<ApplyOutcome> {
        match parse_log(log) {
            Ok(event) => self.apply_logged(&event).await,
            Err(e) => {
                tracing::warn!(
                    block = log.block_number,
                    tx_hash = %log.transaction_hash,
                    error = %e,
                    "Skipping undecodable log"
                );
                None
            }
        }
    }

    /// Apply an event, logging instead of returning errors.
    pub async fn apply_logged(&self, event: &VaultEvent) -> Option<ApplyOutcome> {
        match self.apply(event).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                let meta = event.meta();
                tracing::error!(
                    event = event.topic().name(),
                    block = meta.block_number,
                    tx_hash = %meta.tx_hash_hex(),
                    error = %e,
                    "Failed to apply event"
                );
                None
            }
        }
    }

    pub async fn apply(&self, event: &VaultEvent) -> Result<ApplyOutcome, ApplyError> {
        match event {
            VaultEvent::Created(e) => self.handle_created(e).await,
            VaultEvent::Deposited(e) => self.handle_deposited(e).await,
            VaultEvent::Withdrawn(e) => self.handle_withdrawn(e).await,
            VaultEvent::PlatformFeeUpdated(e) => self.handle_fee_updated(e).await,
            VaultEvent::FeeRecipientUpdated(e) => self.handle_recipient_updated(e).await,
        }
    }

    async fn handle_created(&self, event: &VaultCreatedEvent) -> Result<ApplyOutcome, ApplyError> {
        let vault_id = event.vault_id.to_string();
        let token = self.tokens.resolve(event.token).await;
        let unlock_time = u64::try_from(event.unlock_time).unwrap_or(u64::MAX);

        let outcome = self
            .store
            .upsert_vault(NewVault {
                vault_id: vault_id.clone(),
                user_address: address_key(event.user),
                token_address: address_key(event.token),
                token_symbol: token.symbol.clone(),
                token_decimals: token.decimals,
                balance: "0".to_string(),
                unlock_time,
                status: VaultStatus::Active,
                created_tx_hash: Some(event.meta.tx_hash_hex()),
                created_block: Some(event.meta.block_number),
            })
            .await?;

        if !outcome.is_created() {
            tracing::debug!(vault_id = %vault_id, "Vault already mirrored");
            return Ok(ApplyOutcome::VaultAlreadyExists { vault_id });
        }

        tracing::info!(
            vault_id = %vault_id,
            user = %event.user,
            symbol = %token.symbol,
            block = event.meta.block_number,
            "Vault created"
        );

        if let Some(user) = self.find_user(event.user).await {
            let unlock_at = Utc
                .timestamp_opt(unlock_time as i64, 0)
                .single()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| unlock_time.to_string());
            self.notify(
                &user,
                NotificationKind::VaultCreated,
                "Vault created".to_string(),
                format!(
                    "Your {} vault #{} is locked until {}.",
                    token.symbol, vault_id, unlock_at
                ),
                json!({
                    "vault_id": vault_id,
                    "token": address_key(event.token),
                    "token_symbol": token.symbol,
                    "unlock_time": unlock_time,
                    "tx_hash": event.meta.tx_hash_hex(),
                    "block_number": event.meta.block_number,
                }),
                &event.meta,
            )
            .await;
        }

        Ok(ApplyOutcome::VaultCreated { vault_id })
    }

    async fn handle_deposited(&self, event: &DepositedEvent) -> Result<ApplyOutcome, ApplyError> {
        let vault_id = event.vault_id.to_string();
        let Some(vault) = self.store.find_vault_by_id(&vault_id).await? else {
            return Ok(vault_missing(vault_id, "deposit", &event.meta));
        };

        // The vault's recorded metadata is authoritative for its token
        let token = vault_token(&vault);
        let amount = scale_amount(event.amount, token.decimals);
        let tx_hash = event.meta.tx_hash_hex();

        let appended = match self
            .store
            .append_deposit(&vault_id, amount.clone(), &tx_hash, event.meta.block_number)
            .await
        {
            Ok(outcome) => outcome,
            Err(StoreError::VaultNotFound(_)) => {
                return Ok(vault_missing(vault_id, "deposit", &event.meta))
            }
            Err(e) => return Err(e.into()),
        };

        if appended == AppendOutcome::Duplicate {
            tracing::debug!(vault_id = %vault_id, tx_hash = %tx_hash, "Deposit already recorded");
            return Ok(ApplyOutcome::Duplicate { vault_id });
        }

        tracing::info!(
            vault_id = %vault_id,
            amount = %amount,
            symbol = %token.symbol,
            tx_hash = %tx_hash,
            "Deposit recorded"
        );

        if let Some(user) = self.find_user(event.user).await {
            self.notify(
                &user,
                NotificationKind::Deposit,
                "Deposit confirmed".to_string(),
                format!("{} {} deposited into vault #{}.", amount, token.symbol, vault_id),
                json!({
                    "vault_id": vault_id,
                    "amount": amount,
                    "token_symbol": token.symbol,
                    "tx_hash": tx_hash,
                    "block_number": event.meta.block_number,
                }),
                &event.meta,
            )
            .await;

            let email = self.email.clone();
            tokio::spawn(async move {
                if let Err(e) = email
                    .send_deposit_confirmation(&user, &vault, &amount, &tx_hash)
                    .await
                {
                    tracing::warn!(user_id = %user.id, error = %e, "Deposit email not sent");
                }
            });
        }

        Ok(ApplyOutcome::DepositRecorded { vault_id })
    }

    async fn handle_withdrawn(&self, event: &WithdrawnEvent) -> Result<ApplyOutcome, ApplyError> {
        let vault_id = event.vault_id.to_string();
        let Some(vault) = self.store.find_vault_by_id(&vault_id).await? else {
            return Ok(vault_missing(vault_id, "withdrawal", &event.meta));
        };

        let token = vault_token(&vault);
        let amount = scale_amount(event.amount, token.decimals);
        let fee = scale_amount(event.platform_fee, token.decimals);
        let tx_hash = event.meta.tx_hash_hex();

        let appended = match self
            .store
            .append_withdrawal(
                &vault_id,
                amount.clone(),
                fee.clone(),
                &tx_hash,
                event.meta.block_number,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(StoreError::VaultNotFound(_)) => {
                return Ok(vault_missing(vault_id, "withdrawal", &event.meta))
            }
            Err(e) => return Err(e.into()),
        };

        if appended == AppendOutcome::Duplicate {
            tracing::debug!(vault_id = %vault_id, tx_hash = %tx_hash, "Withdrawal already recorded");
            return Ok(ApplyOutcome::Duplicate { vault_id });
        }

        tracing::info!(
            vault_id = %vault_id,
            amount = %amount,
            fee = %fee,
            symbol = %token.symbol,
            tx_hash = %tx_hash,
            "Withdrawal recorded"
        );

        if let Some(user) = self.find_user(event.user).await {
            self.notify(
                &user,
                NotificationKind::Withdrawal,
                "Withdrawal confirmed".to_string(),
                format!(
                    "{} {} withdrawn from vault #{} (platform fee {} {}).",
                    amount, token.symbol, vault_id, fee, token.symbol
                ),
                json!({
                    "vault_id": vault_id,
                    "amount": amount,
                    "platform_fee": fee,
                    "token_symbol": token.symbol,
                    "tx_hash": tx_hash,
                    "block_number": event.meta.block_number,
                }),
                &event.meta,
            )
            .await;

            let email = self.email.clone();
            tokio::spawn(async move {
                if let Err(e) = email
                    .send_withdrawal_confirmation(&user, &vault, &amount, &fee, &tx_hash)
                    .await
                {
                    tracing::warn!(user_id = %user.id, error = %e, "Withdrawal email not sent");
                }
            });
        }

        Ok(ApplyOutcome::WithdrawalRecorded { vault_id })
    }

    async fn handle_fee_updated(
        &self,
        event: &PlatformFeeUpdatedEvent,
    ) -> Result<ApplyOutcome, ApplyError> {
        let old_fee = format_bps(event.old_fee);
        let new_fee = format_bps(event.new_fee);
        tracing::info!(old_fee = %old_fee, new_fee = %new_fee, "Platform fee updated");

        let (recipients, already_notified) = self
            .broadcast_to_admins(
                NotificationKind::PlatformFeeUpdated,
                "Platform fee updated".to_string(),
                format!("Platform fee changed from {} to {}.", old_fee, new_fee),
                json!({
                    "old_fee_bps": event.old_fee.to_string(),
                    "new_fee_bps": event.new_fee.to_string(),
                    "tx_hash": event.meta.tx_hash_hex(),
                    "block_number": event.meta.block_number,
                }),
                &event.meta,
            )
            .await?;

        Ok(ApplyOutcome::AdminBroadcast {
            recipients,
            already_notified,
        })
    }

    async fn handle_recipient_updated(
        &self,
        event: &FeeRecipientUpdatedEvent,
    ) -> Result<ApplyOutcome, ApplyError> {
        let old_recipient = address_key(event.old_recipient);
        let new_recipient = address_key(event.new_recipient);
        tracing::info!(old = %old_recipient, new = %new_recipient, "Fee recipient updated");

        let (recipients, already_notified) = self
            .broadcast_to_admins(
                NotificationKind::FeeRecipientUpdated,
                "Fee recipient updated".to_string(),
                format!("Fee recipient changed from {} to {}.", old_recipient, new_recipient),
                json!({
                    "old_recipient": old_recipient,
                    "new_recipient": new_recipient,
                    "tx_hash": event.meta.tx_hash_hex(),
                    "block_number": event.meta.block_number,
                }),
                &event.meta,
            )
            .await?;

        Ok(ApplyOutcome::AdminBroadcast {
            recipients,
            already_notified,
        })
    }

    /// Read the vault from the contract and overwrite the local balance with
    /// the on-chain value, creating the vault first when it is missing.
    pub async fn resync_vault(&self, vault_id: U256) -> Result<Vault, ApplyError> {
        let provider = self.provider.as_ref();
        let contract = self.contract;
        let on_chain = self
            .executor
            .execute(endpoints::CONTRACT_CALL, || async move {
                provider.vault_by_id(contract, vault_id).await
            })
            .await?;

        let id = vault_id.to_string();
        if on_chain.owner == Address::ZERO {
            return Err(StoreError::VaultNotFound(id).into());
        }

        let token = self.tokens.resolve(on_chain.token).await;
        let balance = scale_amount(on_chain.balance, token.decimals);
        let status = if on_chain.active {
            VaultStatus::Active
        } else {
            VaultStatus::Inactive
        };

        self.store
            .upsert_vault(NewVault {
                vault_id: id.clone(),
                user_address: address_key(on_chain.owner),
                token_address: address_key(on_chain.token),
                token_symbol: token.symbol.clone(),
                token_decimals: token.decimals,
                balance: balance.clone(),
                unlock_time: u64::try_from(on_chain.unlock_time).unwrap_or(u64::MAX),
                status,
                created_tx_hash: None,
                created_block: None,
            })
            .await?;
        self.store.set_vault_balance(&id, balance.clone(), status).await?;

        tracing::info!(vault_id = %id, balance = %balance, symbol = %token.symbol, "Vault resynced");

        self.store
            .find_vault_by_id(&id)
            .await?
            .ok_or_else(|| StoreError::VaultNotFound(id).into())
    }

    async fn find_user(&self, address: Address) -> Option<User> {
        match self.store.find_user_by_address(&address_key(address)).await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "User lookup failed");
                None
            }
        }
    }

    async fn notify(
        &self,
        user: &User,
        kind: NotificationKind,
        title: String,
        body: String,
        metadata: serde_json::Value,
        source: &LogMeta,
    ) -> Delivery {
        let notification = NewNotification {
            user_id: user.id.clone(),
            address: user.address.clone(),
            kind,
            title,
            body,
            metadata,
            priority: kind.priority(),
            dedupe_key: Some(source.event_key()),
        };
        match self.store.create_notification(notification).await {
            Ok(Some(_)) => Delivery::Sent,
            Ok(None) => {
                tracing::debug!(user_id = %user.id, kind = ?kind, event = %source.event_key(), "Notification already sent");
                Delivery::Duplicate
            }
            Err(e) => {
                tracing::warn!(user_id = %user.id, kind = ?kind, error = %e, "Failed to create notification");
                Delivery::Failed
            }
        }
    }

    /// Notify every admin once per source event. Returns (sent, already sent).
    async fn broadcast_to_admins(
        &self,
        kind: NotificationKind,
        title: String,
        body: String,
        metadata: serde_json::Value,
        source: &LogMeta,
    ) -> Result<(usize, usize), ApplyError> {
        let admins = self.store.find_users_by_role(UserRole::Admin).await?;
        let mut sent = 0;
        let mut duplicates = 0;
        for admin in &admins {
            match self
                .notify(admin, kind, title.clone(), body.clone(), metadata.clone(), source)
                .await
            {
                Delivery::Sent => sent += 1,
                Delivery::Duplicate => duplicates += 1,
                Delivery::Failed => {}
            }
        }
        Ok((sent, duplicates))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Duplicate,
    Failed,
}

/// Lowercase 0x-prefixed address, the form addresses are stored in.
pub fn address_key(address: Address) -> String {
    format!("{:#x}", address)
}

fn vault_token(vault: &Vault) -> TokenInfo {
    TokenInfo {
        symbol: vault.token_symbol.clone(),
        decimals: vault.token_decimals,
    }
}

fn vault_missing(vault_id: String, kind: &str, meta: &LogMeta) -> ApplyOutcome {
    tracing::warn!(
        vault_id = %vault_id,
        kind,
        block = meta.block_number,
        tx_hash = %meta.tx_hash_hex(),
        "Vault not found, dropping event"
    );
    ApplyOutcome::VaultMissing { vault_id }
}
