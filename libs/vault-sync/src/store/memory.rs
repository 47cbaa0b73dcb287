//! In-process store used by the service binary and by tests.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{
    AppendOutcome, Deposit, NewNotification, NewVault, Notification, StoreError, UpsertOutcome,
    User, UserRole, Vault, VaultStatus, VaultStore, Withdrawal,
};


#[derive(Debug, Default)]
struct Inner {
    vaults: HashMap<String, Vault>,
    users: Vec<User>,
    notifications: Vec<Notification>,
    next_notification_id: u64,
}

/// Every mutation runs under one lock, which makes append-if-absent atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let store = Self::new();
        for user in users {
            store.insert_user(user);
        }
        store
    }

    /// Add or replace a user, keyed by address.
    pub fn insert_user(&self, mut user: User) {
        user.address = user.address.to_lowercase();
        let mut inner = self.inner.lock();
        inner.users.retain(|u| u.address != user.address);
        inner.users.push(user);
    }

    pub fn vault(&self, vault_id: &str) -> Option<Vault> {
        self.inner.lock().vaults.get(vault_id).cloned()
    }

    pub fn vault_count(&self) -> usize {
        self.inner.lock().vaults.len()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.lock().notifications.clone()
    }

    pub fn notifications_for(&self, user_id: &str) -> Vec<Notification> {
        self.inner
            .lock()
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl VaultStore for MemoryStore {
    async fn find_vault_by_id(&self, vault_id: &str) -> Result<Option<Vault>, StoreError> {
        Ok(self.vault(vault_id))
    }

    async fn upsert_vault(&self, vault: NewVault) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.vaults.get(&vault.vault_id) {
            return Ok(UpsertOutcome::Existing(existing.clone()));
        }
        let vault = vault.into_vault(Utc::now());
        inner.vaults.insert(vault.vault_id.clone(), vault.clone());
        Ok(UpsertOutcome::Created(vault))
    }

    async fn set_vault_balance(
        &self,
        vault_id: &str,
        balance: String,
        status: VaultStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let vault = inner
            .vaults
            .get_mut(vault_id)
            .ok_or_else(|| StoreError::VaultNotFound(vault_id.to_string()))?;
        vault.balance = balance;
        vault.status = status;
        Ok(())
    }

    async fn append_deposit(
        &self,
        vault_id: &str,
        amount: String,
        tx_hash: &str,
        block_number: u64,
    ) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let vault = inner
            .vaults
            .get_mut(vault_id)
            .ok_or_else(|| StoreError::VaultNotFound(vault_id.to_string()))?;

        if vault.deposits.iter().any(|d| d.transaction_hash == tx_hash) {
            return Ok(AppendOutcome::Duplicate);
        }
        vault.deposits.push(Deposit {
            amount,
            transaction_hash: tx_hash.to_string(),
            block_number,
            timestamp: Utc::now(),
        });
        Ok(AppendOutcome::Appended)
    }

    async fn append_withdrawal(
        &self,
        vault_id: &str,
        amount: String,
        platform_fee: String,
        tx_hash: &str,
        block_number: u64,
    ) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let vault = inner
            .vaults
            .get_mut(vault_id)
            .ok_or_else(|| StoreError::VaultNotFound(vault_id.to_string()))?;

        if vault.withdrawals.iter().any(|w| w.transaction_hash == tx_hash) {
            return Ok(AppendOutcome::Duplicate);
        }
        vault.withdrawals.push(Withdrawal {
            amount,
            platform_fee,
            transaction_hash: tx_hash.to_string(),
            block_number,
            timestamp: Utc::now(),
        });
        Ok(AppendOutcome::Appended)
    }

    async fn find_user_by_address(&self, address: &str) -> Result<Option<User>, StoreError> {
        let address = address.to_lowercase();
        Ok(self
            .inner
            .lock()
            .users
            .iter()
            .find(|u| u.address == address)
            .cloned())
    }

    async fn find_users_by_role(&self, role: UserRole) -> Result<Vec<User>, StoreError> {
        Ok(self
            .inner
            .lock()
            .users
            .iter()
            .filter(|u| u.role == role)
            .cloned()
            .collect())
    }

    async fn create_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Option<Notification>, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(key) = &notification.dedupe_key {
            let seen = inner
                .notifications
                .iter()
                .any(|n| n.user_id == notification.user_id && n.dedupe_key.as_ref() == Some(key));
            if seen {
                return Ok(None);
            }
        }
        inner.next_notification_id += 1;
        let created = Notification {
            id: inner.next_notification_id,
            user_id: notification.user_id,
            address: notification.address,
            kind: notification.kind,
            title: notification.title,
            body: notification.body,
            metadata: notification.metadata,
            priority: notification.priority,
            dedupe_key: notification.dedupe_key,
            read: false,
            created_at: Utc::now(),
        };
        inner.notifications.push(created.clone());
        Ok(Some(created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NotificationKind, NotificationPriority};
    use std::sync::Arc;

    fn new_vault(id: &str) -> NewVault {
        NewVault {
            vault_id: id.to_string(),
            user_address: "0xaa".to_string(),
            token_address: "0x0000000000000000000000000000000000000000".to_string(),
            token_symbol: "ETH".to_string(),
            token_decimals: 18,
            balance: "0".to_string(),
            unlock_time: 1_700_000_000,
            status: VaultStatus::Active,
            created_tx_hash: None,
            created_block: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_create_or_noop() {
        let store = MemoryStore::new();
        assert!(store.upsert_vault(new_vault("7")).await.unwrap().is_created());

        let mut changed = new_vault("7");
        changed.unlock_time = 1;
        let outcome = store.upsert_vault(changed).await.unwrap();
        assert!(!outcome.is_created());
        assert_eq!(outcome.vault().unlock_time, 1_700_000_000);
        assert_eq!(store.vault_count(), 1);
    }

    #[tokio::test]
    async fn test_append_deposit_is_conditional() {
        let store = MemoryStore::new();
        store.upsert_vault(new_vault("1")).await.unwrap();

        let first = store.append_deposit("1", "1.5".into(), "0xabc", 10).await.unwrap();
        let second = store.append_deposit("1", "1.5".into(), "0xabc", 10).await.unwrap();
        assert_eq!(first, AppendOutcome::Appended);
        assert_eq!(second, AppendOutcome::Duplicate);
        assert_eq!(store.vault("1").unwrap().deposits.len(), 1);
    }

    #[tokio::test]
    async fn test_append_to_missing_vault() {
        let store = MemoryStore::new();
        let err = store
            .append_withdrawal("9", "1".into(), "0".into(), "0x1", 1)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::VaultNotFound("9".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_record_once() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_vault(new_vault("3")).await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.append_deposit("3", "2".into(), "0xfeed", 5).await.unwrap()
                })
            })
            .collect();

        let mut appended = 0;
        for task in tasks {
            if task.await.unwrap() == AppendOutcome::Appended {
                appended += 1;
            }
        }
        assert_eq!(appended, 1);
        assert_eq!(store.vault("3").unwrap().deposits.len(), 1);
    }

    fn notification(user_id: &str, key: Option<&str>) -> NewNotification {
        NewNotification {
            user_id: user_id.to_string(),
            address: "0xcc".to_string(),
            kind: NotificationKind::PlatformFeeUpdated,
            title: "Platform fee updated".to_string(),
            body: String::new(),
            metadata: serde_json::Value::Null,
            priority: NotificationPriority::High,
            dedupe_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_keyed_notification_stored_once_per_user() {
        let store = MemoryStore::new();

        assert!(store.create_notification(notification("a1", Some("0xab:3"))).await.unwrap().is_some());
        assert!(store.create_notification(notification("a1", Some("0xab:3"))).await.unwrap().is_none());
        assert!(store.create_notification(notification("a2", Some("0xab:3"))).await.unwrap().is_some());
        assert!(store.create_notification(notification("a1", Some("0xab:4"))).await.unwrap().is_some());

        // Unkeyed notifications are never deduplicated
        assert!(store.create_notification(notification("a1", None)).await.unwrap().is_some());
        assert!(store.create_notification(notification("a1", None)).await.unwrap().is_some());

        assert_eq!(store.notifications_for("a1").len(), 4);
    }

    #[tokio::test]
    async fn test_users_by_role_and_address() {
        let store = MemoryStore::with_users([
            User {
                id: "u1".into(),
                address: "0xAAbb".into(),
                email: None,
                name: None,
                role: UserRole::User,
            },
            User {
                id: "a1".into(),
                address: "0xcc".into(),
                email: Some("ops@example.com".into()),
                name: None,
                role: UserRole::Admin,
            },
        ]);

        let user = store.find_user_by_address("0xaabb").await.unwrap().unwrap();
        assert_eq!(user.id, "u1");
        let admins = store.find_users_by_role(UserRole::Admin).await.unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].id, "a1");
    }
}
