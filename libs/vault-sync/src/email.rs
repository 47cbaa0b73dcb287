//! Outbound email collaborator. Delivery is fire-and-forget.

use crate::store::{User, Vault};

#[derive(Debug, Clone)]
pub enum EmailError {
    MissingRecipient { user_id: String },
    Delivery(String),
}

impl std::fmt::Display for EmailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmailError::MissingRecipient { user_id } => {
                write!(f, "User {} has no email address", user_id)
            }
            EmailError::Delivery(msg) => write!(f, "Email delivery failed: {}", msg),
        }
    }
}

impl std::error::Error for EmailError {}

#[async_trait::async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_deposit_confirmation(
        &self,
        user: &User,
        vault: &Vault,
        amount: &str,
        tx_hash: &str,
    ) -> Result<(), EmailError>;

    async fn send_withdrawal_confirmation(
        &self,
        user: &User,
        vault: &Vault,
        amount: &str,
        fee: &str,
        tx_hash: &str,
    ) -> Result<(), EmailError>;
}

/// Writes confirmations to the log instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LoggingEmailSender;

#[async_trait::async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send_deposit_confirmation(
        &self,
        user: &User,
        vault: &Vault,
        amount: &str,
        tx_hash: &str,
    ) -> Result<(), EmailError> {
        let to = user.email.as_deref().ok_or_else(|| EmailError::MissingRecipient {
            user_id: user.id.clone(),
        })?;
        tracing::info!(
            to,
            vault_id = %vault.vault_id,
            amount,
            symbol = %vault.token_symbol,
            tx_hash,
            "Deposit confirmation email"
        );
        Ok(())
    }

    async fn send_withdrawal_confirmation(
        &self,
        user: &User,
        vault: &Vault,
        amount: &str,
        fee: &str,
        tx_hash: &str,
    ) -> Result<(), EmailError> {
        let to = user.email.as_deref().ok_or_else(|| EmailError::MissingRecipient {
            user_id: user.id.clone(),
        })?;
        tracing::info!(
            to,
            vault_id = %vault.vault_id,
            amount,
            fee,
            symbol = %vault.token_symbol,
            tx_hash,
            "Withdrawal confirmation email"
        );
        Ok(())
    }
}
