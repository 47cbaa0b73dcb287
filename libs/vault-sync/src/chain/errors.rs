//! Error types for chain connectivity

use alloy_primitives::Address;
use std::time::Duration;

use crate::executor::{classify_rate_limit, RateLimitSignal, RetryClassify};

/// Errors that can occur during chain operations
#[derive(Debug, Clone)]
pub enum ChainError {
    // Connection errors
    WebSocketError(String),
    RpcError(String),
    ConnectionLost { retry_count: u32 },
    HostUnresolved(String),
    ReconnectHalted { attempts: u32 },

    // Provider quota errors
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    // Contract binding errors
    ContractAbsent { address: Address },

    // Event processing errors
    EventParseError { reason: String },
    SubscriptionError(String),
    SubscriptionUnsupported,

    // Configuration errors
    InvalidConfig(String),
}

impl ChainError {
    /// Classify a raw provider error message.
    ///
    /// Rate-limit responses and host resolution failures are pulled out of the
    /// generic RPC bucket because the executor and the reconnect policy treat
    /// them differently.
    pub fn from_rpc_message(message: impl Into<String>) -> Self {
        let message = message.into();

        if let Some(signal) = classify_rate_limit(&message) {
            return ChainError::RateLimited {
                message,
                retry_after: signal.retry_after,
            };
        }

        let lower = message.to_lowercase();
        if lower.contains("dns error")
            || lower.contains("failed to lookup address")
            || lower.contains("name or service not known")
            || lower.contains("no such host")
            || lower.contains("nodename nor servname")
        {
            return ChainError::HostUnresolved(message);
        }

        ChainError::RpcError(message)
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ChainError::RateLimited { .. })
    }

    /// Whether the reconnect state machine should keep trying after this error.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ChainError::HostUnresolved(_)
                | ChainError::InvalidConfig(_)
                | ChainError::ReconnectHalted { .. }
        )
    }
}

impl RetryClassify for ChainError {
    fn rate_limit_signal(&self) -> Option<RateLimitSignal> {
        match self {
            ChainError::RateLimited { retry_after, .. } => Some(RateLimitSignal {
                retry_after: *retry_after,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::WebSocketError(msg) => write!(f, "WebSocket error: {}", msg),
            ChainError::RpcError(msg) => write!(f, "RPC error: {}", msg),
            ChainError::ConnectionLost { retry_count } => {
                write!(f, "Connection lost after {} retries", retry_count)
            }
            ChainError::HostUnresolved(msg) => write!(f, "Host resolution failed: {}", msg),
            ChainError::ReconnectHalted { attempts } => write!(
                f,
                "Automatic reconnect halted after {} attempts (reinitialize required)",
                attempts
            ),
            ChainError::RateLimited {
                message,
                retry_after,
            } => match retry_after {
                Some(hint) => write!(f, "Rate limited (retry after {:?}): {}", hint, message),
                None => write!(f, "Rate limited: {}", message),
            },
            ChainError::ContractAbsent { address } => {
                write!(f, "No contract code at address {}", address)
            }
            ChainError::EventParseError { reason } => write!(f, "Event parse error: {}", reason),
            ChainError::SubscriptionError(msg) => write!(f, "Subscription error: {}", msg),
            ChainError::SubscriptionUnsupported => {
                write!(f, "Provider does not support log subscriptions")
            }
            ChainError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<tokio_tungstenite::tungstenite::Error> for ChainError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChainError::WebSocketError(err.to_string())
    }
}
