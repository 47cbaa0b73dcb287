//! Token symbol and decimals lookup with an in-process cache.

use alloy_primitives::{Address, U256};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::ChainProvider;
use crate::executor::{endpoints, RequestExecutor};

/// Sentinel address used by the contract for the chain's native asset
pub const NATIVE_TOKEN: Address = Address::ZERO;

/// Symbol recorded when token metadata cannot be read
pub const UNKNOWN_SYMBOL: &str = "UNKNOWN";

pub const DEFAULT_DECIMALS: u8 = 18;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u8,
}

/// Each field is cached once read, independently of the other.
#[derive(Debug, Clone, Default)]
struct CachedToken {
    symbol: Option<String>,
    decimals: Option<u8>,
}

pub struct TokenMetadataResolver {
    provider: Arc<dyn ChainProvider>,
    executor: Arc<RequestExecutor>,
    native_symbol: String,
    cache: RwLock<HashMap<Address, CachedToken>>,
}

impl TokenMetadataResolver {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        executor: Arc<RequestExecutor>,
        native_symbol: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            executor,
            native_symbol: native_symbol.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve symbol and decimals. Never fails: an unreadable field yields
    /// [`UNKNOWN_SYMBOL`] or [`DEFAULT_DECIMALS`], which are not cached. A
    /// field that was read is cached even when the other one failed.
    pub async fn resolve(&self, token: Address) -> TokenInfo {
        if token == NATIVE_TOKEN {
            return TokenInfo {
                symbol: self.native_symbol.clone(),
                decimals: DEFAULT_DECIMALS,
            };
        }

        let known = self.cache.read().get(&token).cloned().unwrap_or_default();
        let provider = self.provider.as_ref();

        let symbol = match known.symbol {
            Some(symbol) => Some(symbol),
            None => match self
                .executor
                .execute(endpoints::CONTRACT_CALL, || async move { provider.token_symbol(token).await })
                .await
            {
                Ok(symbol) => {
                    self.cache.write().entry(token).or_default().symbol = Some(symbol.clone());
                    Some(symbol)
                }
                Err(e) => {
                    tracing::warn!(token = %token, error = %e, "Failed to read token symbol");
                    None
                }
            },
        };

        let decimals = match known.decimals {
            Some(decimals) => Some(decimals),
            None => match self
                .executor
                .execute(endpoints::CONTRACT_CALL, || async move { provider.token_decimals(token).await })
                .await
            {
                Ok(decimals) => {
                    self.cache.write().entry(token).or_default().decimals = Some(decimals);
                    Some(decimals)
                }
                Err(e) => {
                    tracing::warn!(token = %token, error = %e, "Failed to read token decimals");
                    None
                }
            },
        };

        TokenInfo {
            symbol: symbol.unwrap_or_else(|| UNKNOWN_SYMBOL.to_string()),
            decimals: decimals.unwrap_or(DEFAULT_DECIMALS),
        }
    }

    /// Cached metadata, only once both fields have been read.
    pub fn cached(&self, token: Address) -> Option<TokenInfo> {
        let cache = self.cache.read();
        let entry = cache.get(&token)?;
        Some(TokenInfo {
            symbol: entry.symbol.clone()?,
            decimals: entry.decimals?,
        })
    }
}

/// Render a raw integer amount in display units, trimming trailing zeros.
///
/// `scale_amount(1_500_000, 6)` is `"1.5"`.
pub fn scale_amount(raw: U256, decimals: u8) -> String {
    if decimals == 0 {
        return raw.to_string();
    }

    let (whole, fraction) = match U256::from(10u64).checked_pow(U256::from(decimals)) {
        Some(divisor) => (raw / divisor, raw % divisor),
        // 10^decimals exceeds U256, so every representable amount is fractional
        None => (U256::ZERO, raw),
    };

    if fraction.is_zero() {
        return whole.to_string();
    }

    let padded = format!("{:0>width$}", fraction.to_string(), width = decimals as usize);
    format!("{}.{}", whole, padded.trim_end_matches('0'))
}

/// Basis points as a percentage string, e.g. `75` becomes `"0.75%"`.
pub fn format_bps(bps: U256) -> String {
    format!("{}%", scale_amount(bps, 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChainProvider;
    use std::sync::atomic::Ordering;

    fn resolver(provider: Arc<MockChainProvider>) -> TokenMetadataResolver {
        TokenMetadataResolver::new(provider, Arc::new(RequestExecutor::default()), "ETH")
    }

    #[tokio::test]
    async fn test_decimals_cached_when_symbol_reverts() {
        let token = Address::repeat_byte(0x42);
        let provider = Arc::new(MockChainProvider::new().with_decimals_only(token, 6));
        let tokens = resolver(provider.clone());

        let first = tokens.resolve(token).await;
        let second = tokens.resolve(token).await;

        assert_eq!(first, second);
        assert_eq!(first.symbol, UNKNOWN_SYMBOL);
        assert_eq!(first.decimals, 6);
        assert_eq!(provider.decimals_calls.load(Ordering::SeqCst), 1);
        // The symbol is retried on each lookup
        assert_eq!(provider.symbol_calls.load(Ordering::SeqCst), 2);
        assert!(tokens.cached(token).is_none());
    }

    #[tokio::test]
    async fn test_native_and_cached_tokens_skip_the_node() {
        let token = Address::repeat_byte(0x43);
        let provider = Arc::new(MockChainProvider::new().with_token(token, "DAI", 18));
        let tokens = resolver(provider.clone());

        let native = tokens.resolve(NATIVE_TOKEN).await;
        assert_eq!(native.symbol, "ETH");
        assert_eq!(native.decimals, 18);

        tokens.resolve(token).await;
        tokens.resolve(token).await;
        assert_eq!(provider.symbol_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.decimals_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.cached(token).unwrap().symbol, "DAI");
    }

    #[test]
    fn test_scale_amount() {
        assert_eq!(scale_amount(U256::from(1_500_000u64), 6), "1.5");
        assert_eq!(scale_amount(U256::from(2_000_000u64), 6), "2");
        assert_eq!(scale_amount(U256::from(1u64), 18), "0.000000000000000001");
        assert_eq!(scale_amount(U256::ZERO, 18), "0");
        assert_eq!(scale_amount(U256::from(42u64), 0), "42");
        assert_eq!(
            scale_amount(U256::from(1_234_500_000_000_000_000u128), 18),
            "1.2345"
        );
    }

    #[test]
    fn test_scale_amount_huge_decimals() {
        let scaled = scale_amount(U256::from(5u64), 100);
        assert!(scaled.starts_with("0.000"));
        assert!(scaled.ends_with('5'));
    }

    #[test]
    fn test_format_bps() {
        assert_eq!(format_bps(U256::from(75u64)), "0.75%");
        assert_eq!(format_bps(U256::from(250u64)), "2.5%");
        assert_eq!(format_bps(U256::from(100u64)), "1%");
    }
}
