//! Pluggable market-data providers.
//!
//! Two exchange identities are recognized, `hyperliquid` and `gateio`, plus a
//! deterministic mock for tests and dry runs. Switching providers is an
//! explicit user action (the `DATA_PROVIDER` variable); it never happens
//! implicitly or on error. Symbol aliasing (e.g. k-prefixed micro-contracts)
//! is each provider's responsibility and must round-trip.

pub mod gateio;
pub mod hyperliquid;
pub mod mock;

use crate::config::AnalysisMode;
use crate::domain::candle::{Candle, Symbol};
use crate::domain::timeframe::Timeframe;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;

/// Exchange-reported instrument metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketInfo {
    /// Provider-native identifier, e.g. "kPEPE" or "BTC_USDT".
    pub native_symbol: String,
    pub is_active: bool,
    pub volume_24h: f64,
    pub min_order_size: f64,
    pub max_leverage: Option<f64>,
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Provider identity as configured ("hyperliquid", "gateio", "mock").
    fn name(&self) -> &'static str;

    async fn get_market_info(&self, symbol: &Symbol) -> Result<MarketInfo>;

    /// Ordered ascending UTC series. Gaps are missing rows, never zero rows.
    async fn get_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    /// Real-time mode only. Backtest callers go through `ModeGuardedProvider`
    /// which rejects this call outright.
    async fn get_current_price(&self, symbol: &Symbol) -> Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Hyperliquid,
    GateIo,
    Mock,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hyperliquid" => Ok(ProviderKind::Hyperliquid),
            "gateio" => Ok(ProviderKind::GateIo),
            "mock" => Ok(ProviderKind::Mock),
            _ => Err(anyhow!(
                "Invalid DATA_PROVIDER: '{}'. Must be 'hyperliquid', 'gateio', or 'mock'",
                s
            )),
        }
    }
}

pub fn create_provider(kind: ProviderKind) -> Arc<dyn MarketDataProvider> {
    match kind {
        ProviderKind::Hyperliquid => {
            Arc::new(hyperliquid::HyperliquidProvider::new(
                hyperliquid::DEFAULT_BASE_URL.to_string(),
            ))
        }
        ProviderKind::GateIo => Arc::new(gateio::GateIoProvider::new(
            gateio::DEFAULT_BASE_URL.to_string(),
        )),
        ProviderKind::Mock => Arc::new(mock::MockProvider::default()),
    }
}

/// Enforces the backtest/realtime contract at the provider seam: in backtest
/// mode a `get_current_price` call is a programming error, not a data path.
pub struct ModeGuardedProvider {
    inner: Arc<dyn MarketDataProvider>,
    mode: AnalysisMode,
}

impl ModeGuardedProvider {
    pub fn new(inner: Arc<dyn MarketDataProvider>, mode: AnalysisMode) -> Self {
        Self { inner, mode }
    }
}

#[async_trait]
impl MarketDataProvider for ModeGuardedProvider {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get_market_info(&self, symbol: &Symbol) -> Result<MarketInfo> {
        self.inner.get_market_info(symbol).await
    }

    async fn get_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.inner.get_ohlcv(symbol, timeframe, start, end).await
    }

    async fn get_current_price(&self, symbol: &Symbol) -> Result<f64> {
        if self.mode == AnalysisMode::Backtest {
            bail!(
                "get_current_price({}) called in backtest mode; evaluations must use the candle open at T",
                symbol
            );
        }
        self.inner.get_current_price(symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!(
            ProviderKind::from_str("hyperliquid").unwrap(),
            ProviderKind::Hyperliquid
        );
        assert_eq!(ProviderKind::from_str("GATEIO").unwrap(), ProviderKind::GateIo);
        assert!(ProviderKind::from_str("binance").is_err());
    }

    #[tokio::test]
    async fn test_backtest_mode_forbids_current_price() {
        let provider = ModeGuardedProvider::new(
            Arc::new(mock::MockProvider::default()),
            AnalysisMode::Backtest,
        );
        let symbol = Symbol::parse("BTC").unwrap();
        let err = provider.get_current_price(&symbol).await.unwrap_err();
        assert!(err.to_string().contains("backtest"));
    }

    #[tokio::test]
    async fn test_realtime_mode_allows_current_price() {
        let provider = ModeGuardedProvider::new(
            Arc::new(mock::MockProvider::default()),
            AnalysisMode::Realtime,
        );
        let symbol = Symbol::parse("BTC").unwrap();
        assert!(provider.get_current_price(&symbol).await.unwrap() > 0.0);
    }
}
