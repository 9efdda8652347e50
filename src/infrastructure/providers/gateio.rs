//! Gate.io USDT-perpetual market-data provider.
//!
//! Uses the public REST v4 endpoints. Contracts are addressed as
//! `<TICKER>_USDT`; the suffix is this provider's aliasing concern and is
//! stripped before anything reaches the caller.

use super::{MarketDataProvider, MarketInfo};
use crate::domain::candle::{Candle, Symbol};
use crate::domain::timeframe::Timeframe;
use crate::infrastructure::core::http_client_factory::{
    HttpClientFactory, build_url_with_query,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.gateio.ws/api/v4";

pub struct GateIoProvider {
    client: ClientWithMiddleware,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct Contract {
    name: String,
    #[serde(default)]
    in_delisting: bool,
    #[serde(default)]
    order_size_min: Option<f64>,
    #[serde(default)]
    leverage_max: Option<String>,
    #[serde(default)]
    trade_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    #[serde(default)]
    last: Option<String>,
    #[serde(default)]
    volume_24h_settle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandleRow {
    /// Open time in epoch seconds.
    t: i64,
    v: f64,
    o: String,
    h: String,
    l: String,
    c: String,
}

impl GateIoProvider {
    pub fn new(base_url: String) -> Self {
        Self {
            client: HttpClientFactory::create_client(),
            base_url,
        }
    }

    fn contract_name(symbol: &Symbol) -> String {
        format!("{}_USDT", symbol.as_str())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Gate.io request failed: {}", url))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow!("Gate.io: not found: {}", url));
        }
        if !response.status().is_success() {
            return Err(anyhow!("Gate.io returned {} for {}", response.status(), url));
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to decode Gate.io response: {}", url))
    }
}

#[async_trait]
impl MarketDataProvider for GateIoProvider {
    fn name(&self) -> &'static str {
        "gateio"
    }

    async fn get_market_info(&self, symbol: &Symbol) -> Result<MarketInfo> {
        let contract = Self::contract_name(symbol);
        let url = format!("{}/futures/usdt/contracts/{}", self.base_url, contract);
        let info: Contract = self.get_json(&url).await?;

        let ticker_url = build_url_with_query(
            &format!("{}/futures/usdt/tickers", self.base_url),
            &[("contract", contract.as_str())],
        );
        let tickers: Vec<Ticker> = self.get_json(&ticker_url).await?;
        let volume_24h = tickers
            .first()
            .and_then(|t| t.volume_24h_settle.as_deref())
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(MarketInfo {
            native_symbol: info.name,
            is_active: !info.in_delisting && info.trade_size.unwrap_or(1) != 0,
            volume_24h,
            min_order_size: info.order_size_min.unwrap_or(1.0),
            max_leverage: info
                .leverage_max
                .as_deref()
                .and_then(|raw| raw.parse::<f64>().ok()),
        })
    }

    async fn get_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let contract = Self::contract_name(symbol);
        let from = start.timestamp().to_string();
        let to = end.timestamp().to_string();
        let url = build_url_with_query(
            &format!("{}/futures/usdt/candlesticks", self.base_url),
            &[
                ("contract", contract.as_str()),
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("interval", timeframe.to_gateio_interval()),
            ],
        );
        let rows: Vec<CandleRow> = self.get_json(&url).await?;
        debug!(
            "Gate.io returned {} {} candles for {}",
            rows.len(),
            timeframe,
            symbol
        );

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp = Utc
                .timestamp_opt(row.t, 0)
                .single()
                .ok_or_else(|| anyhow!("Invalid candle timestamp {}", row.t))?;
            candles.push(Candle {
                timestamp,
                open: row.o.parse().context("bad open")?,
                high: row.h.parse().context("bad high")?,
                low: row.l.parse().context("bad low")?,
                close: row.c.parse().context("bad close")?,
                volume: row.v,
            });
        }
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn get_current_price(&self, symbol: &Symbol) -> Result<f64> {
        let contract = Self::contract_name(symbol);
        let url = build_url_with_query(
            &format!("{}/futures/usdt/tickers", self.base_url),
            &[("contract", contract.as_str())],
        );
        let tickers: Vec<Ticker> = self.get_json(&url).await?;
        tickers
            .first()
            .and_then(|t| t.last.as_deref())
            .ok_or_else(|| anyhow!("No ticker for {}", contract))?
            .parse::<f64>()
            .context("Failed to parse last price")
    }
}
