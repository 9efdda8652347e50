//! Hyperliquid market-data provider.
//!
//! All queries go through the single `POST /info` endpoint with a typed JSON
//! body. Micro-contracts are listed k-prefixed (e.g. "kPEPE" for PEPE); the
//! alias is resolved here and round-trips back to the user's ticker.

use super::{MarketDataProvider, MarketInfo};
use crate::domain::candle::{Candle, Symbol};
use crate::domain::timeframe::Timeframe;
use crate::infrastructure::core::http_client_factory::HttpClientFactory;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.hyperliquid.xyz";

pub struct HyperliquidProvider {
    client: ClientWithMiddleware,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct Meta {
    universe: Vec<AssetMeta>,
}

#[derive(Debug, Deserialize)]
struct AssetMeta {
    name: String,
    #[serde(default, rename = "maxLeverage")]
    max_leverage: Option<f64>,
    #[serde(default, rename = "szDecimals")]
    sz_decimals: Option<u32>,
    #[serde(default, rename = "isDelisted")]
    is_delisted: bool,
}

#[derive(Debug, Deserialize)]
struct AssetCtx {
    #[serde(default, rename = "dayNtlVlm")]
    day_ntl_vlm: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandleRow {
    /// Open time in epoch milliseconds.
    t: i64,
    o: String,
    h: String,
    l: String,
    c: String,
    v: String,
}

impl HyperliquidProvider {
    pub fn new(base_url: String) -> Self {
        Self {
            client: HttpClientFactory::create_client(),
            base_url,
        }
    }

    async fn info<T: serde::de::DeserializeOwned>(&self, body: serde_json::Value) -> Result<T> {
        let url = format!("{}/info", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Hyperliquid /info request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Hyperliquid /info returned {} for {}",
                response.status(),
                body["type"]
            ));
        }
        response
            .json::<T>()
            .await
            .context("Failed to decode Hyperliquid /info response")
    }

    /// Resolves a user ticker to the listed coin name, honoring the k-prefix
    /// alias for micro-contracts. Returns the native name.
    async fn resolve_coin(&self, symbol: &Symbol) -> Result<Option<(String, AssetMeta)>> {
        let meta: Meta = self.info(json!({ "type": "meta" })).await?;
        let wanted = symbol.as_str();
        let aliased = format!("k{}", wanted);
        for asset in meta.universe {
            if asset.name.eq_ignore_ascii_case(wanted) || asset.name == aliased {
                let native = asset.name.clone();
                return Ok(Some((native, asset)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl MarketDataProvider for HyperliquidProvider {
    fn name(&self) -> &'static str {
        "hyperliquid"
    }

    async fn get_market_info(&self, symbol: &Symbol) -> Result<MarketInfo> {
        let (native, asset) = self
            .resolve_coin(symbol)
            .await?
            .ok_or_else(|| anyhow!("Symbol {} not listed on Hyperliquid", symbol))?;

        // metaAndAssetCtxs returns [meta, [ctx; one per universe entry]].
        let combined: (Meta, Vec<AssetCtx>) =
            self.info(json!({ "type": "metaAndAssetCtxs" })).await?;
        let (meta, ctxs) = combined;
        let volume_24h = meta
            .universe
            .iter()
            .position(|a| a.name == native)
            .and_then(|i| ctxs.get(i))
            .and_then(|ctx| ctx.day_ntl_vlm.as_deref())
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0);

        let min_order_size = asset
            .sz_decimals
            .map(|d| 10f64.powi(-(d as i32)))
            .unwrap_or(0.0);

        Ok(MarketInfo {
            native_symbol: native,
            is_active: !asset.is_delisted,
            volume_24h,
            min_order_size,
            max_leverage: asset.max_leverage,
        })
    }

    async fn get_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let (native, _) = self
            .resolve_coin(symbol)
            .await?
            .ok_or_else(|| anyhow!("Symbol {} not listed on Hyperliquid", symbol))?;

        let rows: Vec<CandleRow> = self
            .info(json!({
                "type": "candleSnapshot",
                "req": {
                    "coin": native,
                    "interval": timeframe.to_hyperliquid_interval(),
                    "startTime": start.timestamp_millis(),
                    "endTime": end.timestamp_millis(),
                }
            }))
            .await?;

        debug!(
            "Hyperliquid returned {} {} candles for {}",
            rows.len(),
            timeframe,
            symbol
        );

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp = Utc
                .timestamp_millis_opt(row.t)
                .single()
                .ok_or_else(|| anyhow!("Invalid candle timestamp {}", row.t))?;
            candles.push(Candle {
                timestamp,
                open: row.o.parse().context("bad open")?,
                high: row.h.parse().context("bad high")?,
                low: row.l.parse().context("bad low")?,
                close: row.c.parse().context("bad close")?,
                volume: row.v.parse().context("bad volume")?,
            });
        }
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn get_current_price(&self, symbol: &Symbol) -> Result<f64> {
        let (native, _) = self
            .resolve_coin(symbol)
            .await?
            .ok_or_else(|| anyhow!("Symbol {} not listed on Hyperliquid", symbol))?;

        let mids: std::collections::HashMap<String, String> =
            self.info(json!({ "type": "allMids" })).await?;
        mids.get(&native)
            .ok_or_else(|| anyhow!("No mid price for {}", native))?
            .parse::<f64>()
            .context("Failed to parse mid price")
    }
}
