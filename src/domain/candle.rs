use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One OHLCV bar. Timestamp is the UTC open time of the bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Bar range as a fraction of the open, a cheap spread proxy.
    pub fn range_pct(&self) -> f64 {
        if self.open > 0.0 {
            (self.high - self.low) / self.open
        } else {
            0.0
        }
    }

    /// Quote-denominated turnover of the bar.
    pub fn turnover(&self) -> f64 {
        self.volume * self.close
    }

    /// Physical sanity: positive prices, low <= high, non-negative volume.
    pub fn is_well_formed(&self) -> bool {
        self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.low <= self.high
            && self.volume >= 0.0
    }
}

/// Validated uppercase ticker, at most 12 ASCII characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub const MAX_LEN: usize = 12;

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("Symbol must not be empty");
        }
        if trimmed.len() > Self::MAX_LEN {
            bail!(
                "Symbol '{}' exceeds {} characters",
                trimmed,
                Self::MAX_LEN
            );
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric())
        {
            bail!("Symbol '{}' contains non-alphanumeric characters", trimmed);
        }
        Ok(Symbol(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Symbol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Symbol::parse(s)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(1_704_067_200, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn test_well_formed() {
        assert!(candle(100.0, 101.0, 99.0, 100.5, 10.0).is_well_formed());
        assert!(!candle(100.0, 99.0, 101.0, 100.5, 10.0).is_well_formed()); // low > high
        assert!(!candle(0.0, 101.0, 99.0, 100.5, 10.0).is_well_formed());
        assert!(!candle(100.0, 101.0, 99.0, 100.5, -1.0).is_well_formed());
    }

    #[test]
    fn test_range_pct() {
        let c = candle(100.0, 102.0, 98.0, 100.0, 5.0);
        assert!((c.range_pct() - 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_symbol_parse() {
        assert_eq!(Symbol::parse("btc").unwrap().as_str(), "BTC");
        assert_eq!(Symbol::parse(" sol ").unwrap().as_str(), "SOL");
        assert!(Symbol::parse("").is_err());
        assert!(Symbol::parse("WAYTOOLONGSYMBOL").is_err());
        assert!(Symbol::parse("BTC/USDT").is_err());
    }
}
