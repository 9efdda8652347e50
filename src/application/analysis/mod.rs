pub mod btc_correlation;
pub mod market_context;
pub mod support_resistance;
pub mod volatility;
