// Market data primitives
pub mod candle;

// Timeframes and their evaluation semantics
pub mod timeframe;

// Strategy catalog types
pub mod strategy;

// Execution ledger types
pub mod execution;

// Per-(execution, strategy, timeframe) work units
pub mod task;

// Evaluation outcomes, stages, and statistics
pub mod outcome;

// Support/resistance level types
pub mod levels;

// Domain-specific error taxonomy
pub mod errors;
