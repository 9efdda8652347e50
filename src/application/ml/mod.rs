pub mod features;
pub mod predictor;

pub use predictor::{RangePrediction, RangePredictor};
