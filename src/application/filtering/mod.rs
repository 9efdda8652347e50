pub mod engine;
pub mod gates;
pub mod prepared_data;

pub use engine::{Evaluation, EvaluationGrid, FilterEngine, build_grid};
pub use prepared_data::{DataView, PreparedData};
