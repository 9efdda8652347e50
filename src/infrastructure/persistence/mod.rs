pub mod analysis_repository;
pub mod database;
pub mod ledger_repository;

pub use analysis_repository::AnalysisRepository;
pub use database::{has_tables, open_pool};
pub use ledger_repository::LedgerRepository;
