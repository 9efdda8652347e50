pub mod early_fail;

pub use early_fail::{CustomRule, EarlyFailValidator, Verdict};
