pub mod circuit;
pub mod engine;
pub mod limits;

pub use circuit::ApiHealth;
pub use engine::{RiskCheckResult, RiskEngine};
pub use limits::{TradeLimits, TradeOutcome};
