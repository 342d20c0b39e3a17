pub mod state;
pub mod tracker;

pub use state::{BudgetLevel, BudgetState, BudgetThresholds};
pub use tracker::CostTracker;
