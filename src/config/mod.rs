pub mod settings;

pub use settings::{Config, Execution, RiskLimits, Sync, Trading};
