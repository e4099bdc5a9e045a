// Core modules
pub mod config;
pub mod core;
pub mod exchange;

// Engine modules
pub mod engine;
pub mod execution;
pub mod position;
pub mod risk;
pub mod signals;
pub mod sync;
pub mod transport;

// Re-export commonly used types for convenience
pub use self::core::*;
pub use engine::TradingEngine;
