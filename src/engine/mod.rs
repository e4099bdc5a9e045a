/// Control Loop
pub mod controller;

pub use controller::TradingEngine;
