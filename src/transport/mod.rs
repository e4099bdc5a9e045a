pub mod event_bus;
pub mod events;

pub use event_bus::EventBus;
pub use events::EngineEvent;
