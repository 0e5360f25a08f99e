//! Generation loop engine

mod engine;

pub use engine::{GenerationEngine, StopHandle, CALLBACK_INTERVAL};
