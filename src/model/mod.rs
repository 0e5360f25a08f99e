//! Model configuration and weight loading

mod config;
mod loader;

pub use config::ModelConfig;
pub use loader::ModelBundle;
