//! Domain layer: data model, error taxonomy, and ports for the task-execution engine.

pub mod error;
pub mod models;
pub mod ports;

pub use error::EngineError;
