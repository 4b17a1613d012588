pub mod collector;
pub mod engine;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod model;
pub mod processor;
pub mod scheduler;
pub mod shutdown;
#[cfg(test)]
pub mod testing;
pub mod traits;

pub use engine::ReconcileEngine;
