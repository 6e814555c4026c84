//! Equilibrium engine, round scheduling and lifecycle events.

pub mod engine;
pub mod kpi;
/// Lifecycle events and observers.
pub mod listener;
/// Step-dependent parameters.
pub mod param;
pub mod scheduler;
pub mod types;

pub use engine::Market;
pub use listener::{Event, Listener};
