//! Market agents: the solve contract and the closed-form reference agents.

/// Multi-row agent built from quadratic devices.
pub mod device_agent;
/// Ordered agent collection with row-range bookkeeping.
pub mod device_set;
/// Price-inelastic load.
pub mod profile;
/// Single-row quadratic-cost device.
pub mod quadratic;
pub mod types;

pub use device_agent::DeviceAgent;
pub use device_set::DeviceSet;
pub use profile::ProfileLoad;
pub use quadratic::QuadraticDevice;
pub use types::{Agent, SolveError, SolverOptions};
