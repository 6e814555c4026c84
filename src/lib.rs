//! Iterative price-adjustment equilibrium engine for power markets.
//!
//! A [`sim::Market`] broadcasts a per-slot price to every agent in a
//! [`devices::DeviceSet`], collects their preferred flows in parallel, and
//! moves prices against the resulting excess demand until it is within
//! tolerance or the round budget runs out.

/// Scenario files and presets.
pub mod config;
pub mod devices;
pub mod error;
/// Checkpoint records and CSV export.
pub mod io;
/// Market engine, round scheduler, parameters and listeners.
pub mod sim;

#[cfg(feature = "api")]
pub mod api;
