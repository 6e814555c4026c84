use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::devices::quadratic::QuadraticDevice;
use crate::devices::types::{Agent, SolveError, SolverOptions, dot};
use crate::error::ConfigError;

/// An agent owning one flow row per [`QuadraticDevice`].
///
/// Device problems are independent, so the agent's optimum is the stack of
/// per-device optima.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceAgent {
    id: String,
    devices: Vec<QuadraticDevice>,
}

impl DeviceAgent {
    /// Checkpoint type tag.
    pub const TYPE_TAG: &'static str = "power_market_sim::devices::DeviceAgent";

    /// Creates an agent from its devices.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `devices` is empty, a device is malformed,
    /// or devices disagree on the number of time slots.
    pub fn new(id: impl Into<String>, devices: Vec<QuadraticDevice>) -> Result<Self, ConfigError> {
        let id = id.into();
        let field = format!("agents.{id}.devices");
        let Some(first) = devices.first() else {
            return Err(ConfigError::new(field, "agent must own at least one device"));
        };
        let t = first.time_slots();
        for d in &devices {
            d.check().map_err(|m| ConfigError::new(&field, m))?;
            if d.time_slots() != t {
                return Err(ConfigError::new(
                    &field,
                    format!(
                        "device {} has {} time slots, expected {t}",
                        d.id,
                        d.time_slots()
                    ),
                ));
            }
        }
        Ok(Self { id, devices })
    }

    /// Creates a single-device agent named after the device.
    ///
    /// # Errors
    ///
    /// Same as [`DeviceAgent::new`].
    pub fn single(device: QuadraticDevice) -> Result<Self, ConfigError> {
        let id = device.id.clone();
        Self::new(id, vec![device])
    }

    /// Owned devices, in row order.
    pub fn devices(&self) -> &[QuadraticDevice] {
        &self.devices
    }

    /// Rebuilds an agent from its checkpointed configuration.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if `value` is not a valid configuration.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        let agent: Self = serde_json::from_value(value)?;
        Self::new(agent.id, agent.devices).map_err(serde::de::Error::custom)
    }

    fn solve_rows<F>(&self, prior: &[f64], mut solve: F) -> Result<Vec<f64>, SolveError>
    where
        F: FnMut(&QuadraticDevice, &[f64]) -> Result<Vec<f64>, SolveError>,
    {
        let t = self.time_slots();
        let expected = self.rows() * t;
        if prior.len() != expected {
            return Err(SolveError::ShapeMismatch {
                agent: self.id.clone(),
                expected,
                actual: prior.len(),
            });
        }
        let mut out = Vec::with_capacity(expected);
        for (device, row) in self.devices.iter().zip(prior.chunks(t)) {
            out.extend(solve(device, row)?);
        }
        Ok(out)
    }
}

impl Agent for DeviceAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn rows(&self) -> usize {
        self.devices.len()
    }

    fn time_slots(&self) -> usize {
        self.devices.first().map_or(0, QuadraticDevice::time_slots)
    }

    fn row_ids(&self) -> Vec<String> {
        if matches!(self.devices.as_slice(), [only] if only.id == self.id) {
            return vec![self.id.clone()];
        }
        self.devices
            .iter()
            .map(|d| format!("{}.{}", self.id, d.id))
            .collect()
    }

    fn solve(
        &self,
        price: &[f64],
        prior: &[f64],
        prox: Option<f64>,
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        self.solve_rows(prior, |device, row| {
            device.solve_row(price, row, prox, options)
        })
    }

    fn step(
        &self,
        price: &[f64],
        prior: &[f64],
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        self.solve_rows(prior, |device, row| device.step_row(price, row, options))
    }

    fn utility(&self, flow: &[f64], price: &[f64]) -> f64 {
        let t = self.time_slots();
        if t == 0 {
            return 0.0;
        }
        self.devices
            .iter()
            .zip(flow.chunks(t))
            .map(|(device, row)| device.intrinsic_utility(row) - dot(price, row))
            .sum()
    }

    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
