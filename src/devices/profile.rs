use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::devices::types::{Agent, SolveError, SolverOptions, dot, ensure_finite};
use crate::error::ConfigError;

/// Inflexible load that consumes a fixed profile regardless of price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileLoad {
    id: String,
    profile_kw: Vec<f64>,
}

impl ProfileLoad {
    /// Checkpoint type tag.
    pub const TYPE_TAG: &'static str = "power_market_sim::devices::ProfileLoad";

    /// Creates a load consuming `profile_kw[t]` in slot `t`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the profile is empty or has negative or
    /// non-finite entries.
    pub fn new(id: impl Into<String>, profile_kw: Vec<f64>) -> Result<Self, ConfigError> {
        let id = id.into();
        if profile_kw.is_empty() {
            return Err(ConfigError::new(
                format!("agents.{id}.profile_kw"),
                "must not be empty",
            ));
        }
        if profile_kw.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigError::new(
                format!("agents.{id}.profile_kw"),
                "entries must be finite and >= 0",
            ));
        }
        Ok(Self { id, profile_kw })
    }

    /// Consumption per slot.
    pub fn profile_kw(&self) -> &[f64] {
        &self.profile_kw
    }

    /// Rebuilds a load from its checkpointed configuration.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if `value` is not a valid configuration.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        let load: Self = serde_json::from_value(value)?;
        Self::new(load.id, load.profile_kw).map_err(serde::de::Error::custom)
    }

    fn fixed(&self, price: &[f64]) -> Result<Vec<f64>, SolveError> {
        ensure_finite(&self.id, price)?;
        Ok(self.profile_kw.clone())
    }
}

impl Agent for ProfileLoad {
    fn id(&self) -> &str {
        &self.id
    }

    fn rows(&self) -> usize {
        1
    }

    fn time_slots(&self) -> usize {
        self.profile_kw.len()
    }

    fn solve(
        &self,
        price: &[f64],
        _prior: &[f64],
        _prox: Option<f64>,
        _options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        self.fixed(price)
    }

    fn step(
        &self,
        price: &[f64],
        _prior: &[f64],
        _options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        self.fixed(price)
    }

    // Fixed loads carry no intrinsic preference, only the energy bill.
    fn utility(&self, flow: &[f64], price: &[f64]) -> f64 {
        -dot(price, flow)
    }

    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
