//! TOML-based scenario configuration and preset definitions.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::devices::{Agent, DeviceAgent, DeviceSet, ProfileLoad, QuadraticDevice, SolverOptions};
pub use crate::error::ConfigError;
use crate::error::MarketError;
use crate::sim::engine::Market;
use crate::sim::param::{Param, RawParam};
use crate::sim::types::{AgentStrategy, FailurePolicy, MarketParams, PriceRule};

/// Top-level scenario configuration parsed from TOML.
///
/// Sections other than `[[agents]]` have defaults. Load from TOML with
/// [`ScenarioConfig::from_toml_file`] or start from a preset with
/// [`ScenarioConfig::from_preset`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Market and round-loop parameters.
    #[serde(default)]
    pub market: MarketConfig,
    /// Options passed to every agent solve.
    #[serde(default)]
    pub solver: SolverConfig,
    /// Market participants, in row order.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Free-form metadata, written next to checkpoints as `meta.json`.
    #[serde(default)]
    pub meta: toml::Table,
}

/// Market and round-loop parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketConfig {
    /// Time slots per flow row (must be > 0).
    pub time_slots: usize,
    /// Stability tolerance on per-slot excess demand (must be > 0).
    pub tol: f64,
    /// Round budget (must be > 0).
    pub maxsteps: usize,
    /// Price step size: a number or an expression of `steps`.
    pub stepsize: RawParam,
    /// Proximal penalty: a number or an expression of `steps`. Unset disables it.
    pub prox: Option<RawParam>,
    /// `"point_bid"` or `"limited_minimization"`.
    pub agent_strategy: String,
    /// `"fallback"`, `"retry"` or `"abort"`.
    pub failure_policy: String,
    /// `"linear"`, `"normalized"` or `"asynchronous"`.
    pub price_rule: String,
    /// Seed for the asynchronous price rule.
    pub seed: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            time_slots: 24,
            tol: 1e-3,
            maxsteps: 100,
            stepsize: RawParam::Number(1e-3),
            prox: None,
            agent_strategy: "point_bid".to_string(),
            failure_policy: "fallback".to_string(),
            price_rule: "linear".to_string(),
            seed: 42,
        }
    }
}

/// Agent solver options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    /// Residual tolerance for iterative solves (must be > 0).
    pub ftol: f64,
    /// Iteration cap for iterative solves (must be > 0).
    pub maxiter: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        let options = SolverOptions::default();
        Self {
            ftol: options.ftol,
            maxiter: options.maxiter,
        }
    }
}

/// Per-slot values given either as one number for every slot or as a list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SlotValues {
    Uniform(f64),
    PerSlot(Vec<f64>),
}

impl SlotValues {
    fn expand(&self, field: &str, time_slots: usize) -> Result<Vec<f64>, ConfigError> {
        match self {
            Self::Uniform(v) => Ok(vec![*v; time_slots]),
            Self::PerSlot(values) if values.len() == time_slots => Ok(values.clone()),
            Self::PerSlot(values) => Err(ConfigError::new(
                field,
                format!(
                    "has {} entries, expected market.time_slots = {time_slots}",
                    values.len()
                ),
            )),
        }
    }
}

/// One market participant, selected by `kind`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentConfig {
    /// Generator with quadratic production cost `cost / 2 * q^2`.
    Supplier {
        id: String,
        cost: f64,
        /// Maximum production per slot (kW), unbounded if unset.
        #[serde(default)]
        capacity_kw: Option<f64>,
    },
    /// Fixed consumption profile, one value per slot.
    Load { id: String, profile_kw: Vec<f64> },
    /// Price-responsive load.
    Elastic {
        id: String,
        curvature: f64,
        value: SlotValues,
        max_kw: f64,
    },
    /// Energy-neutral storage.
    Storage {
        id: String,
        rate_kw: f64,
        wear_cost: f64,
    },
    /// Agent owning explicit quadratic devices, one row each.
    Devices {
        id: String,
        devices: Vec<QuadraticDevice>,
    },
}

impl AgentConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::Supplier { id, .. }
            | Self::Load { id, .. }
            | Self::Elastic { id, .. }
            | Self::Storage { id, .. }
            | Self::Devices { id, .. } => id,
        }
    }

    /// Builds the configured agent.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a parameter is out of range or a per-slot
    /// list does not have `time_slots` entries.
    pub fn build(&self, time_slots: usize) -> Result<Box<dyn Agent>, ConfigError> {
        let field = |name: &str| format!("agents.{}.{name}", self.id());
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::new(field(name), "must be finite and > 0"))
            }
        };

        let agent: Box<dyn Agent> = match self {
            Self::Supplier {
                id,
                cost,
                capacity_kw,
            } => {
                positive("cost", *cost)?;
                let mut device = QuadraticDevice::supplier(id.clone(), *cost, time_slots);
                if let Some(capacity) = capacity_kw {
                    positive("capacity_kw", *capacity)?;
                    device = device.with_bounds(Some(-capacity), Some(0.0));
                }
                Box::new(DeviceAgent::single(device)?)
            }
            Self::Load { id, profile_kw } => {
                let profile = SlotValues::PerSlot(profile_kw.clone());
                Box::new(ProfileLoad::new(
                    id.clone(),
                    profile.expand(&field("profile_kw"), time_slots)?,
                )?)
            }
            Self::Elastic {
                id,
                curvature,
                value,
                max_kw,
            } => {
                positive("curvature", *curvature)?;
                positive("max_kw", *max_kw)?;
                let value = value.expand(&field("value"), time_slots)?;
                Box::new(DeviceAgent::single(QuadraticDevice::elastic_load(
                    id.clone(),
                    *curvature,
                    &value,
                    *max_kw,
                ))?)
            }
            Self::Storage {
                id,
                rate_kw,
                wear_cost,
            } => {
                positive("rate_kw", *rate_kw)?;
                positive("wear_cost", *wear_cost)?;
                Box::new(DeviceAgent::single(QuadraticDevice::storage(
                    id.clone(),
                    *wear_cost,
                    *rate_kw,
                    time_slots,
                ))?)
            }
            Self::Devices { id, devices } => {
                if let Some(d) = devices.iter().find(|d| d.time_slots() != time_slots) {
                    return Err(ConfigError::new(
                        field("devices"),
                        format!(
                            "device {} has {} time slots, expected market.time_slots = {time_slots}",
                            d.id,
                            d.time_slots()
                        ),
                    ));
                }
                Box::new(DeviceAgent::new(id.clone(), devices.clone())?)
            }
        };
        Ok(agent)
    }
}

impl ScenarioConfig {
    /// Two-agent market: a quadratic-cost supplier and a fixed four-slot load.
    ///
    /// With the default step size the excess halves every round, so the
    /// market clears to 1e-3 in 13 rounds.
    pub fn supply_and_load() -> Self {
        Self {
            market: MarketConfig {
                time_slots: 4,
                tol: 1e-3,
                maxsteps: 50,
                stepsize: RawParam::Number(1e-3),
                ..MarketConfig::default()
            },
            solver: SolverConfig::default(),
            agents: vec![
                AgentConfig::Supplier {
                    id: "supplier".to_string(),
                    cost: 2e-3,
                    capacity_kw: None,
                },
                AgentConfig::Load {
                    id: "load".to_string(),
                    profile_kw: vec![1.0, 2.0, 3.0, 4.0],
                },
            ],
            meta: toml::Table::new(),
        }
    }

    /// Day-ahead neighbourhood: a supplier, a shared battery, a street-level
    /// base load and three homes that value evening consumption most.
    pub fn neighbourhood() -> Self {
        let time_slots = 24;
        let home = |id: &str, base: f64, evening: f64| AgentConfig::Elastic {
            id: id.to_string(),
            curvature: 0.1,
            value: SlotValues::PerSlot(
                (0..time_slots)
                    .map(|h| if (17..22).contains(&h) { evening } else { base })
                    .collect(),
            ),
            max_kw: 5.0,
        };
        Self {
            market: MarketConfig {
                time_slots,
                tol: 1e-3,
                maxsteps: 200,
                stepsize: RawParam::Number(0.01),
                ..MarketConfig::default()
            },
            solver: SolverConfig::default(),
            agents: vec![
                AgentConfig::Supplier {
                    id: "grid".to_string(),
                    cost: 0.02,
                    capacity_kw: None,
                },
                AgentConfig::Storage {
                    id: "battery".to_string(),
                    rate_kw: 4.0,
                    wear_cost: 0.05,
                },
                AgentConfig::Load {
                    id: "street".to_string(),
                    profile_kw: vec![1.0; time_slots],
                },
                home("home_a", 0.25, 0.45),
                home("home_b", 0.20, 0.40),
                home("home_c", 0.30, 0.50),
            ],
            meta: toml::Table::new(),
        }
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["supply_and_load", "neighbourhood"];

    /// Loads a scenario from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "supply_and_load" => Ok(Self::supply_and_load()),
            "neighbourhood" => Ok(Self::neighbourhood()),
            _ => Err(ConfigError::new(
                "preset",
                format!(
                    "unknown preset \"{name}\", available: {}",
                    Self::PRESETS.join(", ")
                ),
            )),
        }
    }

    /// Parses a scenario from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new("scenario", format!("cannot read \"{}\": {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a scenario from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::new("toml", e.to_string()))
    }

    fn param(field: &str, raw: &RawParam) -> Result<Param, ConfigError> {
        Param::try_from(raw.clone()).map_err(|e| ConfigError::new(field, e.to_string()))
    }

    /// Builds the engine parameters.
    ///
    /// # Errors
    ///
    /// Returns the first unparsable name or expression. Range checks are left
    /// to [`ScenarioConfig::validate`].
    pub fn market_params(&self) -> Result<MarketParams, ConfigError> {
        let m = &self.market;
        Ok(MarketParams {
            tol: m.tol,
            maxsteps: m.maxsteps,
            stepsize: Self::param("market.stepsize", &m.stepsize)?,
            prox: m
                .prox
                .as_ref()
                .map(|raw| Self::param("market.prox", raw))
                .transpose()?,
            agent_strategy: m.agent_strategy.parse()?,
            failure_policy: m.failure_policy.parse()?,
            price_rule: m.price_rule.parse()?,
            seed: m.seed,
            solver: SolverOptions {
                ftol: self.solver.ftol,
                maxiter: self.solver.maxiter,
            },
        })
    }

    /// Builds the device set.
    ///
    /// # Errors
    ///
    /// Returns the first agent that fails to build, or a device set error.
    pub fn build_deviceset(&self) -> Result<DeviceSet, ConfigError> {
        let agents = self
            .agents
            .iter()
            .map(|a| a.build(self.market.time_slots))
            .collect::<Result<Vec<_>, _>>()?;
        DeviceSet::new(agents)
    }

    /// Validates and builds a ready-to-run market.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::Config`] with the first validation error.
    pub fn build_market(&self) -> Result<Market, MarketError> {
        if let Some(e) = self.validate().into_iter().next() {
            return Err(e.into());
        }
        Market::new(self.build_deviceset()?, self.market_params()?)
    }

    /// The `[meta]` table as JSON.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a TOML value has no JSON form.
    pub fn meta_json(&self) -> Result<Value, ConfigError> {
        serde_json::to_value(&self.meta).map_err(|e| ConfigError::new("meta", e.to_string()))
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let m = &self.market;

        if m.time_slots == 0 {
            errors.push(ConfigError::new("market.time_slots", "must be > 0"));
        }
        if let Err(e) = Self::param("market.stepsize", &m.stepsize) {
            errors.push(e);
        }
        if let Some(Err(e)) = m.prox.as_ref().map(|raw| Self::param("market.prox", raw)) {
            errors.push(e);
        }
        for result in [
            m.agent_strategy.parse::<AgentStrategy>().err(),
            m.failure_policy.parse::<FailurePolicy>().err(),
            m.price_rule.parse::<PriceRule>().err(),
        ] {
            errors.extend(result);
        }
        let ranges = MarketParams {
            tol: m.tol,
            maxsteps: m.maxsteps,
            prox: m.prox.as_ref().and_then(|raw| Self::param("market.prox", raw).ok()),
            solver: SolverOptions {
                ftol: self.solver.ftol,
                maxiter: self.solver.maxiter,
            },
            ..MarketParams::default()
        };
        errors.extend(ranges.validate());

        if self.agents.is_empty() {
            errors.push(ConfigError::new("agents", "at least one agent is required"));
        }
        if m.time_slots > 0 {
            let mut built = Vec::new();
            for agent in &self.agents {
                match agent.build(m.time_slots) {
                    Ok(a) => built.push(a),
                    Err(e) => errors.push(e),
                }
            }
            if built.len() == self.agents.len() && !built.is_empty() {
                if let Err(e) = DeviceSet::new(built) {
                    errors.push(e);
                }
            }
        }

        errors
    }
}
