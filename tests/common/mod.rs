//! Shared test fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use power_market_sim::devices::{
    Agent, DeviceAgent, DeviceSet, ProfileLoad, QuadraticDevice, SolveError, SolverOptions,
};
use power_market_sim::error::CheckpointError;
use power_market_sim::sim::Market;
use power_market_sim::sim::param::Param;
use power_market_sim::sim::types::MarketParams;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent returning a fixed row and recording every prox value it was given.
#[derive(Debug)]
pub struct RecordingAgent {
    pub id: String,
    pub row: Vec<f64>,
    pub seen_prox: Mutex<Vec<Option<f64>>>,
}

impl RecordingAgent {
    pub fn new(id: &str, row: Vec<f64>) -> Self {
        Self {
            id: id.to_string(),
            row,
            seen_prox: Mutex::new(Vec::new()),
        }
    }

    pub fn prox_history(&self) -> Vec<Option<f64>> {
        self.seen_prox.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl Agent for RecordingAgent {
    fn id(&self) -> &str {
        &self.id
    }
    fn rows(&self) -> usize {
        1
    }
    fn time_slots(&self) -> usize {
        self.row.len()
    }
    fn solve(
        &self,
        _price: &[f64],
        _prior: &[f64],
        prox: Option<f64>,
        _options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        if let Ok(mut seen) = self.seen_prox.lock() {
            seen.push(prox);
        }
        Ok(self.row.clone())
    }
    fn step(
        &self,
        price: &[f64],
        prior: &[f64],
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        self.solve(price, prior, None, options)
    }
    fn utility(&self, _flow: &[f64], _price: &[f64]) -> f64 {
        0.0
    }
    fn type_tag(&self) -> &'static str {
        "tests::RecordingAgent"
    }
    fn to_value(&self) -> serde_json::Result<Value> {
        Ok(Value::Null)
    }
}

/// Agent that sleeps before answering with a row filled with `marker`.
#[derive(Debug)]
pub struct DelayedAgent {
    pub id: String,
    pub delay: Duration,
    pub marker: f64,
    pub time_slots: usize,
}

impl DelayedAgent {
    pub fn new(id: &str, delay_ms: u64, marker: f64, time_slots: usize) -> Self {
        Self {
            id: id.to_string(),
            delay: Duration::from_millis(delay_ms),
            marker,
            time_slots,
        }
    }
}

impl Agent for DelayedAgent {
    fn id(&self) -> &str {
        &self.id
    }
    fn rows(&self) -> usize {
        1
    }
    fn time_slots(&self) -> usize {
        self.time_slots
    }
    fn solve(
        &self,
        _price: &[f64],
        _prior: &[f64],
        _prox: Option<f64>,
        _options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        thread::sleep(self.delay);
        Ok(vec![self.marker; self.time_slots])
    }
    fn step(
        &self,
        price: &[f64],
        prior: &[f64],
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        self.solve(price, prior, None, options)
    }
    fn utility(&self, _flow: &[f64], _price: &[f64]) -> f64 {
        0.0
    }
    fn type_tag(&self) -> &'static str {
        "tests::DelayedAgent"
    }
    fn to_value(&self) -> serde_json::Result<Value> {
        Ok(Value::Null)
    }
}

/// Agent that fails unless the solver tolerance is at least `min_ftol`.
///
/// With the default options (`ftol = 1e-6`) and `min_ftol = 1e-5` the first
/// attempt fails and the relaxed retry succeeds. `f64::INFINITY` always fails.
#[derive(Debug)]
pub struct FailingAgent {
    pub id: String,
    pub row: Vec<f64>,
    pub min_ftol: f64,
}

impl FailingAgent {
    pub fn recoverable(id: &str, row: Vec<f64>) -> Self {
        Self {
            id: id.to_string(),
            row,
            min_ftol: 1e-5,
        }
    }

    pub fn broken(id: &str, time_slots: usize) -> Self {
        Self {
            id: id.to_string(),
            row: vec![0.0; time_slots],
            min_ftol: f64::INFINITY,
        }
    }
}

impl Agent for FailingAgent {
    fn id(&self) -> &str {
        &self.id
    }
    fn rows(&self) -> usize {
        1
    }
    fn time_slots(&self) -> usize {
        self.row.len()
    }
    fn solve(
        &self,
        _price: &[f64],
        _prior: &[f64],
        _prox: Option<f64>,
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        if options.ftol < self.min_ftol {
            return Err(SolveError::NotConverged {
                agent: self.id.clone(),
                iterations: options.maxiter,
                residual: 1.0,
            });
        }
        Ok(self.row.clone())
    }
    fn step(
        &self,
        price: &[f64],
        prior: &[f64],
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        self.solve(price, prior, None, options)
    }
    fn utility(&self, _flow: &[f64], _price: &[f64]) -> f64 {
        0.0
    }
    fn type_tag(&self) -> &'static str {
        "tests::FailingAgent"
    }
    fn to_value(&self) -> serde_json::Result<Value> {
        Ok(Value::Null)
    }
}

/// Agent whose solve panics instead of returning an error.
#[derive(Debug)]
pub struct PanickingAgent {
    pub id: String,
    pub time_slots: usize,
}

impl PanickingAgent {
    pub fn new(id: &str, time_slots: usize) -> Self {
        Self {
            id: id.to_string(),
            time_slots,
        }
    }
}

impl Agent for PanickingAgent {
    fn id(&self) -> &str {
        &self.id
    }
    fn rows(&self) -> usize {
        1
    }
    fn time_slots(&self) -> usize {
        self.time_slots
    }
    fn solve(
        &self,
        _price: &[f64],
        _prior: &[f64],
        _prox: Option<f64>,
        _options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        panic!("{} lost its model", self.id);
    }
    fn step(
        &self,
        price: &[f64],
        prior: &[f64],
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        self.solve(price, prior, None, options)
    }
    fn utility(&self, _flow: &[f64], _price: &[f64]) -> f64 {
        0.0
    }
    fn type_tag(&self) -> &'static str {
        "tests::PanickingAgent"
    }
    fn to_value(&self) -> serde_json::Result<Value> {
        Ok(Value::Null)
    }
}

/// Serializable agent used to exercise custom registry entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantAgent {
    pub id: String,
    pub row: Vec<f64>,
}

impl ConstantAgent {
    pub const TYPE_TAG: &'static str = "tests::ConstantAgent";

    pub fn decode(value: Value) -> Result<Box<dyn Agent>, CheckpointError> {
        let agent: Self = serde_json::from_value(value)?;
        Ok(Box::new(agent))
    }
}

impl Agent for ConstantAgent {
    fn id(&self) -> &str {
        &self.id
    }
    fn rows(&self) -> usize {
        1
    }
    fn time_slots(&self) -> usize {
        self.row.len()
    }
    fn solve(
        &self,
        _price: &[f64],
        _prior: &[f64],
        _prox: Option<f64>,
        _options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        Ok(self.row.clone())
    }
    fn step(
        &self,
        price: &[f64],
        prior: &[f64],
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        self.solve(price, prior, None, options)
    }
    fn utility(&self, flow: &[f64], price: &[f64]) -> f64 {
        -flow.iter().zip(price).map(|(s, p)| s * p).sum::<f64>()
    }
    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }
    fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Quadratic supplier with cost `a = 2e-3` and a fixed load of `[1, 2, 3, 4]`.
pub fn supply_and_load() -> DeviceSet {
    DeviceSet::new(vec![
        Box::new(DeviceAgent::single(QuadraticDevice::supplier("gen", 2e-3, 4)).unwrap()),
        Box::new(ProfileLoad::new("load", vec![1.0, 2.0, 3.0, 4.0]).unwrap()),
    ])
    .unwrap()
}

/// Parameters of the convergence scenario: tol 1e-3, 50 rounds, step size 1e-3.
pub fn convergence_params() -> MarketParams {
    MarketParams {
        tol: 1e-3,
        maxsteps: 50,
        stepsize: Param::Constant(1e-3),
        ..MarketParams::default()
    }
}

/// Three agents over four slots: a supplier, an elastic home with storage,
/// and a fixed load.
pub fn three_agent_set() -> DeviceSet {
    let home = DeviceAgent::new(
        "home",
        vec![
            QuadraticDevice::elastic_load("heat", 0.5, &[0.02, 0.03, 0.05, 0.04], 3.0),
            QuadraticDevice::storage("battery", 0.05, 2.0, 4),
        ],
    )
    .unwrap();
    DeviceSet::new(vec![
        Box::new(DeviceAgent::single(QuadraticDevice::supplier("grid", 5e-3, 4)).unwrap()),
        Box::new(home),
        Box::new(ProfileLoad::new("street", vec![1.0, 1.5, 2.0, 1.0]).unwrap()),
    ])
    .unwrap()
}

/// Builds a market with the default parameters overridden by `params`.
pub fn market(deviceset: DeviceSet, params: MarketParams) -> Market {
    Market::new(deviceset, params).unwrap()
}

/// Asserts two float slices are element-wise within `tol`.
pub fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol, "index {i}: {a} vs {e}");
    }
}
