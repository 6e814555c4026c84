//! Tâtonnement engine: broadcasts a price, collects agent bids, and moves the
//! price along the excess demand until the market clears.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::devices::DeviceSet;
use crate::error::{CheckpointError, MarketError};
use crate::io::checkpoint::Snapshot;
use crate::sim::listener::{Event, Listener};
use crate::sim::param::Param;
use crate::sim::scheduler::{DispatchPlan, RoundScheduler, RoundStats};
use crate::sim::types::{FlowMatrix, MarketParams, PriceRule};

/// Market state and round loop.
///
/// The engine owns the device set, the price vector and the flow matrix.
/// Each round every agent answers the current price in parallel, the answers
/// replace the flow matrix, and the price moves by `stepsize * rule(excess)`.
///
/// # Examples
///
/// ```
/// use power_market_sim::devices::{DeviceAgent, DeviceSet, ProfileLoad, QuadraticDevice};
/// use power_market_sim::sim::engine::Market;
/// use power_market_sim::sim::types::MarketParams;
///
/// let set = DeviceSet::new(vec![
///     Box::new(DeviceAgent::single(QuadraticDevice::supplier("gen", 2e-3, 4)).unwrap()),
///     Box::new(ProfileLoad::new("load", vec![1.0, 2.0, 3.0, 4.0]).unwrap()),
/// ])
/// .unwrap();
/// let params = MarketParams { maxsteps: 50, ..MarketParams::default() };
/// let mut market = Market::new(set, params).unwrap();
///
/// assert!(market.run(&mut []).unwrap());
/// assert!(market.max_abs_excess() <= 1e-3);
/// ```
#[derive(Debug)]
pub struct Market {
    deviceset: DeviceSet,
    params: MarketParams,
    steps: usize,
    price: Vec<f64>,
    s: FlowMatrix,
    last_demand: Vec<f64>,
    last_price: Vec<f64>,
    rng: StdRng,
    failures: usize,
    last_stats: RoundStats,
}

impl Market {
    /// Checkpoint type tag.
    pub const TYPE_TAG: &'static str = "power_market_sim::sim::Market";

    /// Creates a market in its initial state.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::Config`] for the first invalid parameter.
    pub fn new(deviceset: DeviceSet, params: MarketParams) -> Result<Self, MarketError> {
        if let Some(e) = params.validate().into_iter().next() {
            return Err(e.into());
        }
        let (rows, cols) = deviceset.shape();
        Ok(Self {
            rng: StdRng::seed_from_u64(params.seed),
            deviceset,
            params,
            steps: 0,
            price: vec![0.0; cols],
            s: FlowMatrix::zeros(rows, cols),
            last_demand: vec![0.0; cols],
            last_price: vec![0.0; cols],
            failures: 0,
            last_stats: RoundStats::default(),
        })
    }

    /// Rebuilds a market from a checkpoint record, ready to [`Market::resume`].
    ///
    /// The asynchronous price rule is reseeded from the configured seed and
    /// the restored step count.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Invalid`] if the record's vectors do not
    /// match the device set or its parameters are invalid.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, CheckpointError> {
        let Snapshot {
            deviceset,
            params,
            steps,
            price,
            s,
            last_demand,
            last_price,
        } = snapshot;
        let (rows, cols) = deviceset.shape();
        if s.shape() != (rows, cols) {
            return Err(CheckpointError::Invalid(format!(
                "flow matrix is {:?}, device set expects {:?}",
                s.shape(),
                (rows, cols)
            )));
        }
        for (name, v) in [
            ("price", &price),
            ("last_demand", &last_demand),
            ("last_price", &last_price),
        ] {
            if v.len() != cols {
                return Err(CheckpointError::Invalid(format!(
                    "{name} has {} entries, expected {cols}",
                    v.len()
                )));
            }
        }

        let mut market = Self::new(deviceset, params)
            .map_err(|e| CheckpointError::Invalid(e.to_string()))?;
        market.rng = StdRng::seed_from_u64(market.params.seed.wrapping_add(steps as u64));
        market.steps = steps;
        market.price = price;
        market.s = s;
        market.last_demand = last_demand;
        market.last_price = last_price;
        Ok(market)
    }

    /// Resets steps, price, flows and history to zero. Idempotent.
    pub fn initialize(&mut self) {
        let (rows, cols) = self.deviceset.shape();
        self.steps = 0;
        self.price = vec![0.0; cols];
        self.s = FlowMatrix::zeros(rows, cols);
        self.last_demand = vec![0.0; cols];
        self.last_price = vec![0.0; cols];
        self.rng = StdRng::seed_from_u64(self.params.seed);
        self.failures = 0;
        self.last_stats = RoundStats::default();
    }

    /// Runs the market from a fresh state until it is stable or the round
    /// budget is spent. At least one round always runs.
    ///
    /// Fires `after-init`, `before-start`, `after-step` per round and
    /// `after-done`, in that order.
    ///
    /// # Returns
    ///
    /// `Ok(true)` if the final state is stable, `Ok(false)` if the budget ran out.
    ///
    /// # Errors
    ///
    /// - [`MarketError::Parameter`] if step size or prox evaluates to a non-finite value
    /// - [`MarketError::NegativeProx`] if prox evaluates below zero
    /// - [`MarketError::Diverged`] if the price update leaves a non-finite price;
    ///   the market keeps the state of the last completed round
    /// - [`MarketError::AgentFailed`] under the `abort` failure policy
    /// - [`MarketError::Pool`] if the worker pool cannot be built
    /// - [`MarketError::Listener`] if a listener fails
    ///
    /// A failed round leaves the state of the previous round in place and no
    /// further events are fired.
    pub fn run(&mut self, listeners: &mut [&mut dyn Listener]) -> Result<bool, MarketError> {
        self.initialize();
        self.fire(listeners, Event::AfterInit)?;
        self.drive(listeners)
    }

    /// Continues from the current state without resetting it.
    ///
    /// Same loop and events as [`Market::run`], minus `after-init`.
    ///
    /// # Errors
    ///
    /// Same as [`Market::run`].
    pub fn resume(&mut self, listeners: &mut [&mut dyn Listener]) -> Result<bool, MarketError> {
        self.drive(listeners)
    }

    fn drive(&mut self, listeners: &mut [&mut dyn Listener]) -> Result<bool, MarketError> {
        let scheduler = RoundScheduler::new(self.deviceset.num_agents())?;
        self.fire(listeners, Event::BeforeStart)?;
        while self.steps == 0 || (!self.stable() && self.steps < self.params.maxsteps) {
            self.round(&scheduler)?;
            self.fire(listeners, Event::AfterStep)?;
        }
        self.fire(listeners, Event::AfterDone)?;

        let stable = self.stable();
        info!(
            steps = self.steps,
            stable,
            max_excess = self.max_abs_excess(),
            failures = self.failures,
            "market run finished"
        );
        Ok(stable)
    }

    fn fire(&self, listeners: &mut [&mut dyn Listener], event: Event) -> Result<(), MarketError> {
        for listener in listeners.iter_mut() {
            listener.notify(self, event)?;
        }
        Ok(())
    }

    fn resolve(&self, name: &'static str, param: &Param) -> Result<f64, MarketError> {
        let v = param.value(self.steps);
        if v.is_finite() {
            Ok(v)
        } else {
            Err(MarketError::Parameter {
                name,
                steps: self.steps,
            })
        }
    }

    fn round(&mut self, scheduler: &RoundScheduler) -> Result<(), MarketError> {
        let stepsize = self.resolve("stepsize", &self.params.stepsize)?;
        // agents start from the price-optimal answer, unanchored
        let prox = match &self.params.prox {
            Some(p) if self.steps > 0 => Some(self.resolve("prox", p)?),
            _ => None,
        };
        if let Some(value) = prox.filter(|v| *v < 0.0) {
            return Err(MarketError::NegativeProx {
                steps: self.steps,
                value,
            });
        }
        let plan = DispatchPlan {
            strategy: self.params.agent_strategy,
            options: self.params.solver,
            policy: self.params.failure_policy,
        };

        let output = scheduler.dispatch(&self.deviceset, &self.price, &self.s, prox, plan, self.steps)?;
        let excess = output.flow.column_sums();
        let direction: Vec<f64> = match self.params.price_rule {
            PriceRule::Linear => excess,
            PriceRule::Normalized => unit(excess),
            PriceRule::Asynchronous => excess
                .into_iter()
                .map(|e| if self.rng.random_bool(0.5) { e } else { 0.0 })
                .collect(),
        };
        let price: Vec<f64> = self
            .price
            .iter()
            .zip(&direction)
            .map(|(p, d)| p + stepsize * d)
            .collect();
        // nothing is committed, so the last written record stays readable
        if !price.iter().all(|p| p.is_finite()) {
            return Err(MarketError::Diverged { steps: self.steps });
        }

        self.last_demand = self.demand();
        self.last_price = std::mem::replace(&mut self.price, price);
        self.s = output.flow;
        self.failures += output.stats.failed.len();
        self.last_stats = output.stats;
        self.steps += 1;
        debug!(
            steps = self.steps,
            max_excess = self.max_abs_excess(),
            stepsize,
            failed = self.last_stats.failed.len(),
            "round complete"
        );
        Ok(())
    }

    pub fn deviceset(&self) -> &DeviceSet {
        &self.deviceset
    }

    pub fn params(&self) -> &MarketParams {
        &self.params
    }

    /// Completed rounds since the last reset.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn price(&self) -> &[f64] {
        &self.price
    }

    /// Current flow matrix.
    pub fn flow(&self) -> &FlowMatrix {
        &self.s
    }

    /// Demand before the most recent round.
    pub fn last_demand(&self) -> &[f64] {
        &self.last_demand
    }

    /// Price before the most recent round.
    pub fn last_price(&self) -> &[f64] {
        &self.last_price
    }

    /// Failure bookkeeping of the most recent round.
    pub fn last_round_stats(&self) -> &RoundStats {
        &self.last_stats
    }

    /// Agent solves that fell back to prior flows since the last reset.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Sum of positive flows per slot.
    pub fn demand(&self) -> Vec<f64> {
        self.s.positive_column_sums()
    }

    /// Sum of negative flows per slot.
    pub fn supply(&self) -> Vec<f64> {
        self.s.negative_column_sums()
    }

    /// Net flow per slot. Positive means demand exceeds supply.
    pub fn excess(&self) -> Vec<f64> {
        self.s.column_sums()
    }

    /// Excess scaled to unit length, or all zeros when there is no excess.
    pub fn normal(&self) -> Vec<f64> {
        unit(self.excess())
    }

    /// Mean demand over peak demand; 1 when there is no demand.
    pub fn load_factor(&self) -> f64 {
        let demand = self.demand();
        let peak = demand.iter().copied().fold(0.0, f64::max);
        if peak == 0.0 {
            return 1.0;
        }
        demand.iter().sum::<f64>() / demand.len() as f64 / peak
    }

    /// Total net surplus of all agents at the current price.
    pub fn utility(&self) -> f64 {
        self.deviceset.utility(self.s.as_slice(), &self.price)
    }

    /// Demand times price, per slot.
    pub fn cost(&self) -> Vec<f64> {
        self.demand()
            .iter()
            .zip(&self.price)
            .map(|(d, p)| d * p)
            .collect()
    }

    pub fn max_abs_excess(&self) -> f64 {
        self.excess().iter().fold(0.0, |m, e| m.max(e.abs()))
    }

    /// Whether every slot's excess is within tolerance.
    pub fn stable(&self) -> bool {
        self.excess().iter().all(|e| e.abs() <= self.params.tol)
    }
}

fn unit(v: Vec<f64>) -> Vec<f64> {
    let norm = v.iter().map(|e| e * e).sum::<f64>().sqrt();
    if norm == 0.0 {
        return vec![0.0; v.len()];
    }
    v.into_iter().map(|e| e / norm).collect()
}

fn write_vector(f: &mut fmt::Formatter<'_>, label: &str, values: &[f64]) -> fmt::Result {
    write!(f, "{label:>12} |")?;
    for v in values {
        write!(f, " {v:>9.4}")?;
    }
    writeln!(f)
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "steps={} stable={} max|excess|={:.3e} utility={:.4}",
            self.steps,
            self.stable(),
            self.max_abs_excess(),
            self.utility()
        )?;
        write_vector(f, "price", &self.price)?;
        for (label, row) in self.deviceset.row_ids().iter().zip(self.s.iter_rows()) {
            write_vector(f, label, row)?;
        }
        write_vector(f, "excess", &self.excess())
    }
}
