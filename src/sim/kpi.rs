//! Per-round trace records and the end-of-run summary.

use std::fmt;

use serde::Serialize;

use crate::error::MarketError;
use crate::sim::engine::Market;
use crate::sim::listener::{Event, Listener};

/// Market indicators captured after one round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundRecord {
    /// Rounds completed when the record was taken.
    pub step: usize,
    pub max_abs_excess: f64,
    pub mean_price: f64,
    pub total_demand: f64,
    /// Sum of production as a positive magnitude.
    pub total_supply: f64,
    pub load_factor: f64,
    /// Sum of demand times price over all slots.
    pub total_cost: f64,
    /// Agent solves that fell back to prior flows in this round.
    pub failed_agents: usize,
    pub stable: bool,
}

impl RoundRecord {
    /// Captures the current state of `market`.
    pub fn capture(market: &Market) -> Self {
        let price = market.price();
        let mean_price = if price.is_empty() {
            0.0
        } else {
            price.iter().sum::<f64>() / price.len() as f64
        };
        Self {
            step: market.steps(),
            max_abs_excess: market.max_abs_excess(),
            mean_price,
            total_demand: market.demand().iter().sum(),
            total_supply: -market.supply().iter().sum::<f64>(),
            load_factor: market.load_factor(),
            total_cost: market.cost().iter().sum(),
            failed_agents: market.last_round_stats().failed.len(),
            stable: market.stable(),
        }
    }
}

/// Listener that keeps one [`RoundRecord`] per completed round.
///
/// The trace is cleared on `after-init`, so a recorder can be reused across runs.
#[derive(Debug, Clone, Default)]
pub struct TraceRecorder {
    records: Vec<RoundRecord>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[RoundRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RoundRecord> {
        self.records
    }
}

impl Listener for TraceRecorder {
    fn notify(&mut self, market: &Market, event: Event) -> Result<(), MarketError> {
        match event {
            Event::AfterInit => self.records.clear(),
            Event::AfterStep => self.records.push(RoundRecord::capture(market)),
            Event::BeforeStart | Event::AfterDone => {}
        }
        Ok(())
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub converged: bool,
    pub steps: usize,
    pub maxsteps: usize,
    pub tol: f64,
    pub max_abs_excess: f64,
    pub utility: f64,
    pub load_factor: f64,
    pub total_cost: f64,
    /// Agent solves that fell back to prior flows over the whole run.
    pub failures: usize,
    pub price: Vec<f64>,
}

impl RunReport {
    /// Summarizes the current state of `market`.
    pub fn from_market(market: &Market) -> Self {
        Self {
            converged: market.stable(),
            steps: market.steps(),
            maxsteps: market.params().maxsteps,
            tol: market.params().tol,
            max_abs_excess: market.max_abs_excess(),
            utility: market.utility(),
            load_factor: market.load_factor(),
            total_cost: market.cost().iter().sum(),
            failures: market.failures(),
            price: market.price().to_vec(),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Market Report ---")?;
        writeln!(
            f,
            "Converged:         {} ({} of {} rounds)",
            self.converged, self.steps, self.maxsteps
        )?;
        writeln!(
            f,
            "Max |excess|:      {:.3e} (tol {:.1e})",
            self.max_abs_excess, self.tol
        )?;
        writeln!(f, "Total utility:     {:.4}", self.utility)?;
        writeln!(f, "Load factor:       {:.3}", self.load_factor)?;
        writeln!(f, "Total cost:        {:.4}", self.total_cost)?;
        write!(f, "Solve failures:    {}", self.failures)
    }
}
