use serde::{Deserialize, Serialize};

use crate::devices::types::{SolveError, SolverOptions, ensure_finite};

/// Fraction of the distance to the local optimum covered by one limited step.
const STEP_DAMPING: f64 = 0.5;

/// A single flow row with a separable quadratic cost.
///
/// Per time slot the device pays `a / 2 * s^2 + b[t] * s` for flow `s`,
/// subject to `min <= s <= max` (either side may be open) and, optionally,
/// `energy_min <= sum(s) <= energy_max` over the whole row.
///
/// # Power Flow Convention
/// - Positive flow: consumption (load)
/// - Negative flow: production (supply)
///
/// # Examples
///
/// ```
/// use power_market_sim::devices::QuadraticDevice;
/// use power_market_sim::devices::SolverOptions;
///
/// // Supplier with marginal cost 2e-3 * q: supplies 500 * price.
/// let supplier = QuadraticDevice::supplier("gen", 2e-3, 2);
/// let flow = supplier
///     .solve_row(&[1.0, 2.0], &[0.0, 0.0], None, &SolverOptions::default())
///     .unwrap();
/// assert!((flow[0] + 500.0).abs() < 1e-9);
/// assert!((flow[1] + 1000.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuadraticDevice {
    /// Device identifier, unique within its agent.
    pub id: String,

    /// Quadratic cost coefficient (must be >= 0).
    pub a: f64,

    /// Per-slot linear cost coefficient. Its length sets the number of time slots.
    pub b: Vec<f64>,

    /// Per-slot lower flow bound, `None` for unbounded.
    #[serde(default)]
    pub min: Option<f64>,

    /// Per-slot upper flow bound, `None` for unbounded.
    #[serde(default)]
    pub max: Option<f64>,

    /// Lower bound on the row sum.
    #[serde(default)]
    pub energy_min: Option<f64>,

    /// Upper bound on the row sum.
    #[serde(default)]
    pub energy_max: Option<f64>,
}

impl QuadraticDevice {
    /// Creates an unbounded device with cost `a / 2 * s^2 + b[t] * s`.
    pub fn new(id: impl Into<String>, a: f64, b: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            a,
            b,
            min: None,
            max: None,
            energy_min: None,
            energy_max: None,
        }
    }

    /// Supplier with production cost `cost / 2 * q^2`: flow is never positive
    /// and its magnitude is unbounded.
    pub fn supplier(id: impl Into<String>, cost: f64, time_slots: usize) -> Self {
        Self::new(id, cost, vec![0.0; time_slots]).with_bounds(None, Some(0.0))
    }

    /// Price-elastic load valuing consumption at `value[t]` per unit, with
    /// diminishing returns `curvature` and a per-slot cap `max_kw`.
    pub fn elastic_load(
        id: impl Into<String>,
        curvature: f64,
        value: &[f64],
        max_kw: f64,
    ) -> Self {
        let b = value.iter().map(|v| -v).collect();
        Self::new(id, curvature, b).with_bounds(Some(0.0), Some(max_kw))
    }

    /// Energy-neutral storage: charges and discharges up to `rate_kw` per slot
    /// with wear cost `wear_cost / 2 * s^2`, and ends the horizon where it started.
    pub fn storage(id: impl Into<String>, wear_cost: f64, rate_kw: f64, time_slots: usize) -> Self {
        Self::new(id, wear_cost, vec![0.0; time_slots])
            .with_bounds(Some(-rate_kw), Some(rate_kw))
            .with_energy(Some(0.0), Some(0.0))
    }

    /// Sets per-slot flow bounds.
    pub fn with_bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Sets bounds on the row sum.
    pub fn with_energy(mut self, energy_min: Option<f64>, energy_max: Option<f64>) -> Self {
        self.energy_min = energy_min;
        self.energy_max = energy_max;
        self
    }

    /// Number of time slots.
    pub fn time_slots(&self) -> usize {
        self.b.len()
    }

    /// Checks parameter consistency, returning a description of the first problem.
    pub fn check(&self) -> Result<(), String> {
        if self.b.is_empty() {
            return Err(format!("device {}: `b` must not be empty", self.id));
        }
        if !self.a.is_finite() || self.a < 0.0 {
            return Err(format!("device {}: `a` must be finite and >= 0", self.id));
        }
        if self.b.iter().any(|v| !v.is_finite()) {
            return Err(format!("device {}: `b` must be finite", self.id));
        }
        if matches!((self.min, self.max), (Some(lo), Some(hi)) if lo > hi) {
            return Err(format!("device {}: min must be <= max", self.id));
        }
        if matches!((self.energy_min, self.energy_max), (Some(lo), Some(hi)) if lo > hi) {
            return Err(format!(
                "device {}: energy_min must be <= energy_max",
                self.id
            ));
        }
        Ok(())
    }

    /// Intrinsic utility of `flow`: the negated cost.
    pub fn intrinsic_utility(&self, flow: &[f64]) -> f64 {
        -flow
            .iter()
            .zip(&self.b)
            .map(|(s, b)| 0.5 * self.a * s * s + b * s)
            .sum::<f64>()
    }

    /// Minimizes `cost(s) + price · s + prox / 2 * |s - prior|^2` over the
    /// feasible set.
    ///
    /// Without an active energy bound the solution is closed-form per slot.
    /// Otherwise the energy multiplier is found by bisection, bounded by
    /// `options.maxiter` and accepted when the row sum is within
    /// `options.ftol` of the violated bound.
    ///
    /// # Errors
    ///
    /// - [`SolveError::ShapeMismatch`] if `price` or `prior` has the wrong length
    /// - [`SolveError::NonFinite`] if inputs are non-finite or the problem is unbounded
    /// - [`SolveError::NotConverged`] if the energy multiplier search fails
    pub fn solve_row(
        &self,
        price: &[f64],
        prior: &[f64],
        prox: Option<f64>,
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        let t = self.time_slots();
        for len in [price.len(), prior.len()] {
            if len != t {
                return Err(SolveError::ShapeMismatch {
                    agent: self.id.clone(),
                    expected: t,
                    actual: len,
                });
            }
        }
        ensure_finite(&self.id, price)?;
        ensure_finite(&self.id, prior)?;

        let rho = prox.unwrap_or(0.0).max(0.0);
        let free = self.flow_at(price, prior, rho, 0.0)?;
        let Some(target) = self.energy_target(free.iter().sum()) else {
            return Ok(free);
        };
        self.search_multiplier(price, prior, rho, target, options)
    }

    /// One damped Newton step from `prior` toward the local optimum.
    ///
    /// For a quadratic cost the undamped step lands on the optimum, so the
    /// result is `prior + 0.5 * (optimum - prior)` projected onto the slot
    /// bounds.
    ///
    /// # Errors
    ///
    /// Same as [`QuadraticDevice::solve_row`].
    pub fn step_row(
        &self,
        price: &[f64],
        prior: &[f64],
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        let target = self.solve_row(price, prior, None, options)?;
        Ok(prior
            .iter()
            .zip(&target)
            .map(|(s0, s)| self.project(s0 + STEP_DAMPING * (s - s0)))
            .collect())
    }

    /// Row sum the solution must hit, or `None` if `sum` is already feasible.
    fn energy_target(&self, sum: f64) -> Option<f64> {
        match (self.energy_min, self.energy_max) {
            (Some(lo), _) if sum < lo => Some(lo),
            (_, Some(hi)) if sum > hi => Some(hi),
            _ => None,
        }
    }

    fn project(&self, v: f64) -> f64 {
        let v = self.min.map_or(v, |lo| v.max(lo));
        self.max.map_or(v, |hi| v.min(hi))
    }

    /// Per-slot minimizer with energy multiplier `lambda`.
    fn flow_at(
        &self,
        price: &[f64],
        prior: &[f64],
        rho: f64,
        lambda: f64,
    ) -> Result<Vec<f64>, SolveError> {
        let curvature = self.a + rho;
        price
            .iter()
            .zip(prior)
            .zip(&self.b)
            .map(|((p, s0), b)| {
                let linear = p + b + lambda;
                let v = if curvature > 0.0 {
                    (rho * s0 - linear) / curvature
                } else if linear > 0.0 {
                    self.min.unwrap_or(f64::NEG_INFINITY)
                } else if linear < 0.0 {
                    self.max.unwrap_or(f64::INFINITY)
                } else {
                    *s0
                };
                let v = self.project(v);
                if v.is_finite() {
                    Ok(v)
                } else {
                    Err(SolveError::NonFinite {
                        agent: self.id.clone(),
                    })
                }
            })
            .collect()
    }

    /// Bisection on the energy multiplier. The row sum is non-increasing in
    /// the multiplier, so the bracket is widened until it straddles `target`.
    fn search_multiplier(
        &self,
        price: &[f64],
        prior: &[f64],
        rho: f64,
        target: f64,
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError> {
        let tolerance = options.ftol * target.abs().max(1.0);
        let sum_at = |lambda: f64| -> Result<f64, SolveError> {
            Ok(self.flow_at(price, prior, rho, lambda)?.iter().sum())
        };
        let not_converged = |iterations: usize, residual: f64| SolveError::NotConverged {
            agent: self.id.clone(),
            iterations,
            residual,
        };

        let mut iterations = 0;
        let (mut lo, mut hi) = (-1.0_f64, 1.0_f64);
        while sum_at(hi)? > target {
            hi *= 2.0;
            iterations += 1;
            if iterations >= options.maxiter {
                return Err(not_converged(iterations, sum_at(hi)? - target));
            }
        }
        while sum_at(lo)? < target {
            lo *= 2.0;
            iterations += 1;
            if iterations >= options.maxiter {
                return Err(not_converged(iterations, sum_at(lo)? - target));
            }
        }

        loop {
            let mid = 0.5 * (lo + hi);
            let flow = self.flow_at(price, prior, rho, mid)?;
            let residual = flow.iter().sum::<f64>() - target;
            if residual.abs() <= tolerance {
                return Ok(flow);
            }
            if residual > 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
            iterations += 1;
            if iterations >= options.maxiter {
                return Err(not_converged(iterations, residual));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> SolverOptions {
        SolverOptions::default()
    }

    #[test]
    fn supplier_flow_is_negative_and_proportional_to_price() {
        let d = QuadraticDevice::supplier("gen", 0.5, 3);
        let flow = d.solve_row(&[1.0, 0.0, 2.0], &[0.0; 3], None, &opts()).unwrap();
        assert!((flow[0] + 2.0).abs() < 1e-12);
        assert_eq!(flow[1], 0.0);
        assert!((flow[2] + 4.0).abs() < 1e-12);
    }

    #[test]
    fn supplier_never_consumes_at_negative_price() {
        let d = QuadraticDevice::supplier("gen", 0.5, 1);
        let flow = d.solve_row(&[-3.0], &[0.0], None, &opts()).unwrap();
        assert_eq!(flow[0], 0.0);
    }

    #[test]
    fn elastic_load_respects_cap_and_floor() {
        let d = QuadraticDevice::elastic_load("home", 0.1, &[0.5, 0.5, 0.5], 2.0);
        let flow = d.solve_row(&[0.0, 0.45, 0.9], &[0.0; 3], None, &opts()).unwrap();
        assert_eq!(flow[0], 2.0); // (0.5 - 0) / 0.1 = 5 capped at 2
        assert!((flow[1] - 0.5).abs() < 1e-9);
        assert_eq!(flow[2], 0.0);
    }

    #[test]
    fn prox_pulls_solution_toward_prior() {
        let d = QuadraticDevice::supplier("gen", 1.0, 1);
        let free = d.solve_row(&[2.0], &[0.0], None, &opts()).unwrap();
        let anchored = d.solve_row(&[2.0], &[0.0], Some(1.0), &opts()).unwrap();
        assert!((free[0] + 2.0).abs() < 1e-12);
        assert!((anchored[0] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn storage_is_energy_neutral_and_arbitrages() {
        let d = QuadraticDevice::storage("bat", 0.1, 5.0, 4);
        let price = [0.1, 0.2, 0.6, 0.3];
        let flow = d.solve_row(&price, &[0.0; 4], None, &opts()).unwrap();
        let sum: f64 = flow.iter().sum();
        assert!(sum.abs() < 1e-5, "sum = {sum}");
        assert!(flow[0] > 0.0, "charges when cheap");
        assert!(flow[2] < 0.0, "discharges when expensive");
        assert!(flow.iter().all(|v| v.abs() <= 5.0 + 1e-12));
    }

    #[test]
    fn linear_device_without_bound_is_unbounded() {
        let d = QuadraticDevice::new("lin", 0.0, vec![0.0]);
        let err = d.solve_row(&[1.0], &[0.0], None, &opts()).unwrap_err();
        assert!(matches!(err, SolveError::NonFinite { .. }));
    }

    #[test]
    fn bang_bang_energy_constraint_fails_to_converge() {
        let d = QuadraticDevice::new("lin", 0.0, vec![0.0, 0.0])
            .with_bounds(Some(-1.0), Some(1.0))
            .with_energy(Some(0.5), Some(0.5));
        let small = SolverOptions {
            ftol: 1e-9,
            maxiter: 40,
        };
        let err = d.solve_row(&[1.0, 1.0], &[0.0; 2], None, &small).unwrap_err();
        assert!(matches!(err, SolveError::NotConverged { .. }));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let d = QuadraticDevice::supplier("gen", 1.0, 3);
        let err = d.solve_row(&[1.0], &[0.0; 3], None, &opts()).unwrap_err();
        assert_eq!(
            err,
            SolveError::ShapeMismatch {
                agent: "gen".into(),
                expected: 3,
                actual: 1
            }
        );
    }

    #[test]
    fn step_moves_half_way_to_optimum() {
        let d = QuadraticDevice::supplier("gen", 1.0, 1);
        let flow = d.step_row(&[2.0], &[0.0], &opts()).unwrap();
        assert!((flow[0] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn check_rejects_inverted_bounds() {
        let d = QuadraticDevice::new("x", 1.0, vec![0.0]).with_bounds(Some(2.0), Some(1.0));
        assert!(d.check().is_err());
        assert!(QuadraticDevice::supplier("gen", 1.0, 2).check().is_ok());
    }

    #[test]
    fn utility_is_negated_cost() {
        let d = QuadraticDevice::new("x", 2.0, vec![1.0, 1.0]);
        // cost = (1 + 1) + (4 + 2) = 8
        assert!((d.intrinsic_utility(&[1.0, 2.0]) + 8.0).abs() < 1e-12);
    }
}
