//! Core engine types: the flow matrix, strategy and policy selectors, and
//! per-instance market parameters.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::devices::SolverOptions;
use crate::error::ConfigError;
use crate::sim::param::Param;

/// Dense row-major `(rows, cols)` matrix of agent flows.
///
/// Row order matches the device set's slice order; columns are time slots.
/// Serializes as a sequence of rows.
///
/// # Examples
///
/// ```
/// use power_market_sim::sim::types::FlowMatrix;
///
/// let m = FlowMatrix::from_rows(vec![vec![1.0, -2.0], vec![3.0, 0.5]]).unwrap();
/// assert_eq!(m.shape(), (2, 2));
/// assert_eq!(m.column_sums(), vec![4.0, -1.5]);
/// assert_eq!(m.positive_column_sums(), vec![4.0, 0.5]);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>")]
pub struct FlowMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl FlowMatrix {
    /// All-zero matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Builds a matrix from nested rows.
    ///
    /// # Errors
    ///
    /// Returns a message if rows have differing lengths.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, String> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != cols) {
            return Err(format!(
                "row {i} has {} columns, expected {cols}",
                row.len()
            ));
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data: rows.into_iter().flatten().collect(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Row-major backing storage.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Row `r`.
    ///
    /// # Panics
    ///
    /// Panics if `r >= rows()`.
    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Iterates over rows in order.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        // chunks(0) panics; an empty-column matrix has no meaningful rows
        self.data.chunks(self.cols.max(1))
    }

    /// Contiguous block of rows as a flat row-major slice.
    ///
    /// # Panics
    ///
    /// Panics if `range` exceeds the row count.
    pub fn rows_slice(&self, range: &Range<usize>) -> &[f64] {
        &self.data[range.start * self.cols..range.end * self.cols]
    }

    /// Mutable counterpart of [`FlowMatrix::rows_slice`].
    ///
    /// # Panics
    ///
    /// Panics if `range` exceeds the row count.
    pub fn rows_slice_mut(&mut self, range: &Range<usize>) -> &mut [f64] {
        &mut self.data[range.start * self.cols..range.end * self.cols]
    }

    /// Per-column sum of all entries.
    pub fn column_sums(&self) -> Vec<f64> {
        self.fold_columns(|_| true)
    }

    /// Per-column sum of positive entries (consumption).
    pub fn positive_column_sums(&self) -> Vec<f64> {
        self.fold_columns(|v| v > 0.0)
    }

    /// Per-column sum of negative entries (production).
    pub fn negative_column_sums(&self) -> Vec<f64> {
        self.fold_columns(|v| v < 0.0)
    }

    fn fold_columns(&self, keep: impl Fn(f64) -> bool) -> Vec<f64> {
        let mut sums = vec![0.0; self.cols];
        for row in self.iter_rows() {
            for (sum, v) in sums.iter_mut().zip(row) {
                if keep(*v) {
                    *sum += v;
                }
            }
        }
        sums
    }
}

impl TryFrom<Vec<Vec<f64>>> for FlowMatrix {
    type Error = String;

    fn try_from(rows: Vec<Vec<f64>>) -> Result<Self, Self::Error> {
        Self::from_rows(rows)
    }
}

impl Serialize for FlowMatrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter_rows().take(self.rows))
    }
}

macro_rules! named_choice {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every accepted name.
            pub const NAMES: &'static [&'static str] = &[$($text),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(ConfigError::new(
                        $field,
                        format!(
                            "unknown name \"{other}\" (expected one of: {})",
                            Self::NAMES.join(", ")
                        ),
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

named_choice! {
    /// How agents answer a price broadcast.
    AgentStrategy, "market.agent_strategy" {
        /// Full local optimum, optionally anchored by the proximal term.
        #[default]
        PointBid => "point_bid",
        /// One bounded move from the prior flow; prox is not applied.
        LimitedMinimization => "limited_minimization",
    }
}

named_choice! {
    /// What the engine does when an agent solve fails.
    FailurePolicy, "market.failure_policy" {
        /// Keep the agent's prior rows.
        #[default]
        Fallback => "fallback",
        /// Retry once with relaxed solver options, then fall back.
        Retry => "retry",
        /// Fail the round and the run.
        Abort => "abort",
    }
}

named_choice! {
    /// Direction of the per-round price move.
    PriceRule, "market.price_rule" {
        /// `price += stepsize * excess`
        #[default]
        Linear => "linear",
        /// `price += stepsize * excess / |excess|`
        Normalized => "normalized",
        /// Linear, applied to a random half of the slots each round.
        Asynchronous => "asynchronous",
    }
}

/// Per-instance market parameters.
///
/// # Examples
///
/// ```
/// use power_market_sim::sim::types::MarketParams;
///
/// let p = MarketParams::default();
/// assert_eq!(p.maxsteps, 100);
/// assert_eq!(p.stepsize.value(0), 1e-3);
/// assert!(p.prox.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketParams {
    /// Stability tolerance on `|excess[t]|` (must be > 0).
    pub tol: f64,
    /// Round budget.
    pub maxsteps: usize,
    /// Price step size, constant or a function of `steps`.
    pub stepsize: Param,
    /// Proximal penalty, constant or a function of `steps`. Never applied on round 0.
    pub prox: Option<Param>,
    pub agent_strategy: AgentStrategy,
    pub failure_policy: FailurePolicy,
    pub price_rule: PriceRule,
    /// Seed for the asynchronous price rule.
    pub seed: u64,
    pub solver: SolverOptions,
}

impl Default for MarketParams {
    fn default() -> Self {
        Self {
            tol: 1e-3,
            maxsteps: 100,
            stepsize: Param::Constant(1e-3),
            prox: None,
            agent_strategy: AgentStrategy::default(),
            failure_policy: FailurePolicy::default(),
            price_rule: PriceRule::default(),
            seed: 42,
            solver: SolverOptions::default(),
        }
    }
}

impl MarketParams {
    /// Collects every parameter problem.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if !self.tol.is_finite() || self.tol <= 0.0 {
            errors.push(ConfigError::new("market.tol", "must be finite and > 0"));
        }
        if self.maxsteps == 0 {
            errors.push(ConfigError::new("market.maxsteps", "must be > 0"));
        }
        if matches!(self.prox, Some(Param::Constant(v)) if v < 0.0) {
            errors.push(ConfigError::new("market.prox", "must be >= 0"));
        }
        if !self.solver.ftol.is_finite() || self.solver.ftol <= 0.0 {
            errors.push(ConfigError::new("solver.ftol", "must be finite and > 0"));
        }
        if self.solver.maxiter == 0 {
            errors.push(ConfigError::new("solver.maxiter", "must be > 0"));
        }
        errors
    }
}
