//! Common types and traits for market agents.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Options passed to every agent solve.
///
/// Closed-form agents ignore them; iterative agents use `ftol` as the
/// residual tolerance and stop with [`SolveError::NotConverged`] after
/// `maxiter` iterations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Residual tolerance for iterative solves.
    pub ftol: f64,
    /// Iteration cap for iterative solves.
    pub maxiter: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            ftol: 1e-6,
            maxiter: 500,
        }
    }
}

impl SolverOptions {
    /// Options used for the single retry under the `retry` failure policy:
    /// tolerance relaxed 100x, twice the iterations.
    pub fn relaxed(&self) -> Self {
        Self {
            ftol: self.ftol * 100.0,
            maxiter: self.maxiter.saturating_mul(2),
        }
    }
}

/// Failure reported by an agent solve.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolveError {
    #[error("agent {agent}: no convergence after {iterations} iterations (residual {residual:e})")]
    NotConverged {
        agent: String,
        iterations: usize,
        residual: f64,
    },

    #[error("agent {agent}: non-finite price, warm start or optimum")]
    NonFinite { agent: String },

    #[error("agent {agent}: expected {expected} flow values, got {actual}")]
    ShapeMismatch {
        agent: String,
        expected: usize,
        actual: usize,
    },

    #[error("agent {agent}: solve panicked: {message}")]
    Panicked { agent: String, message: String },
}

impl SolveError {
    /// Id of the agent that failed.
    pub fn agent(&self) -> &str {
        match self {
            Self::NotConverged { agent, .. }
            | Self::NonFinite { agent }
            | Self::ShapeMismatch { agent, .. }
            | Self::Panicked { agent, .. } => agent,
        }
    }
}

/// A market participant owning one or more flow rows.
///
/// Flows are row-major: `rows() * time_slots()` values, row `r` occupying
/// `[r * time_slots(), (r + 1) * time_slots())`. Positive flow is
/// consumption, negative flow is production.
///
/// Implementations must be pure with respect to the solve inputs: the
/// engine may call them concurrently from different worker threads.
pub trait Agent: fmt::Debug + Send + Sync {
    /// Agent identifier, unique within a device set.
    fn id(&self) -> &str;

    /// Number of flow rows owned by this agent.
    fn rows(&self) -> usize;

    /// Number of time slots per row.
    fn time_slots(&self) -> usize;

    /// `(rows, time_slots)`.
    fn shape(&self) -> (usize, usize) {
        (self.rows(), self.time_slots())
    }

    /// Labels for each owned row, used by reports.
    fn row_ids(&self) -> Vec<String> {
        if self.rows() == 1 {
            vec![self.id().to_string()]
        } else {
            (0..self.rows())
                .map(|r| format!("{}.{r}", self.id()))
                .collect()
        }
    }

    /// Point bid: the full local optimum against `price`, optionally
    /// anchored to `prior` by a proximal penalty `prox / 2 * |s - prior|^2`.
    /// The market only passes a non-negative `prox`.
    ///
    /// # Errors
    ///
    /// Returns a [`SolveError`] if no usable optimum was found.
    fn solve(
        &self,
        price: &[f64],
        prior: &[f64],
        prox: Option<f64>,
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError>;

    /// Limited minimization: a single bounded move from `prior` toward the
    /// local optimum. No proximal term is applied.
    ///
    /// # Errors
    ///
    /// Returns a [`SolveError`] if the step could not be computed.
    fn step(
        &self,
        price: &[f64],
        prior: &[f64],
        options: &SolverOptions,
    ) -> Result<Vec<f64>, SolveError>;

    /// Net surplus of `flow` at `price`: intrinsic utility minus `price · flow`.
    fn utility(&self, flow: &[f64], price: &[f64]) -> f64;

    /// Stable type identifier used to rebuild the agent from a checkpoint.
    fn type_tag(&self) -> &'static str;

    /// Serializes the agent's configuration (without the type tag).
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if the configuration cannot be encoded.
    fn to_value(&self) -> serde_json::Result<Value>;
}

/// Dot product helper shared by agent utility implementations.
pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Returns a `NonFinite` error if any value in `values` is NaN or infinite.
pub(crate) fn ensure_finite(agent: &str, values: &[f64]) -> Result<(), SolveError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(SolveError::NonFinite {
            agent: agent.to_string(),
        })
    }
}
