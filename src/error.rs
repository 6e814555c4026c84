//! Error types shared across the engine, configuration and checkpoint layers.

use std::path::PathBuf;

use crate::devices::SolveError;

/// Configuration error with field path and constraint description.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("config error: {field}: {message}")]
pub struct ConfigError {
    /// Dotted field path (e.g., `"market.tol"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl ConfigError {
    /// Creates a new error for `field`.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while persisting or restoring checkpoint records.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed checkpoint record {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("not a checkpoint directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("record name {} does not carry a step index", .0.display())]
    BadRecordName(PathBuf),

    #[error("unknown type tag \"{0}\"")]
    UnknownType(String),

    #[error("missing `_type` tag on {0}")]
    MissingType(&'static str),

    #[error("invalid checkpoint record: {0}")]
    Invalid(String),

    #[error("snapshot index {index} out of range ({len} records)")]
    OutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

/// Engine-level errors. Non-convergence is not an error.
#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{name} evaluated to a non-finite value at step {steps}")]
    Parameter { name: &'static str, steps: usize },

    #[error("prox evaluated to {value} at step {steps}, must be >= 0")]
    NegativeProx { steps: usize, value: f64 },

    #[error("price diverged at step {steps}")]
    Diverged { steps: usize },

    #[error("round {steps} aborted: {source}")]
    AgentFailed {
        steps: usize,
        #[source]
        source: SolveError,
    },

    #[error("round {steps} incomplete: received {received} of {expected} agent results")]
    IncompleteRound {
        steps: usize,
        received: usize,
        expected: usize,
    },

    #[error("failed to build agent worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("listener failed: {0}")]
    Listener(#[from] CheckpointError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_names_field() {
        let e = ConfigError::new("market.tol", "must be >= 0");
        assert_eq!(e.to_string(), "config error: market.tol: must be >= 0");
    }

    #[test]
    fn checkpoint_error_wraps_into_market_error() {
        let e: MarketError = CheckpointError::UnknownType("x.Y".into()).into();
        assert!(matches!(e, MarketError::Listener(_)));
        assert!(e.to_string().contains("x.Y"));
    }
}
