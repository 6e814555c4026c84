//! API response and query types.

use serde::{Deserialize, Serialize};

use crate::sim::kpi::{RoundRecord, RunReport};

/// Final market state.
#[derive(Debug, Serialize)]
pub struct StateResponse {
    /// End-of-run summary, including the final price.
    pub report: RunReport,
    /// Final excess demand per slot.
    pub excess: Vec<f64>,
    /// Final flow rows.
    pub flows: Vec<FlowRow>,
    /// Record of the last completed round, if any round ran.
    pub latest_round: Option<RoundRecord>,
}

/// One labelled row of the flow matrix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowRow {
    /// Row label, `agent` or `agent.device`.
    pub row: String,
    /// Flow per time slot.
    pub values: Vec<f64>,
}

/// Optional range query parameters for the trace endpoint.
#[derive(Debug, Deserialize)]
pub struct TraceQuery {
    /// First round (inclusive).
    pub from: Option<usize>,
    /// Last round (inclusive).
    pub to: Option<usize>,
}

/// Error response body for 400-class errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
}
