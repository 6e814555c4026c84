//! REST API over a finished market run.
//!
//! Provides two GET endpoints:
//! - `/state`: run report, final price, excess and flow rows
//! - `/trace`: per-round records with optional range filtering

mod handlers;
mod types;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tracing::info;

use crate::sim::engine::Market;
use crate::sim::kpi::{RoundRecord, RunReport};

pub use types::{ErrorResponse, FlowRow, StateResponse, TraceQuery};

/// Immutable application state shared across all request handlers.
///
/// Constructed once after the run completes and wrapped in `Arc`; all data
/// is read-only.
#[derive(Debug, Clone)]
pub struct AppState {
    /// End-of-run summary.
    pub report: RunReport,
    /// One record per completed round.
    pub trace: Vec<RoundRecord>,
    /// Final excess demand per slot.
    pub excess: Vec<f64>,
    /// Final flow rows, labelled.
    pub flows: Vec<FlowRow>,
}

impl AppState {
    /// Captures the final state of `market` together with its round trace.
    pub fn from_market(market: &Market, trace: Vec<RoundRecord>) -> Self {
        let flows = market
            .deviceset()
            .row_ids()
            .into_iter()
            .zip(market.flow().iter_rows())
            .map(|(row, values)| FlowRow {
                row,
                values: values.to_vec(),
            })
            .collect();
        Self {
            report: RunReport::from_market(market),
            trace,
            excess: market.excess(),
            flows,
        }
    }
}

/// Builds the axum router with all API routes.
///
/// # Arguments
///
/// * `state` - Shared application state
///
/// # Returns
///
/// Configured `Router` ready to serve.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/state", get(handlers::get_state))
        .route("/trace", get(handlers::get_trace))
        .with_state(state)
}

/// Binds to the given address and serves the API until the process ends.
///
/// # Errors
///
/// Returns an `io::Error` if the listener cannot bind or the server fails.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    axum::serve(listener, app).await
}
