//! Request handlers for the API endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use super::AppState;
use super::types::{ErrorResponse, StateResponse, TraceQuery};
use crate::sim::kpi::RoundRecord;

/// Returns the run report, final excess and flow rows.
///
/// `GET /state` → 200 + `StateResponse` JSON
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    Json(StateResponse {
        report: state.report.clone(),
        excess: state.excess.clone(),
        flows: state.flows.clone(),
        latest_round: state.trace.last().cloned(),
    })
}

/// Returns round records, optionally filtered by round range.
///
/// `GET /trace` → 200 + `Vec<RoundRecord>` JSON
/// `GET /trace?from=N&to=M` → filtered range (inclusive)
/// `GET /trace?from=10&to=5` → 400 + `ErrorResponse`
pub async fn get_trace(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TraceQuery>,
) -> impl IntoResponse {
    let from = query.from.unwrap_or(0);
    let to = query.to.unwrap_or(usize::MAX);

    if from > to {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("`from` ({from}) must be <= `to` ({to})"),
            }),
        ));
    }

    let records: Vec<RoundRecord> = state
        .trace
        .iter()
        .filter(|r| r.step >= from && r.step <= to)
        .cloned()
        .collect();

    Ok(Json(records))
}
