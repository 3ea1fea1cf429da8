//! HTTP handlers for published datasets.

use crate::{
    errors::AppError, models::dataset::DatasetRecord, models::events::SagaOutcome,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

/// `GET /datasets/{id}`
pub async fn get_dataset(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DatasetRecord>, AppError> {
    Ok(Json(state.metadata.get_dataset(id).await?))
}

/// `DELETE /datasets/{id}` — forced removal. 200 when removed, 409 with the
/// outcome when the ledger refused and the dataset was restored.
pub async fn remove_dataset(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.removal.remove(id).await?;
    let status = match outcome {
        SagaOutcome::Removed { .. } => StatusCode::OK,
        _ => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)))
}
