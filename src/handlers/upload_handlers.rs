//! HTTP handlers driving resumable uploads.
//! Each upload is owned by its own `UploadSessionController`, keyed by the
//! session id handed back on creation.

use crate::{
    errors::AppError,
    models::{dataset::DatasetDetails, events::SagaOutcome},
    services::{
        source::{ChunkSource, LocalFile},
        upload_controller::{ResumeChoice, UploadReport, UploadSessionController},
        upload_engine::UploadError,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Body of `POST /uploads`.
#[derive(Debug, Deserialize)]
pub struct CreateUploadReq {
    /// Path of the file on the server's filesystem.
    pub path: String,
    #[serde(default)]
    pub resume: ResumeChoice,
}

async fn controller(state: &AppState, id: Uuid) -> Result<Arc<UploadSessionController>, AppError> {
    state
        .controller(&id)
        .await
        .ok_or_else(|| AppError::not_found(format!("upload {} not found", id)))
}

async fn report(ctl: &UploadSessionController) -> Result<UploadReport, AppError> {
    ctl.report()
        .await
        .ok_or_else(|| AppError::internal("upload has no session"))
}

/// `POST /uploads` — select a file and start (or resume) its upload.
pub async fn create_upload(
    State(state): State<AppState>,
    Json(req): Json<CreateUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let file = LocalFile::open(&req.path)
        .await
        .map_err(UploadError::SourceRead)?;

    let fingerprint = file.fingerprint();
    let reservation = state.reserve(&fingerprint).await.ok_or_else(|| {
        AppError::conflict(format!("`{}` is already being uploaded", fingerprint.name))
    })?;

    let ctl = Arc::new(state.new_controller());
    ctl.select_file(Arc::new(file), req.resume).await?;
    let id = ctl
        .id()
        .ok_or_else(|| AppError::internal("upload has no session"))?;
    state.uploads.write().await.insert(id, ctl.clone());
    drop(reservation);

    tracing::info!(upload = %id, file = %fingerprint.name, "upload started");
    Ok((StatusCode::CREATED, Json(report(&ctl).await?)))
}

/// `GET /uploads/{id}`
pub async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadReport>, AppError> {
    let ctl = controller(&state, id).await?;
    Ok(Json(report(&ctl).await?))
}

/// `POST /uploads/{id}/pause`
pub async fn pause_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let ctl = controller(&state, id).await?;
    ctl.pause_clicked()?;
    Ok((StatusCode::ACCEPTED, Json(report(&ctl).await?)))
}

/// `POST /uploads/{id}/resume`
pub async fn resume_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let ctl = controller(&state, id).await?;
    ctl.resume_clicked().await?;
    Ok((StatusCode::ACCEPTED, Json(report(&ctl).await?)))
}

/// `POST /uploads/{id}/cancel` — returns the final report; the id is
/// unknown afterwards.
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadReport>, AppError> {
    let ctl = controller(&state, id).await?;
    ctl.cancel_clicked().await?;
    let last = report(&ctl).await?;
    state.evict_if_settled(&id).await;
    Ok(Json(last))
}

/// `POST /uploads/{id}/publish` — 201 when published, 409 with the outcome
/// when the ledger refused and everything was rolled back.
pub async fn publish_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(details): Json<DatasetDetails>,
) -> Result<impl IntoResponse, AppError> {
    let ctl = controller(&state, id).await?;
    let result = ctl.publish(&details).await;
    if state.evict_if_settled(&id).await {
        tracing::debug!(upload = %id, "upload settled, forgotten");
    }
    let outcome = result?;
    let status = match outcome {
        SagaOutcome::Published { .. } => StatusCode::CREATED,
        _ => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)))
}
