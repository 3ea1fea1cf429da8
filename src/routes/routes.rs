//! Defines routes for uploads and published datasets.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST   /uploads`               — select a file, start or resume its upload
//!   - `GET    /uploads/{id}`          — progress and result
//!   - `POST   /uploads/{id}/pause`
//!   - `POST   /uploads/{id}/resume`
//!   - `POST   /uploads/{id}/cancel`
//!   - `POST   /uploads/{id}/publish`  — run the publish saga on a finished upload
//!
//! - **Dataset endpoints**
//!   - `GET    /datasets/{id}`
//!   - `DELETE /datasets/{id}`         — forced removal (removal saga)

use crate::{
    handlers::{
        dataset_handlers::{get_dataset, remove_dataset},
        health_handlers::{healthz, readyz},
        upload_handlers::{
            cancel_upload, create_upload, get_upload, pause_upload, publish_upload, resume_upload,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router carrying `AppState` to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload routes
        .route("/uploads", post(create_upload))
        .route("/uploads/{id}", get(get_upload))
        .route("/uploads/{id}/pause", post(pause_upload))
        .route("/uploads/{id}/resume", post(resume_upload))
        .route("/uploads/{id}/cancel", post(cancel_upload))
        .route("/uploads/{id}/publish", post(publish_upload))
        // Dataset routes
        .route("/datasets/{id}", get(get_dataset).delete(remove_dataset))
}
