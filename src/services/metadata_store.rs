//! Metadata-store collaborator and its SQLite implementation.
//!
//! Deleting a dataset is a soft delete: the row flips to `removed` and, in the
//! same transaction, a `delete_object` task is queued in the outbox so the
//! reconciler can reclaim the stored bytes later. Restoring reverses both.
//! Reads only ever see `active` rows.

use crate::models::dataset::{DatasetRecord, DatasetStatus, NewDataset};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Outbox event asking the reconciler to delete an orphaned object.
pub const DELETE_OBJECT_EVENT: &str = "delete_object";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("dataset {0} not found")]
    NotFound(i64),
    #[error("invalid dataset: {0}")]
    Invalid(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Pending work for the external outbox reconciler.
#[derive(Clone, Debug, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OutboxTask {
    pub id: i64,
    pub event_type: String,
    pub payload: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Register a dataset and return its id.
    async fn create_dataset(&self, fields: &NewDataset) -> MetadataResult<i64>;

    /// Soft-delete an active dataset.
    async fn delete_dataset(&self, dataset_id: i64) -> MetadataResult<()>;

    /// Bring a soft-deleted dataset back to `active`.
    async fn restore_dataset(&self, dataset_id: i64) -> MetadataResult<()>;

    /// An active dataset. Soft-deleted ones are `NotFound`.
    async fn get_dataset(&self, dataset_id: i64) -> MetadataResult<DatasetRecord>;
}

#[derive(Clone)]
pub struct SqliteMetadataStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn pending_outbox_tasks(&self) -> MetadataResult<Vec<OutboxTask>> {
        let tasks = sqlx::query_as::<_, OutboxTask>(
            "SELECT id, event_type, payload, status, created_at
             FROM outbox WHERE status = 'pending' ORDER BY id ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(tasks)
    }
}

fn object_payload(object_name: &str) -> String {
    json!({ "objectName": object_name }).to_string()
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create_dataset(&self, fields: &NewDataset) -> MetadataResult<i64> {
        if fields.title.trim().is_empty() {
            return Err(MetadataError::Invalid("title must not be empty".into()));
        }
        if fields.object_name.is_empty() {
            return Err(MetadataError::Invalid("object name must not be empty".into()));
        }
        let file_size = i64::try_from(fields.file_size)
            .map_err(|_| MetadataError::Invalid("file size out of range".into()))?;

        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO datasets (
                title, description, category, license, object_name,
                file_size, is_free, price, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&fields.title)
        .bind(&fields.description)
        .bind(&fields.category)
        .bind(&fields.license)
        .bind(&fields.object_name)
        .bind(file_size)
        .bind(fields.is_free)
        .bind(&fields.price)
        .bind(DatasetStatus::Active)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        debug!(dataset_id = id, object = %fields.object_name, "registered dataset");
        Ok(id)
    }

    async fn delete_dataset(&self, dataset_id: i64) -> MetadataResult<()> {
        let mut tx = self.db.begin().await?;

        let object_name: String = sqlx::query_scalar(
            "SELECT object_name FROM datasets WHERE id = ? AND status = 'active'",
        )
        .bind(dataset_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(MetadataError::NotFound(dataset_id))?;

        let now = Utc::now();
        sqlx::query("UPDATE datasets SET status = ?, updated_at = ? WHERE id = ?")
            .bind(DatasetStatus::Removed)
            .bind(now)
            .bind(dataset_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO outbox (event_type, payload, status, created_at, updated_at)
             VALUES (?, ?, 'pending', ?, ?)",
        )
        .bind(DELETE_OBJECT_EVENT)
        .bind(object_payload(&object_name))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(dataset_id, object = %object_name, "soft-deleted dataset");
        Ok(())
    }

    async fn restore_dataset(&self, dataset_id: i64) -> MetadataResult<()> {
        let mut tx = self.db.begin().await?;

        let object_name: String =
            sqlx::query_scalar("SELECT object_name FROM datasets WHERE id = ?")
                .bind(dataset_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(MetadataError::NotFound(dataset_id))?;

        sqlx::query("UPDATE datasets SET status = ?, updated_at = ? WHERE id = ?")
            .bind(DatasetStatus::Active)
            .bind(Utc::now())
            .bind(dataset_id)
            .execute(&mut *tx)
            .await?;

        let cancelled = sqlx::query(
            "DELETE FROM outbox WHERE event_type = ? AND payload = ? AND status = 'pending'",
        )
        .bind(DELETE_OBJECT_EVENT)
        .bind(object_payload(&object_name))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            dataset_id,
            cancelled_tasks = cancelled.rows_affected(),
            "restored dataset"
        );
        Ok(())
    }

    async fn get_dataset(&self, dataset_id: i64) -> MetadataResult<DatasetRecord> {
        sqlx::query_as::<_, DatasetRecord>(
            "SELECT id, title, description, category, license, object_name, file_size,
                    is_free, price, status, created_at, updated_at
             FROM datasets WHERE id = ? AND status = 'active'",
        )
        .bind(dataset_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => MetadataError::NotFound(dataset_id),
            other => MetadataError::Sqlx(other),
        })
    }
}
