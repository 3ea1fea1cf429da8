//! Resumable dataset uploads and the publish/removal sagas that keep object
//! storage, the metadata store and the ledger consistent.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
