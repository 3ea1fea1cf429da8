//! Core data models for the dataset publisher.
//!
//! Upload bookkeeping (`fingerprint`, `session`) is owned by the upload
//! engine. Dataset records are owned by the metadata store and only
//! referenced here. Saga outcomes are what the UI layer gets to see.

pub mod dataset;
pub mod events;
pub mod fingerprint;
pub mod session;
