pub mod fingerprint_store;
pub mod ledger;
pub mod metadata_store;
pub mod object_storage;
pub mod outbox;
pub mod publish_saga;
pub mod removal_saga;
pub mod retry;
pub mod saga;
pub mod source;
pub mod storage_service;
pub mod upload_controller;
pub mod upload_engine;
