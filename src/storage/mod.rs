//! Persistence seam for requests, signatures and history.
//!
//! `write_request_status` is the concurrency primitive of the whole workflow: a compare-and-swap
//! on the stored status, committed together with the step's signature or not at all.

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{HistoryEntry, NewHistoryEntry};
use crate::signature::types::SignatureRecord;
use crate::workflow::types::{Request, RequestFieldUpdates, RequestId, RequestStatus, StepType};

pub use memory::InMemoryStorage;
#[cfg(feature = "database")]
pub use sqlite::SqliteStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    #[error("request {request_id} is {actual}, expected {expected}")]
    StatusMismatch {
        request_id: RequestId,
        expected: RequestStatus,
        actual: RequestStatus,
    },

    #[error("signature for step {step} already exists on request {request_id}")]
    DuplicateSignature { request_id: RequestId, step: StepType },

    #[error("request number {0} is already taken")]
    DuplicateRequestNumber(String),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// A conditional status write: applied only while the stored status still equals `expected_from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub request_id: RequestId,
    pub expected_from: RequestStatus,
    pub to: RequestStatus,
    pub fields: RequestFieldUpdates,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_request(&self, request: &Request) -> Result<(), StorageError>;

    async fn read_request(&self, id: RequestId) -> Result<Option<Request>, StorageError>;

    async fn list_requests(&self) -> Result<Vec<Request>, StorageError>;

    /// Atomically swap the status and, when given, insert the step's signature.
    ///
    /// Fails with `StatusMismatch` (carrying the actual status) when the stored status no longer
    /// equals `expected_from`, and with `DuplicateSignature` when the step is already signed.
    /// Either failure leaves nothing written.
    async fn write_request_status(
        &self,
        update: &StatusUpdate,
        signature: Option<&SignatureRecord>,
    ) -> Result<(), StorageError>;

    async fn insert_signature(&self, signature: &SignatureRecord) -> Result<(), StorageError>;

    async fn read_signature(&self, id: Uuid) -> Result<Option<SignatureRecord>, StorageError>;

    /// Signatures for a request in insertion order.
    async fn signatures_for(&self, id: RequestId) -> Result<Vec<SignatureRecord>, StorageError>;

    async fn insert_history(&self, entry: &NewHistoryEntry) -> Result<HistoryEntry, StorageError>;

    /// History for a request in insertion order.
    async fn history_for(&self, id: RequestId) -> Result<Vec<HistoryEntry>, StorageError>;
}
