//! Common error types for the recruitment pipeline

use crate::detector::Role;
use crate::model::{Category, ProcessingStatus};
use crate::notify::NotifyError;
use crate::store::StoreError;
use thiserror::Error;

/// Common result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the pipeline services
#[derive(Error, Debug)]
pub enum Error {
    /// Record store (REDCap) failure, already classified by the client
    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    /// Notification capability failure
    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A role the service cannot run without was not found in the schema
    #[error("No field detected for role '{0}'")]
    FieldNotDetected(Role),

    /// A write would move a record backwards (or sideways) in its lifecycle
    #[error("Invalid status transition for record {record_id}: {from} -> {to}")]
    InvalidTransition {
        record_id: String,
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    /// No identifiers left in a category's configured range
    #[error("Identifier range exhausted for {category} (max {end})")]
    RangeExhausted { category: Category, end: u32 },

    /// Identifier writes kept colliding with concurrent assignments
    #[error("Identifier conflict for record {record_id} persisted after {attempts} attempts")]
    ConflictRetriesExhausted { record_id: String, attempts: u32 },

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this failure belongs to a single record.
    ///
    /// Poll loops log record-scoped failures and move on to the next record.
    /// Everything else (configuration problems, lifecycle violations, bugs)
    /// propagates and ends the cycle.
    pub fn is_record_scoped(&self) -> bool {
        matches!(
            self,
            Error::Store(_)
                | Error::Notify(_)
                | Error::RangeExhausted { .. }
                | Error::ConflictRetriesExhausted { .. }
        )
    }
}
