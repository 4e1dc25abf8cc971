//! Record store errors and their classification

use std::time::Duration;
use thiserror::Error;

/// HTTP statuses treated as transient (retried with backoff)
pub const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Statuses on which REDCap reports validation problems, including
/// secondary-unique-field collisions
const CONFLICT_CANDIDATE_STATUSES: [u16; 3] = [400, 409, 422];

/// How a caller should react to a store failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limit, server-side 5xx, network trouble: retry with backoff
    Transient,
    /// Malformed request, validation failure, auth: surface immediately
    Permanent,
    /// Write rejected because a unique value is already taken
    Conflict,
}

/// Record store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {status}: {body}")]
    Api {
        status: u16,
        body: String,
        /// Server-supplied `Retry-After` hint
        retry_after: Option<Duration>,
    },

    #[error("Uniqueness conflict (HTTP {status}): {body}")]
    Conflict { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<StoreError>,
    },
}

impl StoreError {
    /// Build the error for a non-success HTTP response
    pub fn from_response(
        status: u16,
        body: String,
        retry_after: Option<Duration>,
        signatures: &ConflictSignatures,
    ) -> Self {
        if signatures.matches(status, &body) {
            StoreError::Conflict { status, body }
        } else {
            StoreError::Api {
                status,
                body,
                retry_after,
            }
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Network(_) => ErrorClass::Transient,
            StoreError::Api { status, .. } if TRANSIENT_STATUSES.contains(status) => {
                ErrorClass::Transient
            }
            StoreError::Api { .. } | StoreError::Parse(_) | StoreError::InvalidFilter(_) => {
                ErrorClass::Permanent
            }
            StoreError::Conflict { .. } => ErrorClass::Conflict,
            StoreError::RetriesExhausted { .. } => ErrorClass::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StoreError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Substrings that identify a uniqueness violation in a REDCap error body.
///
/// REDCap reports secondary-unique-field collisions as plain validation
/// errors; the only signal is the message text. This is a narrow heuristic:
/// it only applies to 400/409/422 responses and matches case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictSignatures(Vec<String>);

impl ConflictSignatures {
    pub const DEFAULTS: [&'static str; 3] = ["unique constraint", "duplicate", "already exists"];

    pub fn new<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            signatures
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    /// Parse the comma separated `REDCAP_CONCURRENCY_STRINGS` format
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(','))
    }

    pub fn matches(&self, status: u16, body: &str) -> bool {
        if !CONFLICT_CANDIDATE_STATUSES.contains(&status) || body.is_empty() {
            return false;
        }
        let body = body.to_lowercase();
        self.0.iter().any(|signature| body.contains(signature.as_str()))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl Default for ConflictSignatures {
    fn default() -> Self {
        Self::new(Self::DEFAULTS)
    }
}
