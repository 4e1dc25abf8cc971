//! Record store abstraction
//!
//! The remote store (REDCap) is the only durable owner of participant state.
//! Services read with server-side filters, write partial updates, and fetch
//! the data dictionary for field detection. Nothing is mirrored locally.

mod error;
mod filter;
pub mod redcap;
mod retry;

#[cfg(any(test, feature = "test-support"))]
pub mod memory;

pub use error::{ConflictSignatures, ErrorClass, StoreError, TRANSIENT_STATUSES};
pub use filter::{Clause, Filter, Predicate};
pub use redcap::RedcapClient;
pub use retry::{with_retry, RetryPolicy};

use crate::model::RawRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partial update: field -> new value. Fields not listed are left untouched.
pub type FieldUpdates = BTreeMap<String, String>;

/// One entry of the REDCap data dictionary (`content=metadata` export)
///
/// Only the columns field detection looks at are kept; everything else in
/// the export is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub field_name: String,
    #[serde(default)]
    pub form_name: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(default)]
    pub field_label: String,
    #[serde(default)]
    pub field_note: String,
    #[serde(default)]
    pub select_choices_or_calculations: String,
    #[serde(default)]
    pub text_validation_type_or_show_slider_number: String,
}

impl FieldMetadata {
    pub fn new(field_name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            form_name: String::new(),
            field_type: field_type.into(),
            field_label: String::new(),
            field_note: String::new(),
            select_choices_or_calculations: String::new(),
            text_validation_type_or_show_slider_number: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.field_label = label.into();
        self
    }

    pub fn with_validation(mut self, validation: impl Into<String>) -> Self {
        self.text_validation_type_or_show_slider_number = validation.into();
        self
    }

    pub fn with_choices(mut self, choices: impl Into<String>) -> Self {
        self.select_choices_or_calculations = choices.into();
        self
    }

    /// Validation type (REDCap packs it into the slider column for text fields)
    pub fn validation(&self) -> &str {
        &self.text_validation_type_or_show_slider_number
    }
}

/// Record-read / record-write interface consumed by every service
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Export records matching `filter`. An empty `fields` slice exports all fields.
    ///
    /// Result order is unspecified.
    async fn query(&self, filter: &Filter, fields: &[String]) -> Result<Vec<RawRecord>, StoreError>;

    /// Partial update of one record. Atomic per record on the remote side.
    async fn update(&self, record_id: &str, updates: &FieldUpdates) -> Result<(), StoreError>;

    /// Fetch the data dictionary
    async fn fetch_schema(&self) -> Result<Vec<FieldMetadata>, StoreError>;
}
