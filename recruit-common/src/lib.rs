//! # Recruitment Pipeline Common Library
//!
//! Shared code for the recruitment pipeline services:
//! - Participant model and processing status state machine
//! - Record store abstraction and the REDCap API client
//! - Field detection over an evolving REDCap data dictionary
//! - Eligibility evaluation
//! - Notification capability
//! - Configuration loading, logging setup and the poll loop runner

pub mod config;
pub mod detector;
pub mod eligibility;
pub mod error;
pub mod logging;
pub mod model;
pub mod notify;
pub mod poller;
pub mod store;
pub mod time;

pub use config::TomlConfig;
pub use detector::{FieldDetector, Role};
pub use eligibility::{EligibilityVerdict, Evaluator, Outcome};
pub use error::{Error, Result};
pub use model::{Category, NormalizedRecord, ParticipantRecord, ProcessingStatus, RawRecord};
pub use notify::{EmailMessage, Notifier, NotifyError};
pub use poller::{CycleSummary, PollService};
pub use store::{Filter, RecordStore, StoreError};
