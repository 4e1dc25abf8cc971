//! Identifier assignment service
//!
//! Polls for consented, unprocessed records, evaluates eligibility, and
//! either records the verdict or assigns the next study identifier in the
//! participant's category. Identifier uniqueness is enforced by the record
//! store; this service retries with a fresh candidate when its write loses a
//! race against another instance.

pub mod assigner;
pub mod identifier;
pub mod stats;

pub use assigner::{AssignmentService, RecordOutcome};
pub use stats::{collect_statistics, Statistics};
