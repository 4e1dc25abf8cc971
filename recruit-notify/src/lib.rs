//! Notification dispatch services
//!
//! `recruit-invite` sends invitations to participants with an assigned study
//! identifier; `recruit-ineligible` sends notices to participants screened
//! out. Both share [`NotificationService`] and differ only in
//! [`NotificationKind`].

pub mod cli;
pub mod service;
pub mod templates;

pub use service::{NotificationKind, NotificationService, SendOutcome};
pub use templates::Templates;
