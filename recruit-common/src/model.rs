//! Participant model and processing status state machine
//!
//! REDCap is the single source of truth for everything here. Nothing in this
//! module is persisted locally; a [`ParticipantRecord`] is rebuilt from the
//! raw export on every read.

use crate::detector::Role;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Raw REDCap record: external field name -> value (always a string on export)
pub type RawRecord = BTreeMap<String, String>;

/// REDCap field holding the primary key of every record
pub const RECORD_ID_FIELD: &str = "record_id";

/// Separator used when ineligibility reasons are stored in a single text field
pub const REASON_SEPARATOR: &str = "; ";

// ============================================================================
// Processing status
// ============================================================================

/// Pipeline processing status stored in the `pipeline_processing_status` field
///
/// Forward-only lifecycle:
///
/// ```text
/// pending ─┬─> eligible_id_assigned ──> eligible_invited
///          ├─> ineligible ────────────> ineligible_notified
///          └─> manual_review_required
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    #[serde(rename = "eligible_id_assigned")]
    IdAssigned,
    Ineligible,
    ManualReviewRequired,
    #[serde(rename = "eligible_invited")]
    Invited,
    IneligibleNotified,
}

impl ProcessingStatus {
    /// Value written to the REDCap dropdown
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::IdAssigned => "eligible_id_assigned",
            ProcessingStatus::Ineligible => "ineligible",
            ProcessingStatus::ManualReviewRequired => "manual_review_required",
            ProcessingStatus::Invited => "eligible_invited",
            ProcessingStatus::IneligibleNotified => "ineligible_notified",
        }
    }

    /// Parse a stored value. An empty field means the record was never processed.
    ///
    /// Returns `None` for values this pipeline does not own (e.g. set by hand
    /// or by another tool); such records are never touched.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim() {
            "" | "pending" => Some(ProcessingStatus::Pending),
            "eligible_id_assigned" => Some(ProcessingStatus::IdAssigned),
            "ineligible" => Some(ProcessingStatus::Ineligible),
            "manual_review_required" => Some(ProcessingStatus::ManualReviewRequired),
            "eligible_invited" => Some(ProcessingStatus::Invited),
            "ineligible_notified" => Some(ProcessingStatus::IneligibleNotified),
            _ => None,
        }
    }

    /// Position in the lifecycle (0 = untouched, 2 = terminal notification step)
    pub fn stage(&self) -> u8 {
        match self {
            ProcessingStatus::Pending => 0,
            ProcessingStatus::IdAssigned
            | ProcessingStatus::Ineligible
            | ProcessingStatus::ManualReviewRequired => 1,
            ProcessingStatus::Invited | ProcessingStatus::IneligibleNotified => 2,
        }
    }

    /// Whether a service may move a record from `self` to `next`
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, IdAssigned)
                | (Pending, Ineligible)
                | (Pending, ManualReviewRequired)
                | (IdAssigned, Invited)
                | (Ineligible, IneligibleNotified)
        )
    }
}

/// Guard for every status write: `from -> to` must be an allowed transition
pub fn check_transition(
    record_id: &str,
    from: ProcessingStatus,
    to: ProcessingStatus,
) -> crate::Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(crate::Error::InvalidTransition {
            record_id: record_id.to_string(),
            from,
            to,
        })
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Category
// ============================================================================

/// Study arm a participant is assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    /// Healthy control
    #[serde(rename = "HC")]
    HealthyControl,
    /// Major depressive disorder (clinical arm)
    #[serde(rename = "MDD")]
    Mdd,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::HealthyControl, Category::Mdd];

    /// Short code used as identifier prefix
    pub fn code(&self) -> &'static str {
        match self {
            Category::HealthyControl => "HC",
            Category::Mdd => "MDD",
        }
    }

    /// Human readable arm name
    pub fn label(&self) -> &'static str {
        match self {
            Category::HealthyControl => "Healthy Control",
            Category::Mdd => "MDD Participant",
        }
    }

    /// Interpret a free-text arm value from a survey field
    pub fn from_arm_value(value: &str) -> Option<Self> {
        let lower = value.trim().to_ascii_lowercase();
        match lower.as_str() {
            "hc" | "healthy" | "control" | "healthy_control" | "healthy control" => {
                Some(Category::HealthyControl)
            }
            "mdd" | "depression" | "clinical" | "mdd_participant" => Some(Category::Mdd),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// Records
// ============================================================================

/// Pipeline bookkeeping fields copied through from the raw record.
///
/// Each has a documented default used when the project lacks the field, so a
/// data dictionary without optional tracking fields degrades instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracking {
    /// Parsed status; default `pending` when the field is absent or empty
    pub processing_status: Option<ProcessingStatus>,
    /// Stored status text, kept for logging unknown values
    pub status_raw: String,
    /// Default: empty list
    pub ineligibility_reasons: Vec<String>,
    /// Default: none
    pub invitation_sent_at: Option<String>,
    /// Default: none
    pub ineligible_notified_at: Option<String>,
    /// Alert flag set alongside identifier assignment; default `"0"`
    pub id_assigned: String,
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            processing_status: Some(ProcessingStatus::Pending),
            status_raw: String::new(),
            ineligibility_reasons: Vec::new(),
            invitation_sent_at: None,
            ineligible_notified_at: None,
            id_assigned: "0".to_string(),
        }
    }
}

/// Record translated from external field names into semantic roles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub record_id: String,
    /// Role -> trimmed, non-empty value
    pub roles: BTreeMap<Role, String>,
    pub tracking: Tracking,
}

impl NormalizedRecord {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            roles: BTreeMap::new(),
            tracking: Tracking::default(),
        }
    }

    /// Builder used heavily by tests and by callers that already know values
    pub fn with(mut self, role: Role, value: impl Into<String>) -> Self {
        self.set(role, value);
        self
    }

    /// Set a role value; blank values are treated as absent
    pub fn set(&mut self, role: Role, value: impl Into<String>) {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.roles.remove(&role);
        } else {
            self.roles.insert(role, trimmed.to_string());
        }
    }

    pub fn get(&self, role: &Role) -> Option<&str> {
        self.roles.get(role).map(String::as_str)
    }
}

/// One survey submission as seen by a service during a single poll cycle
#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    pub record_id: String,
    pub raw_fields: RawRecord,
    pub normalized: NormalizedRecord,
}

impl ParticipantRecord {
    pub fn processing_status(&self) -> Option<ProcessingStatus> {
        self.normalized.tracking.processing_status
    }

    pub fn study_id(&self) -> Option<&str> {
        self.normalized.get(&Role::STUDY_ID)
    }

    pub fn email(&self) -> Option<&str> {
        self.normalized.get(&Role::EMAIL)
    }

    pub fn ineligibility_reasons(&self) -> &[String] {
        &self.normalized.tracking.ineligibility_reasons
    }
}

/// Join reasons for storage in a single REDCap text field
pub fn join_reasons(reasons: &[String]) -> String {
    reasons.join(REASON_SEPARATOR)
}

/// Split a stored reasons field back into individual reasons
pub fn split_reasons(stored: &str) -> Vec<String> {
    stored
        .split(';')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_round_trip_and_empty_is_pending() {
        assert_eq!(ProcessingStatus::from_wire(""), Some(ProcessingStatus::Pending));
        assert_eq!(ProcessingStatus::from_wire("  "), Some(ProcessingStatus::Pending));
        assert_eq!(
            ProcessingStatus::from_wire("eligible_invited"),
            Some(ProcessingStatus::Invited)
        );
        assert_eq!(ProcessingStatus::from_wire("scheduled_by_hand"), None);
    }

    #[test]
    fn test_transitions_are_forward_only() {
        use ProcessingStatus::*;
        let all = [
            Pending,
            IdAssigned,
            Ineligible,
            ManualReviewRequired,
            Invited,
            IneligibleNotified,
        ];
        for from in all {
            for to in all {
                if from.can_transition_to(to) {
                    assert!(to.stage() > from.stage(), "{from} -> {to} is not forward");
                }
            }
        }
        assert!(!Invited.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Invited));
        assert!(!ManualReviewRequired.can_transition_to(IdAssigned));
    }

    #[test]
    fn test_check_transition_rejects_backwards_write() {
        assert!(check_transition("1", ProcessingStatus::Pending, ProcessingStatus::Ineligible).is_ok());
        let err = check_transition("1", ProcessingStatus::Invited, ProcessingStatus::IdAssigned)
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidTransition { .. }));
    }

    #[test]
    fn test_category_from_arm_value() {
        assert_eq!(Category::from_arm_value("Healthy"), Some(Category::HealthyControl));
        assert_eq!(Category::from_arm_value(" MDD "), Some(Category::Mdd));
        assert_eq!(Category::from_arm_value("unknown"), None);
    }

    #[test]
    fn test_reasons_join_and_split() {
        let reasons = vec![
            "did not consent".to_string(),
            "Unable to travel to study visits".to_string(),
        ];
        let stored = join_reasons(&reasons);
        assert_eq!(stored, "did not consent; Unable to travel to study visits");
        assert_eq!(split_reasons(&stored), reasons);
        assert!(split_reasons("  ").is_empty());
    }

    #[test]
    fn test_normalized_record_ignores_blank_values() {
        let record = NormalizedRecord::new("1")
            .with(Role::EMAIL, "  ")
            .with(Role::AGE, " 30 ");
        assert_eq!(record.get(&Role::EMAIL), None);
        assert_eq!(record.get(&Role::AGE), Some("30"));
    }
}
