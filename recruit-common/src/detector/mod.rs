//! Field detection
//!
//! Maps semantic roles (email, age, consent, ...) to the REDCap fields that
//! hold them, so the services keep working when survey instruments are
//! renamed or versioned. Resolution order for a role:
//!
//! 1. explicit override (`[fields.overrides]` or `RECRUIT_FIELD_<ROLE>`)
//! 2. rule match against the data dictionary, computed once per process
//! 3. rule match against the keys of a sample record, when no dictionary
//!    could be fetched

mod rules;

pub use rules::{CompiledRule, FieldRule, RuleTable};

use crate::config::{FieldConfig, TrackingFields};
use crate::error::{Error, Result};
use crate::model::{
    split_reasons, NormalizedRecord, ParticipantRecord, ProcessingStatus, RawRecord, Tracking,
    RECORD_ID_FIELD,
};
use crate::store::{FieldMetadata, RecordStore};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::OnceCell;

/// Suffix REDCap projects use when an instrument field is re-issued
const VERSION_SUFFIX: &str = "_v2";

// ============================================================================
// Role
// ============================================================================

/// Semantic meaning of a field, independent of its REDCap name.
///
/// The core roles have constants; criteria roles (exclusion flags and the
/// like) are open-ended and named in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const EMAIL: Role = Role(Cow::Borrowed("email"));
    pub const AGE: Role = Role(Cow::Borrowed("age"));
    pub const CONSENT: Role = Role(Cow::Borrowed("consent"));
    pub const ASSESSMENT_SCORE: Role = Role(Cow::Borrowed("assessment_score"));
    pub const ELIGIBILITY_FLAG: Role = Role(Cow::Borrowed("eligibility_flag"));
    pub const STUDY_ID: Role = Role(Cow::Borrowed("study_id"));
    pub const STUDY_ARM: Role = Role(Cow::Borrowed("study_arm"));

    /// Roles every participant record must carry before it can be evaluated
    pub const REQUIRED: [Role; 3] = [Role::EMAIL, Role::AGE, Role::CONSENT];

    pub fn new(name: impl AsRef<str>) -> Self {
        Role(Cow::Owned(name.as_ref().trim().to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Environment variable that overrides this role's field name
    pub fn env_var(&self) -> String {
        format!("RECRUIT_FIELD_{}", self.0.to_ascii_uppercase())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Role::new)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Detector
// ============================================================================

/// Detection outcome per role, for startup diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompatibilityReport {
    pub schema_available: bool,
    pub detected: BTreeMap<Role, String>,
    pub undetected: Vec<Role>,
    /// Tracking fields the dictionary lacks; their defaults will be used
    pub missing_tracking_fields: Vec<String>,
}

impl CompatibilityReport {
    pub fn log(&self) {
        tracing::info!(
            schema_available = self.schema_available,
            detected = self.detected.len(),
            undetected = self.undetected.len(),
            "Field compatibility check"
        );
        for (role, field) in &self.detected {
            tracing::info!(role = %role, field = %field, "Field detected");
        }
        for role in &self.undetected {
            tracing::warn!(role = %role, "No field detected for role");
        }
        for field in &self.missing_tracking_fields {
            tracing::warn!(field = %field, "Tracking field missing from data dictionary, defaults apply");
        }
    }
}

/// Resolves roles to field names and normalizes raw records
pub struct FieldDetector {
    rules: RuleTable,
    overrides: BTreeMap<Role, String>,
    tracking: TrackingFields,
    schema: OnceCell<Option<Vec<FieldMetadata>>>,
    cache: Mutex<HashMap<Role, Option<String>>>,
    computations: AtomicUsize,
}

impl FieldDetector {
    pub fn new(rules: RuleTable, overrides: BTreeMap<Role, String>, tracking: TrackingFields) -> Self {
        Self {
            rules,
            overrides,
            tracking,
            schema: OnceCell::new(),
            cache: Mutex::new(HashMap::new()),
            computations: AtomicUsize::new(0),
        }
    }

    /// Detector with the configured (or built-in) rules and overrides
    pub fn from_config(config: &FieldConfig) -> Result<Self> {
        let rules = match &config.rules_path {
            Some(path) => RuleTable::load(path)?,
            None => RuleTable::builtin()?,
        };
        let overrides = config
            .overrides
            .iter()
            .filter(|(_, field)| !field.trim().is_empty())
            .map(|(role, field)| (Role::new(role), field.trim().to_string()))
            .collect();
        Ok(Self::new(rules, overrides, config.tracking.clone()))
    }

    /// Fetch the data dictionary once. On failure the detector stays in
    /// record-key fallback mode for the life of the process.
    pub async fn load_schema(&self, store: &dyn RecordStore) {
        self.schema
            .get_or_init(|| async {
                match store.fetch_schema().await {
                    Ok(schema) if !schema.is_empty() => {
                        tracing::info!(fields = schema.len(), "Loaded REDCap data dictionary");
                        Some(schema)
                    }
                    Ok(_) => {
                        tracing::warn!("REDCap data dictionary is empty, detecting from record keys");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not fetch data dictionary, detecting from record keys");
                        None
                    }
                }
            })
            .await;
    }

    /// Install a dictionary directly. Ignored if one is already loaded.
    pub fn set_schema(&self, schema: Vec<FieldMetadata>) {
        let _ = self.schema.set(Some(schema));
    }

    pub fn schema(&self) -> Option<&[FieldMetadata]> {
        self.schema.get().and_then(|s| s.as_deref())
    }

    pub fn tracking_fields(&self) -> &TrackingFields {
        &self.tracking
    }

    /// Field name for `role`, or `None` if nothing matches.
    ///
    /// Dictionary-based results (including "not found") are memoized. In
    /// fallback mode only successful matches are memoized, since a later
    /// record may carry the field.
    pub fn detect(&self, role: &Role, sample: Option<&RawRecord>) -> Option<String> {
        if let Some(field) = self.overrides.get(role) {
            return Some(field.clone());
        }
        if let Some(cached) = lock(&self.cache).get(role) {
            return cached.clone();
        }
        let rule = self.rules.get(role)?;

        match self.schema() {
            Some(schema) => {
                self.computations.fetch_add(1, Ordering::SeqCst);
                let found = rule
                    .select(schema, &self.tracking.all())
                    .map(|f| f.field_name.clone());
                match &found {
                    Some(field) => tracing::debug!(role = %role, field = %field, "Detected field from dictionary"),
                    None => tracing::debug!(role = %role, "No dictionary field matches role"),
                }
                lock(&self.cache).insert(role.clone(), found.clone());
                found
            }
            None => {
                let sample = sample?;
                self.computations.fetch_add(1, Ordering::SeqCst);
                let found = rule
                    .select_name(sample.keys().map(String::as_str), &self.tracking.all())
                    .map(str::to_string);
                if let Some(field) = &found {
                    tracing::debug!(role = %role, field = %field, "Detected field from record keys");
                    lock(&self.cache).insert(role.clone(), found.clone());
                }
                found
            }
        }
    }

    /// Like [`detect`](Self::detect), but a missing field is an error
    pub fn require(&self, role: &Role, sample: Option<&RawRecord>) -> Result<String> {
        self.detect(role, sample)
            .ok_or_else(|| Error::FieldNotDetected(role.clone()))
    }

    /// Number of rule evaluations performed so far (memoization diagnostics)
    pub fn detections_computed(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    /// Whether the dictionary declares `field`. False when no dictionary is loaded.
    pub fn has_field(&self, field: &str) -> bool {
        self.schema()
            .map(|schema| schema.iter().any(|f| f.field_name == field))
            .unwrap_or(false)
    }

    /// Non-blank value of `field`, falling back to its `_v2` re-issue
    pub fn value_of<'a>(record: &'a RawRecord, field: &str) -> Option<&'a str> {
        let non_blank = |name: &str| {
            record
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        non_blank(field).or_else(|| non_blank(&format!("{field}{VERSION_SUFFIX}")))
    }

    /// Translate a raw record into roles plus tracking fields
    pub fn normalize(&self, raw: &RawRecord) -> NormalizedRecord {
        let record_id = raw.get(RECORD_ID_FIELD).cloned().unwrap_or_default();
        let mut normalized = NormalizedRecord::new(record_id);

        for role in self.all_roles() {
            if let Some(field) = self.detect(&role, Some(raw)) {
                if let Some(value) = Self::value_of(raw, &field) {
                    normalized.set(role, value);
                }
            }
        }

        normalized.tracking = self.tracking_of(raw);
        normalized
    }

    /// Build the per-cycle view of a record. `None` if it has no record id.
    pub fn participant(&self, raw: RawRecord) -> Option<ParticipantRecord> {
        let record_id = raw
            .get(RECORD_ID_FIELD)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;
        let normalized = self.normalize(&raw);
        Some(ParticipantRecord {
            record_id,
            raw_fields: raw,
            normalized,
        })
    }

    /// Detection status for every known role, plus tracking field presence
    pub fn compatibility_report(&self) -> CompatibilityReport {
        let mut report = CompatibilityReport {
            schema_available: self.schema().is_some(),
            ..Default::default()
        };
        for role in self.all_roles() {
            match self.detect(&role, None) {
                Some(field) => {
                    report.detected.insert(role, field);
                }
                None => report.undetected.push(role),
            }
        }
        if report.schema_available {
            report.missing_tracking_fields = self
                .tracking
                .all()
                .into_iter()
                .filter(|f| !self.has_field(f))
                .map(str::to_string)
                .collect();
        }
        report
    }

    fn all_roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.rules.roles().cloned().collect();
        for role in self.overrides.keys() {
            if !roles.contains(role) {
                roles.push(role.clone());
            }
        }
        roles
    }

    fn tracking_of(&self, raw: &RawRecord) -> Tracking {
        let fields = &self.tracking;
        let mut tracking = Tracking::default();

        if let Some(status) = raw.get(&fields.status) {
            tracking.status_raw = status.trim().to_string();
            tracking.processing_status = ProcessingStatus::from_wire(status);
        }
        if let Some(reasons) = raw.get(&fields.reasons) {
            tracking.ineligibility_reasons = split_reasons(reasons);
        }
        tracking.invitation_sent_at = Self::value_of(raw, &fields.invitation_sent_at).map(str::to_string);
        tracking.ineligible_notified_at =
            Self::value_of(raw, &fields.ineligible_notified_at).map(str::to_string);
        if let Some(flag) = Self::value_of(raw, &fields.id_assigned_flag) {
            tracking.id_assigned = flag.to_string();
        }
        tracking
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
