//! Assignment service
//!
//! Per record:
//!
//! ```text
//! pending ──evaluate──┬─> ineligible              (status + reasons)
//!                     ├─> manual_review_required  (status + reasons)
//!                     └─> eligible ──assign──> eligible_id_assigned (identifier + status)
//! ```

use crate::identifier;
use async_trait::async_trait;
use recruit_common::config::{AssignmentConfig, TomlConfig};
use recruit_common::eligibility::EligibilityVerdict;
use recruit_common::model::{check_transition, join_reasons, RECORD_ID_FIELD};
use recruit_common::poller::{CycleSummary, PollService};
use recruit_common::store::{FieldUpdates, Filter, Predicate};
use recruit_common::{
    Category, Error, Evaluator, FieldDetector, Outcome, ParticipantRecord, ProcessingStatus,
    RawRecord, RecordStore, Result, Role,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Assigned { category: Category, identifier: String },
    Ineligible,
    ManualReview,
    /// No longer matches the poll criteria (changed since the query)
    Skipped,
}

impl RecordOutcome {
    fn counter(&self) -> &'static str {
        match self {
            RecordOutcome::Assigned {
                category: Category::HealthyControl,
                ..
            } => "assigned_hc",
            RecordOutcome::Assigned {
                category: Category::Mdd,
                ..
            } => "assigned_mdd",
            RecordOutcome::Ineligible => "ineligible",
            RecordOutcome::ManualReview => "manual_review",
            RecordOutcome::Skipped => "skipped",
        }
    }
}

/// Field names the poll filter is built from
struct PollFields {
    study_id: String,
    consent: String,
}

pub struct AssignmentService {
    store: Arc<dyn RecordStore>,
    detector: Arc<FieldDetector>,
    evaluator: Evaluator,
    assignment: AssignmentConfig,
    consent_value: String,
    startup_checked: AtomicBool,
}

impl AssignmentService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        detector: Arc<FieldDetector>,
        evaluator: Evaluator,
        assignment: AssignmentConfig,
    ) -> Self {
        let consent_value = evaluator.config().consent_value.clone();
        Self {
            store,
            detector,
            evaluator,
            assignment,
            consent_value,
            startup_checked: AtomicBool::new(false),
        }
    }

    pub fn from_config(
        store: Arc<dyn RecordStore>,
        detector: Arc<FieldDetector>,
        config: &TomlConfig,
    ) -> Self {
        Self::new(
            store,
            detector,
            Evaluator::from_config(config),
            config.assignment.clone(),
        )
    }

    /// Records awaiting evaluation: status blank or pending, no identifier,
    /// consent given
    fn poll_filter(&self, fields: &PollFields) -> Filter {
        self.status_filter()
            .blank(fields.study_id.as_str())
            .eq(fields.consent.as_str(), self.consent_value.as_str())
    }

    fn status_filter(&self) -> Filter {
        let status = &self.detector.tracking_fields().status;
        Filter::new().any_of(vec![
            Predicate::eq(status.as_str(), ""),
            Predicate::eq(status.as_str(), ProcessingStatus::Pending.as_str()),
        ])
    }

    fn poll_fields(&self, sample: Option<&RawRecord>) -> Result<PollFields> {
        Ok(PollFields {
            study_id: self.detector.require(&Role::STUDY_ID, sample)?,
            consent: self.detector.require(&Role::CONSENT, sample)?,
        })
    }

    /// Fetch records to process.
    ///
    /// With a data dictionary the full filter runs server-side. Without one,
    /// field names are detected from the first pending record and the rest of
    /// the filter is applied locally.
    async fn fetch_pending(&self) -> Result<Vec<RawRecord>> {
        if let Ok(fields) = self.poll_fields(None) {
            let filter = self.poll_filter(&fields);
            return Ok(self.store.query(&filter, &[]).await?);
        }

        let records = self.store.query(&self.status_filter(), &[]).await?;
        let Some(sample) = records.first() else {
            return Ok(records);
        };
        let fields = self.poll_fields(Some(sample))?;
        let filter = self.poll_filter(&fields);
        Ok(records.into_iter().filter(|r| filter.matches(r)).collect())
    }

    /// Evaluate one record and write the result
    pub async fn process_record(&self, record: &ParticipantRecord) -> Result<RecordOutcome> {
        let record_id = record.record_id.as_str();

        if record.processing_status() != Some(ProcessingStatus::Pending) || record.study_id().is_some() {
            debug!(record_id, status = %record.normalized.tracking.status_raw, "Record no longer pending, skipping");
            return Ok(RecordOutcome::Skipped);
        }

        let verdict = self.evaluator.evaluate(&record.normalized);
        note_survey_flag(record, verdict.outcome);
        match (verdict.outcome, verdict.category) {
            (Outcome::Eligible, Some(category)) => {
                let Some(identifier) = self.assign_identifier(record_id, category).await? else {
                    return Ok(RecordOutcome::Skipped);
                };
                info!(record_id, identifier = %identifier, category = %category, "Assigned study identifier");
                Ok(RecordOutcome::Assigned { category, identifier })
            }
            (Outcome::Ineligible, _) => {
                if !self.write_verdict(record_id, &verdict).await? {
                    return Ok(RecordOutcome::Skipped);
                }
                info!(record_id, reasons = %join_reasons(&verdict.reasons), "Record ineligible");
                Ok(RecordOutcome::Ineligible)
            }
            _ => {
                if !self.write_verdict(record_id, &verdict).await? {
                    return Ok(RecordOutcome::Skipped);
                }
                warn!(record_id, reasons = %join_reasons(&verdict.reasons), "Record requires manual review");
                Ok(RecordOutcome::ManualReview)
            }
        }
    }

    /// Write status and reasons. `false` if the record changed since it was
    /// polled and nothing was written.
    async fn write_verdict(&self, record_id: &str, verdict: &EligibilityVerdict) -> Result<bool> {
        let target = verdict.outcome.target_status();
        check_transition(record_id, ProcessingStatus::Pending, target)?;
        if !self.still_pending(record_id).await? {
            return Ok(false);
        }

        let tracking = self.detector.tracking_fields();
        let updates = FieldUpdates::from([
            (tracking.status.clone(), target.as_str().to_string()),
            (tracking.reasons.clone(), join_reasons(&verdict.reasons)),
        ]);
        self.store.update(record_id, &updates).await?;
        Ok(true)
    }

    /// Re-read the record's tracking fields right before a write. `false`
    /// once another writer has given it an identifier or moved it past
    /// pending, or the record is gone.
    async fn still_pending(&self, record_id: &str) -> Result<bool> {
        let status_field = self.detector.tracking_fields().status.clone();
        let study_id_field = self.detector.detect(&Role::STUDY_ID, None);
        let mut fields = vec![status_field];
        fields.extend(study_id_field.clone());

        let current = self
            .store
            .query(&Filter::new().eq(RECORD_ID_FIELD, record_id), &fields)
            .await?;
        let Some(record) = current.first() else {
            return Ok(false);
        };

        let pending = self.status_filter().matches(record)
            && study_id_field
                .map_or(true, |field| FieldDetector::value_of(record, &field).is_none());
        if !pending {
            debug!(record_id, "Record changed since it was polled, skipping");
        }
        Ok(pending)
    }

    /// Assign the next identifier in `category` to `record_id`.
    ///
    /// Each attempt re-reads the highest issued identifier, re-reads the
    /// record, then writes identifier and status in one update. `None` means
    /// the record already has an identifier or left pending in the meantime
    /// and nothing was written. A uniqueness conflict means another writer
    /// took the candidate first: back off and try again with a fresh
    /// candidate. When attempts run out the record is left unchanged.
    pub async fn assign_identifier(
        &self,
        record_id: &str,
        category: Category,
    ) -> Result<Option<String>> {
        check_transition(record_id, ProcessingStatus::Pending, ProcessingStatus::IdAssigned)?;

        let study_id_field = self.detector.require(&Role::STUDY_ID, None)?;
        let tracking = self.detector.tracking_fields();
        let max_attempts = self.assignment.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let candidate = self.next_identifier(category, &study_id_field).await?;
            if !self.still_pending(record_id).await? {
                return Ok(None);
            }

            let mut updates = FieldUpdates::from([
                (study_id_field.clone(), candidate.clone()),
                (
                    tracking.status.clone(),
                    ProcessingStatus::IdAssigned.as_str().to_string(),
                ),
            ]);
            if self.detector.has_field(&tracking.id_assigned_flag) {
                updates.insert(tracking.id_assigned_flag.clone(), "1".to_string());
            }

            match self.store.update(record_id, &updates).await {
                Ok(()) => return Ok(Some(candidate)),
                Err(e) if e.is_conflict() => {
                    warn!(
                        record_id,
                        candidate = %candidate,
                        attempt,
                        max_attempts,
                        "Identifier already taken by a concurrent assignment, retrying"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.assignment.conflict_backoff(attempt)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::ConflictRetriesExhausted {
            record_id: record_id.to_string(),
            attempts: max_attempts,
        })
    }

    async fn next_identifier(&self, category: Category, study_id_field: &str) -> Result<String> {
        let range = self.assignment.range(category);
        let issued = self
            .store
            .query(
                &Filter::new().not_blank(study_id_field),
                &[study_id_field.to_string()],
            )
            .await?;

        identifier::next_identifier(
            range,
            issued
                .iter()
                .filter_map(|r| FieldDetector::value_of(r, study_id_field)),
        )
        .ok_or_else(|| Error::RangeExhausted {
            category,
            end: range.end,
        })
    }

    fn log_compatibility(&self) {
        let report = self.detector.compatibility_report();
        report.log();
        for role in self.evaluator.criteria_roles() {
            if !report.detected.contains_key(&role) && report.schema_available {
                debug!(role = %role, "Criterion field not present, criterion will be skipped");
            }
        }
    }
}

/// The survey's own eligibility flag is informational; the evaluator decides.
/// Disagreements are logged so survey branching logic can be audited.
fn note_survey_flag(record: &ParticipantRecord, outcome: Outcome) {
    let Some(flag) = record.normalized.get(&Role::ELIGIBILITY_FLAG) else {
        return;
    };
    let survey_eligible = flag.trim() == "1";
    if survey_eligible != (outcome == Outcome::Eligible) {
        info!(
            record_id = %record.record_id,
            survey_flag = flag,
            outcome = ?outcome,
            "Survey eligibility flag disagrees with evaluation"
        );
    }
}

#[async_trait]
impl PollService for AssignmentService {
    fn name(&self) -> &'static str {
        "recruit-assign"
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary> {
        if !self.startup_checked.swap(true, Ordering::SeqCst) {
            self.detector.load_schema(self.store.as_ref()).await;
            self.log_compatibility();
        }

        let mut summary = CycleSummary::default();
        let records = self.fetch_pending().await?;
        summary.fetched = records.len();
        if !records.is_empty() {
            info!(count = records.len(), "Found records awaiting evaluation");
        }

        for raw in records {
            if cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            let Some(record) = self.detector.participant(raw) else {
                warn!("Skipping record without a record id");
                summary.bump("skipped");
                continue;
            };

            match self.process_record(&record).await {
                Ok(outcome) => summary.bump(outcome.counter()),
                Err(e) if e.is_record_scoped() => {
                    error!(record_id = %record.record_id, error = %e, "Failed to process record");
                    summary.bump("failed");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }
}
