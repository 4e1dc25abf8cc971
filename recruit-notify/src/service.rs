//! Notification dispatch service
//!
//! One state machine, two instantiations:
//!
//! ```text
//! eligible_id_assigned ──send invite──> eligible_invited     (+ invitation_sent_at)
//! ineligible ──────────send notice──> ineligible_notified   (+ ineligible_notified_at)
//! ```
//!
//! A failed send leaves the record untouched; the next cycle picks it up
//! again. No in-process retry.

use crate::templates::Templates;
use async_trait::async_trait;
use recruit_common::config::{TomlConfig, TrackingFields};
use recruit_common::model::check_transition;
use recruit_common::poller::{CycleSummary, PollService};
use recruit_common::store::FieldUpdates;
use recruit_common::time::redcap_timestamp;
use recruit_common::{
    EmailMessage, Evaluator, FieldDetector, Filter, Notifier, ParticipantRecord,
    ProcessingStatus, RawRecord, RecordStore, Result, Role,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Invite,
    IneligibleNotice,
}

impl NotificationKind {
    /// Status a record must hold to be picked up
    pub fn trigger(&self) -> ProcessingStatus {
        match self {
            NotificationKind::Invite => ProcessingStatus::IdAssigned,
            NotificationKind::IneligibleNotice => ProcessingStatus::Ineligible,
        }
    }

    /// Status written after a successful send
    pub fn next(&self) -> ProcessingStatus {
        match self {
            NotificationKind::Invite => ProcessingStatus::Invited,
            NotificationKind::IneligibleNotice => ProcessingStatus::IneligibleNotified,
        }
    }

    pub fn timestamp_field<'a>(&self, tracking: &'a TrackingFields) -> &'a str {
        match self {
            NotificationKind::Invite => &tracking.invitation_sent_at,
            NotificationKind::IneligibleNotice => &tracking.ineligible_notified_at,
        }
    }

    pub fn service_name(&self) -> &'static str {
        match self {
            NotificationKind::Invite => "recruit-invite",
            NotificationKind::IneligibleNotice => "recruit-ineligible",
        }
    }

    fn sent_at<'a>(&self, record: &'a ParticipantRecord) -> Option<&'a str> {
        let tracking = &record.normalized.tracking;
        match self {
            NotificationKind::Invite => tracking.invitation_sent_at.as_deref(),
            NotificationKind::IneligibleNotice => tracking.ineligible_notified_at.as_deref(),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Invite => write!(f, "invitation"),
            NotificationKind::IneligibleNotice => write!(f, "ineligibility notice"),
        }
    }
}

/// What happened to one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { to: String },
    /// Record no longer matches the trigger, or lacks data needed to send
    Skipped,
}

pub struct NotificationService {
    kind: NotificationKind,
    store: Arc<dyn RecordStore>,
    detector: Arc<FieldDetector>,
    notifier: Arc<dyn Notifier>,
    templates: Templates,
    evaluator: Evaluator,
    dry_run: bool,
    startup_checked: AtomicBool,
}

impl NotificationService {
    pub fn new(
        kind: NotificationKind,
        store: Arc<dyn RecordStore>,
        detector: Arc<FieldDetector>,
        notifier: Arc<dyn Notifier>,
        templates: Templates,
        evaluator: Evaluator,
    ) -> Self {
        Self {
            kind,
            store,
            detector,
            notifier,
            templates,
            evaluator,
            dry_run: false,
            startup_checked: AtomicBool::new(false),
        }
    }

    /// Leave records untouched after sending, so a dry run can be repeated
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn from_config(
        kind: NotificationKind,
        store: Arc<dyn RecordStore>,
        detector: Arc<FieldDetector>,
        notifier: Arc<dyn Notifier>,
        config: &TomlConfig,
    ) -> Self {
        Self::new(
            kind,
            store,
            detector,
            notifier,
            Templates::from_config(&config.notify),
            Evaluator::from_config(config),
        )
    }

    pub fn kind(&self) -> NotificationKind {
        self.kind
    }

    /// Trigger status, not yet sent
    fn trigger_filter(&self) -> Filter {
        let tracking = self.detector.tracking_fields();
        Filter::new()
            .eq(tracking.status.as_str(), self.kind.trigger().as_str())
            .blank(self.kind.timestamp_field(tracking))
    }

    /// Same shape as the assigner: server-side filter when the email field is
    /// known up front, otherwise detect from the first record and filter locally
    async fn fetch_due(&self) -> Result<Vec<RawRecord>> {
        if let Some(email) = self.detector.detect(&Role::EMAIL, None) {
            let filter = self.trigger_filter().not_blank(email);
            return Ok(self.store.query(&filter, &[]).await?);
        }

        let records = self.store.query(&self.trigger_filter(), &[]).await?;
        let Some(sample) = records.first() else {
            return Ok(records);
        };
        let email = self.detector.require(&Role::EMAIL, Some(sample))?;
        let filter = Filter::new().not_blank(email);
        Ok(records.into_iter().filter(|r| filter.matches(r)).collect())
    }

    fn compose(&self, record: &ParticipantRecord, to: &str) -> Option<EmailMessage> {
        match self.kind {
            NotificationKind::Invite => {
                let study_id = record.study_id()?;
                let category = self.evaluator.classify(&record.normalized);
                Some(self.templates.invite(to, study_id, category))
            }
            NotificationKind::IneligibleNotice => Some(
                self.templates
                    .ineligible_notice(to, record.ineligibility_reasons()),
            ),
        }
    }

    /// Send the message for one record and advance its status
    pub async fn process_record(&self, record: &ParticipantRecord) -> Result<SendOutcome> {
        let record_id = record.record_id.as_str();
        let trigger = self.kind.trigger();

        if record.processing_status() != Some(trigger) || self.kind.sent_at(record).is_some() {
            debug!(record_id, status = %record.normalized.tracking.status_raw, "Record no longer due, skipping");
            return Ok(SendOutcome::Skipped);
        }
        check_transition(record_id, trigger, self.kind.next())?;

        let Some(to) = record.email() else {
            warn!(record_id, "Record has no email address, skipping");
            return Ok(SendOutcome::Skipped);
        };
        let Some(message) = self.compose(record, to) else {
            warn!(record_id, "Record has no study identifier, cannot compose invitation");
            return Ok(SendOutcome::Skipped);
        };

        if let Err(e) = self.notifier.send(&message).await {
            warn!(record_id, error = %e, "Failed to send {}, will retry next cycle", self.kind);
            return Err(e.into());
        }

        if self.dry_run {
            info!(record_id, status = %self.kind.next(), "Dry run: record not updated");
            return Ok(SendOutcome::Sent { to: to.to_string() });
        }

        let tracking = self.detector.tracking_fields();
        let updates = FieldUpdates::from([
            (
                self.kind.timestamp_field(tracking).to_string(),
                redcap_timestamp(),
            ),
            (tracking.status.clone(), self.kind.next().as_str().to_string()),
        ]);
        if let Err(e) = self.store.update(record_id, &updates).await {
            error!(
                record_id,
                error = %e,
                "{} sent but record update failed; the next cycle may send it again",
                self.kind
            );
            return Err(e.into());
        }

        info!(record_id, notifier = self.notifier.name(), "Sent {}", self.kind);
        Ok(SendOutcome::Sent { to: to.to_string() })
    }
}

#[async_trait]
impl PollService for NotificationService {
    fn name(&self) -> &'static str {
        self.kind.service_name()
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary> {
        if !self.startup_checked.swap(true, Ordering::SeqCst) {
            self.detector.load_schema(self.store.as_ref()).await;
            self.detector.compatibility_report().log();
        }

        let mut summary = CycleSummary::default();
        let records = self.fetch_due().await?;
        summary.fetched = records.len();
        if !records.is_empty() {
            info!(count = records.len(), "Found records awaiting {}", self.kind);
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
                Ok(SendOutcome::Sent { .. }) => summary.bump("sent"),
                Ok(SendOutcome::Skipped) => summary.bump("skipped"),
                Err(e) if e.is_record_scoped() => summary.bump("failed"),
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }
}

