//! Configuration loading
//!
//! Every service reads the same TOML file. All settings have built-in
//! defaults, so a missing file is a warning rather than an error.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (handled by each binary)
//! 2. Environment variables (`REDCAP_API_URL`, `REDCAP_API_TOKEN`, ...)
//! 3. TOML configuration file
//! 4. Built-in defaults

use crate::eligibility::{CodedExclusion, ExclusionCriterion, InclusionCriterion};
use crate::error::{Error, Result};
use crate::model::Category;
use crate::store::{ConflictSignatures, RetryPolicy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Config file used when neither `--config` nor `RECRUIT_CONFIG` is given
pub const DEFAULT_CONFIG_PATH: &str = "recruit.toml";

/// Prefix of per-role field override variables (`RECRUIT_FIELD_EMAIL=...`)
pub const FIELD_OVERRIDE_ENV_PREFIX: &str = "RECRUIT_FIELD_";

/// Full configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub redcap: RedcapConfig,
    pub retry: RetryConfig,
    pub fields: FieldConfig,
    pub eligibility: EligibilityConfig,
    pub assignment: AssignmentConfig,
    pub notify: NotifyConfig,
    pub poll: PollConfig,
    pub logging: LoggingConfig,
}

impl TomlConfig {
    /// Load from `path` (defaults if the file does not exist), then apply
    /// environment overrides. A path that cannot be checked is an error, not
    /// a missing file. Reporting a missing file is left to the caller, which
    /// has logging set up by then.
    pub async fn load(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path).await.map_err(|e| {
            Error::Config(format!("Cannot access config file {:?}: {}", path, e))
        })?;
        let mut config = if exists {
            let toml_str = tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::Config(format!("Failed to read config file {:?}: {}", path, e))
            })?;
            let config = Self::from_toml_str(&toml_str)?;
            info!("Loaded TOML configuration from {:?}", path);
            config
        } else {
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok(), std::env::vars());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Apply environment overrides. `get` looks up a single variable and
    /// `all` enumerates variables for the field override prefix.
    pub fn apply_env<G, I>(&mut self, get: G, all: I)
    where
        G: Fn(&str) -> Option<String>,
        I: IntoIterator<Item = (String, String)>,
    {
        let get = |name: &str| get(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("REDCAP_API_URL") {
            self.redcap.api_url = Some(url);
        }
        if let Some(token) = get("REDCAP_API_TOKEN") {
            self.redcap.api_token = Some(token);
        }
        if let Some(csv) = get("REDCAP_CONCURRENCY_STRINGS") {
            self.redcap.conflict_signatures = csv
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(endpoint) = get("RECRUIT_NOTIFY_URL") {
            self.notify.endpoint = Some(endpoint);
        }
        if let Some(token) = get("RECRUIT_NOTIFY_TOKEN") {
            self.notify.token = Some(token);
        }

        for (name, value) in all {
            let Some(role) = name.strip_prefix(FIELD_OVERRIDE_ENV_PREFIX) else {
                continue;
            };
            if role.is_empty() || value.trim().is_empty() {
                continue;
            }
            self.fields
                .overrides
                .insert(role.to_ascii_lowercase(), value.trim().to_string());
        }
    }

    /// Consistency checks that do not need the network
    pub fn validate(&self) -> Result<()> {
        self.assignment.validate()?;
        self.eligibility.validate()?;
        if self.poll.interval_secs == 0 {
            return Err(Error::Config("poll.interval_secs must be at least 1".into()));
        }
        Ok(())
    }
}

/// Resolve the config file path (CLI/env value, else the default)
pub fn resolve_config_path(cli_value: Option<PathBuf>) -> PathBuf {
    cli_value.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ============================================================================
// REDCap connection
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedcapConfig {
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    /// Per-request HTTP timeout
    pub timeout_secs: u64,
    /// Error-body substrings that identify a uniqueness violation
    pub conflict_signatures: Vec<String>,
}

impl Default for RedcapConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            timeout_secs: 30,
            conflict_signatures: ConflictSignatures::DEFAULTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RedcapConfig {
    /// URL and token, both required to talk to REDCap
    pub fn credentials(&self) -> Result<(&str, &str)> {
        let url = self
            .api_url
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::Config("REDCap API URL is not configured (REDCAP_API_URL)".into()))?;
        let token = self
            .api_token
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                Error::Config("REDCap API token is not configured (REDCAP_API_TOKEN)".into())
            })?;
        Ok((url, token))
    }

    pub fn signatures(&self) -> ConflictSignatures {
        ConflictSignatures::new(&self.conflict_signatures)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

// ============================================================================
// Field detection
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    /// Replacement detection rules file (TOML, `[[rule]]` tables)
    pub rules_path: Option<PathBuf>,
    /// Role -> field name; bypasses detection
    pub overrides: BTreeMap<String, String>,
    pub tracking: TrackingFields,
}

/// Names of the pipeline's own bookkeeping fields
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TrackingFields {
    pub status: String,
    pub reasons: String,
    pub invitation_sent_at: String,
    pub ineligible_notified_at: String,
    /// Optional alert flag set to "1" when an identifier is assigned
    pub id_assigned_flag: String,
}

impl Default for TrackingFields {
    fn default() -> Self {
        Self {
            status: "pipeline_processing_status".into(),
            reasons: "pipeline_ineligibility_reasons".into(),
            invitation_sent_at: "pipeline_invitation_sent_timestamp".into(),
            ineligible_notified_at: "pipeline_ineligible_notification_sent_timestamp".into(),
            id_assigned_flag: "id_assigned".into(),
        }
    }
}

impl TrackingFields {
    pub fn all(&self) -> Vec<&str> {
        vec![
            self.status.as_str(),
            self.reasons.as_str(),
            self.invitation_sent_at.as_str(),
            self.ineligible_notified_at.as_str(),
            self.id_assigned_flag.as_str(),
        ]
    }
}

// ============================================================================
// Eligibility
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    /// Value of the consent field that means "agreed"
    pub consent_value: String,
    pub age_min: i64,
    pub age_max: i64,
    /// Ages outside this range are data-entry errors, not ineligibility
    pub plausible_age_min: i64,
    pub plausible_age_max: i64,
    pub score_min: i64,
    pub score_max: i64,
    /// Scores at or above this value are ineligible
    pub severity_threshold: i64,
    /// Scores below this value classify as healthy control
    pub clinical_cutoff: i64,
    /// Value meaning "criterion applies" for flag-style exclusions
    pub excluded_value: String,
    pub inclusions: Vec<InclusionCriterion>,
    pub exclusions: Vec<ExclusionCriterion>,
    pub coded_exclusions: Vec<CodedExclusion>,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        let exclusion = |role: &str, reason: &str| ExclusionCriterion::new(role, reason);
        Self {
            consent_value: "1".into(),
            age_min: 18,
            age_max: 65,
            plausible_age_min: 0,
            plausible_age_max: 120,
            score_min: 0,
            score_max: 27,
            severity_threshold: 21,
            clinical_cutoff: 11,
            excluded_value: "1".into(),
            inclusions: vec![
                InclusionCriterion::new("travel", "1", "Unable to travel to study visits"),
                InclusionCriterion::new(
                    "english",
                    "1",
                    "English fluency required for study participation",
                ),
            ],
            exclusions: vec![
                exclusion(
                    "exclude_neurological",
                    "History of brain injury or neurological disorder",
                ),
                exclusion("exclude_psychosis", "Current psychotic symptoms"),
                exclusion("exclude_substance", "Active substance abuse"),
                exclusion("exclude_pregnancy", "Pregnancy or planning pregnancy"),
                exclusion(
                    "exclude_metal_implant",
                    "Metal implants incompatible with MRI/TMS",
                ),
                exclusion(
                    "tms_contraindication",
                    "Medical contraindications present for TMS treatment",
                ),
            ],
            coded_exclusions: vec![CodedExclusion::new(
                "major_exclusion",
                [
                    ("1", "History of brain injury or neurological disorder"),
                    ("2", "Current psychotic symptoms"),
                    ("3", "Active substance abuse"),
                    ("4", "Pregnancy or planning pregnancy"),
                    ("5", "Metal implants incompatible with MRI/TMS"),
                ],
            )],
        }
    }
}

impl EligibilityConfig {
    pub fn validate(&self) -> Result<()> {
        if self.age_min > self.age_max {
            return Err(Error::Config(format!(
                "eligibility.age_min ({}) exceeds age_max ({})",
                self.age_min, self.age_max
            )));
        }
        if self.score_min > self.score_max {
            return Err(Error::Config(format!(
                "eligibility.score_min ({}) exceeds score_max ({})",
                self.score_min, self.score_max
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Identifier assignment
// ============================================================================

/// How an identifier is written to the study ID field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdFormat {
    /// Category prefix, a hyphen, then the number (`HC-3000`)
    #[default]
    Prefixed,
    /// Bare number (`3000`); the range alone identifies the category
    Numeric,
}

/// Identifier range for one category
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CategoryRange {
    pub prefix: String,
    pub start: u32,
    pub end: u32,
    #[serde(default)]
    pub format: IdFormat,
}

impl CategoryRange {
    pub fn new(prefix: &str, start: u32, end: u32) -> Self {
        Self {
            prefix: prefix.to_string(),
            start,
            end,
            format: IdFormat::Prefixed,
        }
    }

    pub fn contains(&self, n: u32) -> bool {
        (self.start..=self.end).contains(&n)
    }

    pub fn format_id(&self, n: u32) -> String {
        match self.format {
            IdFormat::Prefixed => format!("{}-{}", self.prefix, n),
            IdFormat::Numeric => n.to_string(),
        }
    }

    /// Numeric part of `id` if it belongs to this range. Accepts both the
    /// prefixed and bare numeric forms so a format change does not orphan
    /// identifiers already issued.
    pub fn parse_id(&self, id: &str) -> Option<u32> {
        let id = id.trim();
        let digits = match id.get(..self.prefix.len()) {
            Some(head) if !self.prefix.is_empty() && head.eq_ignore_ascii_case(&self.prefix) => {
                id[self.prefix.len()..].trim_start_matches(['-', '_'])
            }
            _ => id,
        };
        let n: u32 = digits.parse().ok()?;
        self.contains(n).then_some(n)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub healthy_control: CategoryRange,
    pub mdd: CategoryRange,
    /// Attempts per record when identifier writes collide
    pub max_attempts: u32,
    /// Conflict backoff base; the delay after conflicting attempt `n` (from 1) is `base * 2^(n-1)`
    pub backoff_base_ms: u64,
    /// Upper bound on a single conflict backoff
    pub backoff_max_ms: u64,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            healthy_control: CategoryRange::new("HC", 3000, 10199),
            mdd: CategoryRange::new("MDD", 10200, 20000),
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
        }
    }
}

impl AssignmentConfig {
    /// Delay after conflicting attempt `attempt` (1-based): base, 2x base,
    /// 4x base... capped at `backoff_max_ms`
    pub fn conflict_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms)
            .saturating_mul(factor)
            .min(Duration::from_millis(self.backoff_max_ms))
    }

    pub fn range(&self, category: Category) -> &CategoryRange {
        match category {
            Category::HealthyControl => &self.healthy_control,
            Category::Mdd => &self.mdd,
        }
    }

    /// Category implied by an existing identifier
    pub fn classify_id(&self, id: &str) -> Option<Category> {
        // Longest prefix first so "MDD" is not shadowed by a shorter prefix
        let mut categories = Category::ALL;
        categories.sort_by_key(|c| std::cmp::Reverse(self.range(*c).prefix.len()));
        categories
            .into_iter()
            .find(|c| self.range(*c).parse_id(id).is_some())
    }

    pub fn validate(&self) -> Result<()> {
        for category in Category::ALL {
            let range = self.range(category);
            if range.start > range.end {
                return Err(Error::Config(format!(
                    "assignment range for {} is empty ({}..={})",
                    category, range.start, range.end
                )));
            }
        }
        let (hc, mdd) = (&self.healthy_control, &self.mdd);
        if hc.start <= mdd.end && mdd.start <= hc.end {
            return Err(Error::Config(format!(
                "assignment ranges overlap: {}..={} and {}..={}",
                hc.start, hc.end, mdd.start, mdd.end
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Notification
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// HTTP endpoint of the mail relay
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: u64,
    pub sender: Option<String>,
    pub study_name: String,
    pub lab_name: String,
    pub contact_email: Option<String>,
    /// Scheduling link included in invitations
    pub scheduling_url: Option<String>,
    /// Include ineligibility reasons in the notice sent to the participant
    pub show_reasons: bool,
    /// Relay send limit; 0 disables limiting
    pub max_per_minute: u32,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            timeout_secs: 30,
            sender: None,
            study_name: "Depression and Brain Stimulation Study".into(),
            lab_name: "Research Team".into(),
            contact_email: None,
            scheduling_url: None,
            show_reasons: false,
            max_per_minute: 100,
        }
    }
}

// ============================================================================
// Polling and logging
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { interval_secs: 120 }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,

    /// Log file path (optional, logs to stderr only if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = TomlConfig::from_toml_str("").unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.assignment.healthy_control.start, 3000);
        assert_eq!(config.assignment.mdd.end, 20000);
        assert_eq!(config.fields.tracking.status, "pipeline_processing_status");
        assert_eq!(config.eligibility.severity_threshold, 21);
        assert!(!config.notify.show_reasons);
        assert_eq!(config.notify.max_per_minute, 100);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = TomlConfig::from_toml_str(
            r#"
            [assignment]
            max_attempts = 6

            [assignment.mdd]
            prefix = "MDD"
            start = 20001
            end = 30000
            format = "numeric"
            "#,
        )
        .unwrap();
        assert_eq!(config.assignment.max_attempts, 6);
        assert_eq!(config.assignment.backoff_base_ms, 500);
        assert_eq!(config.assignment.mdd.format, IdFormat::Numeric);
        assert_eq!(config.assignment.healthy_control.prefix, "HC");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TomlConfig::default();
        let env: BTreeMap<String, String> = [
            ("REDCAP_API_URL", "https://redcap.example.org/api/"),
            ("REDCAP_API_TOKEN", "ABC"),
            ("REDCAP_CONCURRENCY_STRINGS", "duplicate, taken"),
            ("RECRUIT_FIELD_EMAIL", "contact_email_v3"),
            ("RECRUIT_FIELD_", "ignored"),
            ("UNRELATED", "x"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        config.apply_env(|name| env.get(name).cloned(), env.clone());

        assert_eq!(
            config.redcap.credentials().unwrap(),
            ("https://redcap.example.org/api/", "ABC")
        );
        assert_eq!(config.redcap.conflict_signatures, vec!["duplicate", "taken"]);
        assert_eq!(config.fields.overrides.get("email").unwrap(), "contact_email_v3");
        assert_eq!(config.fields.overrides.len(), 1);
    }

    #[test]
    fn test_missing_credentials_is_config_error() {
        let config = TomlConfig::default();
        assert!(matches!(config.redcap.credentials(), Err(Error::Config(_))));
    }

    #[test]
    fn test_conflict_backoff_schedule() {
        let assignment = AssignmentConfig::default();
        assert_eq!(assignment.conflict_backoff(1), Duration::from_millis(500));
        assert_eq!(assignment.conflict_backoff(2), Duration::from_millis(1000));
        assert_eq!(assignment.conflict_backoff(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_conflict_backoff_is_capped() {
        let assignment = AssignmentConfig {
            max_attempts: 1000,
            ..Default::default()
        };
        assert_eq!(assignment.conflict_backoff(5), Duration::from_millis(8000));
        assert_eq!(assignment.conflict_backoff(40), Duration::from_millis(8000));
        assert_eq!(assignment.conflict_backoff(u32::MAX), Duration::from_millis(8000));
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let mut assignment = AssignmentConfig::default();
        assignment.mdd.start = 10000;
        assert!(assignment.validate().is_err());
    }

    #[test]
    fn test_range_parse_and_format() {
        let assignment = AssignmentConfig::default();
        let hc = assignment.range(Category::HealthyControl);
        assert_eq!(hc.format_id(3001), "HC-3001");
        assert_eq!(hc.parse_id("HC3001"), Some(3001));
        assert_eq!(hc.parse_id("hc-3001"), Some(3001));
        assert_eq!(hc.parse_id("HC-3001"), Some(3001));
        assert_eq!(hc.parse_id("3001"), Some(3001));
        assert_eq!(hc.parse_id("HC2999"), None);
        assert_eq!(hc.parse_id("MDD10200"), None);

        assert_eq!(assignment.classify_id("MDD-10250"), Some(Category::Mdd));
        assert_eq!(assignment.classify_id("10250"), Some(Category::Mdd));
        assert_eq!(assignment.classify_id("HC-3500"), Some(Category::HealthyControl));
        assert_eq!(assignment.classify_id("X1"), None);
    }
}
