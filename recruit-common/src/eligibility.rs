//! Eligibility evaluation
//!
//! A pure function from a normalized record to a verdict. No I/O, no clock,
//! no randomness: evaluating the same record twice gives the same verdict.
//!
//! Criteria run in tiers:
//!
//! 1. consent refusal (definitive) and missing required fields
//! 2. age: implausible values need review, out-of-range values disqualify
//! 3. inclusion requirements and exclusion criteria
//! 4. assessment score: invalid values need review, severe scores disqualify,
//!    the rest classify the participant
//!
//! A review trigger that fires before anything disqualifying stops with
//! `ManualReview`. Once something disqualifies, the remaining tiers only
//! collect further ineligibility reasons.

use crate::config::{AssignmentConfig, EligibilityConfig, TomlConfig};
use crate::detector::Role;
use crate::model::{Category, NormalizedRecord, ProcessingStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const REASON_NO_CONSENT: &str = "did not consent";
pub const REASON_MISSING_SCORE: &str = "missing assessment score";

// ============================================================================
// Criteria
// ============================================================================

/// Field that must hold `required_value` when present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionCriterion {
    pub role: Role,
    #[serde(default = "default_flag_value")]
    pub required_value: String,
    pub reason: String,
}

impl InclusionCriterion {
    pub fn new(role: &str, required_value: &str, reason: &str) -> Self {
        Self {
            role: Role::new(role),
            required_value: required_value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Yes/no field that disqualifies when set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionCriterion {
    pub role: Role,
    pub reason: String,
    /// Values that trigger the exclusion; empty means `excluded_value`
    #[serde(default)]
    pub excluded_values: Vec<String>,
}

impl ExclusionCriterion {
    pub fn new(role: &str, reason: &str) -> Self {
        Self {
            role: Role::new(role),
            reason: reason.to_string(),
            excluded_values: Vec::new(),
        }
    }
}

/// Multiple-choice field whose codes map to exclusion reasons
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedExclusion {
    pub role: Role,
    pub reasons: BTreeMap<String, String>,
}

impl CodedExclusion {
    pub fn new<'a, I>(role: &str, reasons: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            role: Role::new(role),
            reasons: reasons
                .into_iter()
                .map(|(code, reason)| (code.to_string(), reason.to_string()))
                .collect(),
        }
    }
}

fn default_flag_value() -> String {
    "1".to_string()
}

// ============================================================================
// Verdict
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Eligible,
    Ineligible,
    ManualReview,
}

impl Outcome {
    /// Status the assigner writes for this outcome
    pub fn target_status(&self) -> ProcessingStatus {
        match self {
            Outcome::Eligible => ProcessingStatus::IdAssigned,
            Outcome::Ineligible => ProcessingStatus::Ineligible,
            Outcome::ManualReview => ProcessingStatus::ManualReviewRequired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EligibilityVerdict {
    pub outcome: Outcome,
    /// Empty iff eligible
    pub reasons: Vec<String>,
    /// Set iff eligible
    pub category: Option<Category>,
}

impl EligibilityVerdict {
    fn eligible(category: Category) -> Self {
        Self {
            outcome: Outcome::Eligible,
            reasons: Vec::new(),
            category: Some(category),
        }
    }

    fn ineligible(reasons: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Ineligible,
            reasons,
            category: None,
        }
    }

    fn manual_review(reasons: Vec<String>) -> Self {
        Self {
            outcome: Outcome::ManualReview,
            reasons,
            category: None,
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.outcome == Outcome::Eligible
    }
}

/// Running state of one evaluation
#[derive(Default)]
struct Findings {
    disqualified: Vec<String>,
    review: Option<String>,
}

impl Findings {
    fn disqualify(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.review.is_none() && !self.disqualified.contains(&reason) {
            self.disqualified.push(reason);
        }
    }

    /// Only the first review trigger counts, and only before any disqualification
    fn review(&mut self, reason: impl Into<String>) {
        if self.disqualified.is_empty() && self.review.is_none() {
            self.review = Some(reason.into());
        }
    }

    fn halted(&self) -> bool {
        self.review.is_some()
    }

    fn into_review(self) -> EligibilityVerdict {
        EligibilityVerdict::manual_review(self.review.into_iter().collect())
    }
}

// ============================================================================
// Evaluator
// ============================================================================

/// Applies the configured criteria to normalized records
#[derive(Debug, Clone)]
pub struct Evaluator {
    config: EligibilityConfig,
    assignment: AssignmentConfig,
}

impl Evaluator {
    pub fn new(config: EligibilityConfig, assignment: AssignmentConfig) -> Self {
        Self { config, assignment }
    }

    pub fn from_config(config: &TomlConfig) -> Self {
        Self::new(config.eligibility.clone(), config.assignment.clone())
    }

    pub fn config(&self) -> &EligibilityConfig {
        &self.config
    }

    pub fn evaluate(&self, record: &NormalizedRecord) -> EligibilityVerdict {
        let c = &self.config;

        if let Some(consent) = record.get(&Role::CONSENT) {
            if consent != c.consent_value {
                return EligibilityVerdict::ineligible(vec![REASON_NO_CONSENT.to_string()]);
            }
        }

        let missing: Vec<String> = Role::REQUIRED
            .iter()
            .filter(|role| record.get(role).is_none())
            .map(|role| format!("missing required field: {}", role))
            .collect();
        if !missing.is_empty() {
            return EligibilityVerdict::manual_review(missing);
        }

        let mut findings = Findings::default();

        self.check_age(record, &mut findings);
        if findings.halted() {
            return findings.into_review();
        }

        self.check_criteria(record, &mut findings);

        let score_category = self.check_score(record, &mut findings);
        if findings.halted() {
            return findings.into_review();
        }
        if !findings.disqualified.is_empty() {
            return EligibilityVerdict::ineligible(findings.disqualified);
        }

        match self.explicit_category(record).or(score_category) {
            Some(category) => EligibilityVerdict::eligible(category),
            // check_score raises a review whenever neither source exists
            None => EligibilityVerdict::manual_review(vec![REASON_MISSING_SCORE.to_string()]),
        }
    }

    /// Study arm of a record: explicit arm field, then an existing
    /// identifier, then the assessment score
    pub fn classify(&self, record: &NormalizedRecord) -> Option<Category> {
        self.explicit_category(record).or_else(|| {
            record
                .get(&Role::ASSESSMENT_SCORE)
                .and_then(parse_whole_number)
                .filter(|s| (self.config.score_min..=self.config.score_max).contains(s))
                .map(|s| self.category_for_score(s))
        })
    }

    /// Every criterion role the evaluator reads, for compatibility checks
    pub fn criteria_roles(&self) -> Vec<Role> {
        let c = &self.config;
        c.inclusions
            .iter()
            .map(|i| i.role.clone())
            .chain(c.exclusions.iter().map(|e| e.role.clone()))
            .chain(c.coded_exclusions.iter().map(|e| e.role.clone()))
            .collect()
    }

    fn check_age(&self, record: &NormalizedRecord, findings: &mut Findings) {
        let c = &self.config;
        let raw = record.get(&Role::AGE).unwrap_or_default();
        match parse_whole_number(raw) {
            None => findings.review(format!("invalid age: '{}'", raw)),
            Some(age) if age < c.plausible_age_min || age > c.plausible_age_max => {
                findings.review(format!("age out of plausible range: {}", age))
            }
            Some(age) if age < c.age_min => {
                findings.disqualify(format!("age {} below minimum of {}", age, c.age_min))
            }
            Some(age) if age > c.age_max => {
                findings.disqualify(format!("age {} above maximum of {}", age, c.age_max))
            }
            Some(_) => {}
        }
    }

    fn check_criteria(&self, record: &NormalizedRecord, findings: &mut Findings) {
        let c = &self.config;

        for inclusion in &c.inclusions {
            if let Some(value) = record.get(&inclusion.role) {
                if value != inclusion.required_value {
                    findings.disqualify(inclusion.reason.as_str());
                }
            }
        }

        for exclusion in &c.exclusions {
            let Some(value) = record.get(&exclusion.role) else {
                continue;
            };
            let triggered = if exclusion.excluded_values.is_empty() {
                value == c.excluded_value
            } else {
                exclusion.excluded_values.iter().any(|v| v == value)
            };
            if triggered {
                findings.disqualify(exclusion.reason.as_str());
            }
        }

        for coded in &c.coded_exclusions {
            if let Some(reason) = record
                .get(&coded.role)
                .and_then(|code| coded.reasons.get(code))
            {
                findings.disqualify(reason.as_str());
            }
        }
    }

    /// Category implied by the score, if the score is usable
    fn check_score(&self, record: &NormalizedRecord, findings: &mut Findings) -> Option<Category> {
        let c = &self.config;
        let Some(raw) = record.get(&Role::ASSESSMENT_SCORE) else {
            if self.explicit_category(record).is_none() {
                findings.review(REASON_MISSING_SCORE);
            }
            return None;
        };

        match parse_whole_number(raw) {
            None => {
                findings.review(format!("invalid score: '{}'", raw));
                None
            }
            Some(score) if score < c.score_min || score > c.score_max => {
                findings.review(format!(
                    "invalid score: {} outside {}-{}",
                    score, c.score_min, c.score_max
                ));
                None
            }
            Some(score) if score >= c.severity_threshold => {
                findings.disqualify(format!(
                    "score exceeds severity threshold: {} >= {}",
                    score, c.severity_threshold
                ));
                None
            }
            Some(score) => Some(self.category_for_score(score)),
        }
    }

    fn explicit_category(&self, record: &NormalizedRecord) -> Option<Category> {
        record
            .get(&Role::STUDY_ARM)
            .and_then(Category::from_arm_value)
            .or_else(|| {
                record
                    .get(&Role::STUDY_ID)
                    .and_then(|id| self.assignment.classify_id(id))
            })
    }

    fn category_for_score(&self, score: i64) -> Category {
        if score < self.config.clinical_cutoff {
            Category::HealthyControl
        } else {
            Category::Mdd
        }
    }
}

/// Integer, or a decimal with no fractional part ("8.0")
fn parse_whole_number(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return Some(n);
    }
    let f: f64 = raw.parse().ok()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> Evaluator {
        Evaluator::new(EligibilityConfig::default(), AssignmentConfig::default())
    }

    fn base() -> NormalizedRecord {
        NormalizedRecord::new("1")
            .with(Role::EMAIL, "p@example.org")
            .with(Role::CONSENT, "1")
            .with(Role::AGE, "30")
            .with(Role::ASSESSMENT_SCORE, "8")
    }

    #[test]
    fn test_parse_whole_number() {
        assert_eq!(parse_whole_number("8"), Some(8));
        assert_eq!(parse_whole_number(" 8.0 "), Some(8));
        assert_eq!(parse_whole_number("8.5"), None);
        assert_eq!(parse_whole_number("eight"), None);
        assert_eq!(parse_whole_number("NaN"), None);
    }

    #[test]
    fn test_eligible_healthy_control() {
        let verdict = evaluator().evaluate(&base());
        assert_eq!(verdict.outcome, Outcome::Eligible);
        assert!(verdict.reasons.is_empty());
        assert_eq!(verdict.category, Some(Category::HealthyControl));
    }

    #[test]
    fn test_score_at_cutoff_is_mdd() {
        let record = base().with(Role::ASSESSMENT_SCORE, "11");
        assert_eq!(evaluator().evaluate(&record).category, Some(Category::Mdd));
    }

    #[test]
    fn test_findings_ignore_review_after_disqualification() {
        let mut findings = Findings::default();
        findings.disqualify("a");
        findings.review("b");
        findings.disqualify("a");
        findings.disqualify("c");
        assert!(!findings.halted());
        assert_eq!(findings.disqualified, vec!["a", "c"]);
    }

    #[test]
    fn test_findings_stop_collecting_after_review() {
        let mut findings = Findings::default();
        findings.review("first");
        findings.review("second");
        findings.disqualify("late");
        assert!(findings.disqualified.is_empty());
        assert_eq!(findings.into_review().reasons, vec!["first"]);
    }

    #[test]
    fn test_outcome_target_status() {
        assert_eq!(Outcome::Eligible.target_status(), ProcessingStatus::IdAssigned);
        assert_eq!(
            Outcome::ManualReview.target_status(),
            ProcessingStatus::ManualReviewRequired
        );
    }
}
