//! Detection rule table
//!
//! Rules are data. The built-in table ships with the crate and can be
//! replaced by a TOML file of the same shape (`[fields] rules_path`).

use super::Role;
use crate::error::{Error, Result};
use crate::store::FieldMetadata;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::path::Path;

const DEFAULT_RULES: &str = include_str!("../../field_rules.toml");

/// Field types that hold no data and never satisfy a rule
const NON_DATA_FIELD_TYPES: [&str; 1] = ["descriptive"];

/// Field types that declare a choice list in the dictionary
const CHOICE_FIELD_TYPES: [&str; 3] = ["radio", "dropdown", "checkbox"];

/// One rule as written in TOML
#[derive(Debug, Clone, Deserialize)]
pub struct FieldRule {
    pub role: Role,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub field_types: Vec<String>,
    #[serde(default)]
    pub validations: Vec<String>,
    #[serde(default)]
    pub choices_pattern: Option<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(rename = "rule", default)]
    rules: Vec<FieldRule>,
}

/// Rule with its regexes compiled
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub role: Role,
    patterns: Vec<Regex>,
    keywords: Vec<String>,
    field_types: Vec<String>,
    validations: Vec<String>,
    choices: Option<Regex>,
    excludes: Vec<Regex>,
}

impl CompiledRule {
    pub fn compile(rule: FieldRule) -> Result<Self> {
        let role = rule.role;
        let patterns = compile_all(&role, &rule.patterns)?;
        let excludes = compile_all(&role, &rule.exclude_patterns)?;
        let choices = rule
            .choices_pattern
            .as_deref()
            .map(|p| compile(&role, p))
            .transpose()?;

        Ok(Self {
            role,
            patterns,
            keywords: lowercase_all(rule.keywords),
            field_types: lowercase_all(rule.field_types),
            validations: lowercase_all(rule.validations),
            choices,
            excludes,
        })
    }

    /// Pick the field for this role from a data dictionary.
    ///
    /// Pure function of the rule and the schema: the first field, in
    /// dictionary order, that satisfies the constraints, matches a pattern or
    /// keyword, and is not excluded. Fields named in `reserved` (the
    /// pipeline's own tracking fields) are never selected.
    pub fn select<'a>(
        &self,
        schema: &'a [FieldMetadata],
        reserved: &[&str],
    ) -> Option<&'a FieldMetadata> {
        schema
            .iter()
            .filter(|field| !reserved.contains(&field.field_name.as_str()))
            .find(|field| self.accepts(field))
    }

    /// Fallback when no dictionary is available: match bare field names
    /// (e.g. the keys of a sample record). Structural constraints cannot be
    /// checked, so only name patterns, keywords and exclusions apply.
    pub fn select_name<'a, I>(&self, names: I, reserved: &[&str]) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names.into_iter().find(|name| {
            !reserved.contains(name)
                && (self.matches_text(name) || self.matches_keyword(name))
                && !self.is_excluded(name)
        })
    }

    fn accepts(&self, field: &FieldMetadata) -> bool {
        if !self.satisfies_constraints(field) {
            return false;
        }
        let texts = [
            field.field_name.as_str(),
            field.field_label.as_str(),
            field.field_note.as_str(),
        ];
        let candidate = texts
            .iter()
            .any(|t| !t.is_empty() && (self.matches_text(t) || self.matches_keyword(t)));
        candidate && !self.is_excluded(&field.field_name)
    }

    fn satisfies_constraints(&self, field: &FieldMetadata) -> bool {
        let field_type = field.field_type.to_ascii_lowercase();
        if NON_DATA_FIELD_TYPES.contains(&field_type.as_str()) {
            return false;
        }
        if !self.field_types.is_empty() && !self.field_types.contains(&field_type) {
            return false;
        }
        if !self.validations.is_empty()
            && !self
                .validations
                .contains(&field.validation().to_ascii_lowercase())
        {
            return false;
        }
        match &self.choices {
            Some(choices) if CHOICE_FIELD_TYPES.contains(&field_type.as_str()) => {
                choices.is_match(&field.select_choices_or_calculations)
            }
            _ => true,
        }
    }

    fn matches_text(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }

    fn matches_keyword(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }

    fn is_excluded(&self, field_name: &str) -> bool {
        self.excludes.iter().any(|p| p.is_match(field_name))
    }
}

/// Ordered set of compiled rules, at most one per role
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<CompiledRule>,
}

impl RuleTable {
    /// Built-in rules
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(DEFAULT_RULES)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read rules file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: RuleFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid detection rules: {}", e)))?;

        let mut rules: Vec<CompiledRule> = Vec::with_capacity(file.rules.len());
        for rule in file.rules {
            let compiled = CompiledRule::compile(rule)?;
            if rules.iter().any(|r| r.role == compiled.role) {
                return Err(Error::Config(format!(
                    "Duplicate detection rule for role '{}'",
                    compiled.role
                )));
            }
            rules.push(compiled);
        }
        Ok(Self { rules })
    }

    pub fn get(&self, role: &Role) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| &r.role == role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.rules.iter().map(|r| &r.role)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile(role: &Role, pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::Config(format!("Invalid pattern for role '{}': {}", role, e)))
}

fn compile_all(role: &Role, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile(role, p)).collect()
}

fn lowercase_all(values: Vec<String>) -> Vec<String> {
    values.into_iter().map(|v| v.trim().to_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, field_type: &str, label: &str) -> FieldMetadata {
        FieldMetadata::new(name, field_type).with_label(label)
    }

    #[test]
    fn test_builtin_rules_compile() {
        let table = RuleTable::builtin().unwrap();
        assert!(table.get(&Role::EMAIL).is_some());
        assert!(table.get(&Role::STUDY_ID).is_some());
        assert!(table.len() >= 10);
    }

    #[test]
    fn test_constraint_rejects_wrong_field_type() {
        let table = RuleTable::from_toml_str(
            r#"
            [[rule]]
            role = "assessment_score"
            patterns = ["score"]
            field_types = ["calc"]
            "#,
        )
        .unwrap();
        let rule = table.get(&Role::ASSESSMENT_SCORE).unwrap();
        let schema = vec![
            field("score_notes", "notes", "Score notes"),
            field("score_total", "calc", "Total score"),
        ];
        assert_eq!(rule.select(&schema, &[]).unwrap().field_name, "score_total");
    }

    #[test]
    fn test_exclusion_drops_matching_candidate() {
        let table = RuleTable::builtin().unwrap();
        let rule = table.get(&Role::EMAIL).unwrap();
        let schema = vec![
            field("eligibility_email_sent", "text", "Eligibility email sent"),
            field("email_confirm", "text", "Confirm email"),
            field("contact_email", "text", "Email address"),
        ];
        assert_eq!(rule.select(&schema, &[]).unwrap().field_name, "contact_email");
    }

    #[test]
    fn test_first_match_in_dictionary_order_wins() {
        let table = RuleTable::builtin().unwrap();
        let rule = table.get(&Role::STUDY_ID).unwrap();
        let schema = vec![
            field("record_id", "text", "Record ID"),
            field("assigned_study_id_a690e9", "text", "Assigned Study ID"),
            field("participant_id", "text", "Participant ID"),
        ];
        assert_eq!(
            rule.select(&schema, &[]).unwrap().field_name,
            "assigned_study_id_a690e9"
        );
    }

    #[test]
    fn test_reserved_fields_are_skipped() {
        let table = RuleTable::builtin().unwrap();
        let rule = table.get(&Role::ELIGIBILITY_FLAG).unwrap();
        let schema = vec![
            field("pipeline_ineligibility_reasons", "text", "Ineligibility reasons"),
            field("overall_eligibility", "calc", "Overall eligibility"),
        ];
        let reserved = ["pipeline_ineligibility_reasons"];
        assert_eq!(
            rule.select(&schema, &reserved).unwrap().field_name,
            "overall_eligibility"
        );
    }

    #[test]
    fn test_descriptive_fields_never_match() {
        let table = RuleTable::builtin().unwrap();
        let rule = table.get(&Role::CONSENT).unwrap();
        let schema = vec![field("consent_intro", "descriptive", "Consent information")];
        assert!(rule.select(&schema, &[]).is_none());
    }

    #[test]
    fn test_choices_pattern_applies_to_choice_fields_only() {
        let table = RuleTable::builtin().unwrap();
        let rule = table.get(&Role::CONSENT).unwrap();
        let wrong_codes = FieldMetadata::new("consent_radio", "radio")
            .with_choices("Y, Yes | N, No");
        let yes_no = FieldMetadata::new("consent_yn", "yesno");
        let schema = vec![wrong_codes, yes_no];
        assert_eq!(rule.select(&schema, &[]).unwrap().field_name, "consent_yn");
    }

    #[test]
    fn test_select_name_fallback() {
        let table = RuleTable::builtin().unwrap();
        let rule = table.get(&Role::EMAIL).unwrap();
        let keys = ["record_id", "email_sent", "email_address"];
        assert_eq!(rule.select_name(keys, &[]), Some("email_address"));
        assert_eq!(rule.select_name(keys, &["email_address"]), None);
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let err = RuleTable::from_toml_str(
            r#"
            [[rule]]
            role = "email"
            [[rule]]
            role = "EMAIL"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        let err = RuleTable::from_toml_str(
            r#"
            [[rule]]
            role = "email"
            patterns = ["(unclosed"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
