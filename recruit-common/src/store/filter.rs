//! Server-side record filters
//!
//! A filter is a conjunction of clauses; a clause is a single equality test
//! or a disjunction of them. That is enough to express every poll the
//! services run, and it renders directly to REDCap `filterLogic`.

use super::StoreError;
use crate::model::RawRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq(String, String),
    Ne(String, String),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Ne(field.into(), value.into())
    }

    /// Absent fields compare as the empty string, as they do server-side
    pub fn matches(&self, record: &RawRecord) -> bool {
        match self {
            Predicate::Eq(field, value) => field_value(record, field) == value,
            Predicate::Ne(field, value) => field_value(record, field) != value,
        }
    }

    fn render(&self) -> Result<String, StoreError> {
        Ok(match self {
            Predicate::Eq(field, value) => format!("[{}] = {}", field, quote(value)?),
            Predicate::Ne(field, value) => format!("[{}] <> {}", field, quote(value)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    One(Predicate),
    AnyOf(Vec<Predicate>),
}

impl Clause {
    fn matches(&self, record: &RawRecord) -> bool {
        match self {
            Clause::One(p) => p.matches(record),
            Clause::AnyOf(ps) => ps.iter().any(|p| p.matches(record)),
        }
    }

    fn render(&self) -> Result<String, StoreError> {
        match self {
            Clause::One(p) => p.render(),
            Clause::AnyOf(ps) if ps.len() == 1 => ps[0].render(),
            Clause::AnyOf(ps) => {
                let parts = ps
                    .iter()
                    .map(Predicate::render)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({})", parts.join(" or ")))
            }
        }
    }
}

/// Conjunction of clauses. The empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.push(Clause::One(Predicate::eq(field, value)));
        self
    }

    pub fn ne(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.push(Clause::One(Predicate::ne(field, value)));
        self
    }

    pub fn blank(self, field: impl Into<String>) -> Self {
        self.eq(field, "")
    }

    pub fn not_blank(self, field: impl Into<String>) -> Self {
        self.ne(field, "")
    }

    pub fn any_of(mut self, predicates: Vec<Predicate>) -> Self {
        if !predicates.is_empty() {
            self.clauses.push(Clause::AnyOf(predicates));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Evaluate locally. Used by the in-memory store and for re-checking a
    /// record's eligibility for processing after it was fetched.
    pub fn matches(&self, record: &RawRecord) -> bool {
        self.clauses.iter().all(|c| c.matches(record))
    }

    /// REDCap `filterLogic` expression. Fails for values that cannot be
    /// quoted.
    pub fn to_filter_logic(&self) -> Result<String, StoreError> {
        let parts = self
            .clauses
            .iter()
            .map(Clause::render)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join(" and "))
    }
}

fn field_value<'a>(record: &'a RawRecord, field: &str) -> &'a str {
    record.get(field).map(String::as_str).unwrap_or("")
}

/// REDCap logic has no escape sequences: a value may contain one kind of
/// quote, never both
fn quote(value: &str) -> Result<String, StoreError> {
    match (value.contains('\''), value.contains('"')) {
        (false, _) => Ok(format!("'{}'", value)),
        (true, false) => Ok(format!("\"{}\"", value)),
        (true, true) => Err(StoreError::InvalidFilter(format!(
            "value {:?} contains both quote characters",
            value
        ))),
    }
}
