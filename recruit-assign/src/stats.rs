//! Assignment statistics, read live from the record store

use crate::identifier;
use recruit_common::config::AssignmentConfig;
use recruit_common::store::Filter;
use recruit_common::{Category, FieldDetector, RecordStore, Result, Role};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_records: usize,
    /// Stored status value -> count; blank statuses count as "pending"
    pub by_status: BTreeMap<String, usize>,
    pub assigned: BTreeMap<Category, usize>,
    /// `None` when the category's range is exhausted
    pub next_available: BTreeMap<Category, Option<String>>,
}

pub async fn collect_statistics(
    store: &dyn RecordStore,
    detector: &FieldDetector,
    assignment: &AssignmentConfig,
) -> Result<Statistics> {
    detector.load_schema(store).await;
    let records = store.query(&Filter::new(), &[]).await?;
    let status_field = &detector.tracking_fields().status;

    let mut stats = Statistics {
        total_records: records.len(),
        ..Default::default()
    };

    let study_id_field = match records.first() {
        Some(sample) => detector.detect(&Role::STUDY_ID, Some(sample)),
        None => detector.detect(&Role::STUDY_ID, None),
    };

    let mut issued: Vec<&str> = Vec::new();
    for record in &records {
        let status = FieldDetector::value_of(record, status_field).unwrap_or("pending");
        *stats.by_status.entry(status.to_string()).or_insert(0) += 1;

        if let Some(id) = study_id_field
            .as_deref()
            .and_then(|field| FieldDetector::value_of(record, field))
        {
            issued.push(id);
            if let Some(category) = assignment.classify_id(id) {
                *stats.assigned.entry(category).or_insert(0) += 1;
            }
        }
    }

    for category in Category::ALL {
        let next = identifier::next_identifier(assignment.range(category), issued.iter().copied());
        stats.next_available.insert(category, next);
    }

    Ok(stats)
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Assignment statistics")?;
        writeln!(f, "  Total records: {}", self.total_records)?;
        writeln!(f, "  By status:")?;
        for (status, count) in &self.by_status {
            writeln!(f, "    {:<24} {}", status, count)?;
        }
        writeln!(f, "  Assigned identifiers:")?;
        for category in Category::ALL {
            writeln!(
                f,
                "    {:<24} {}",
                category.label(),
                self.assigned.get(&category).copied().unwrap_or(0)
            )?;
        }
        writeln!(f, "  Next available:")?;
        for category in Category::ALL {
            let next = self
                .next_available
                .get(&category)
                .and_then(|n| n.as_deref())
                .unwrap_or("range exhausted");
            writeln!(f, "    {:<24} {}", category.label(), next)?;
        }
        Ok(())
    }
}
