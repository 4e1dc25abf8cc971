//! In-memory record store for tests
//!
//! Behaves like a REDCap project as far as the services can tell: filtered
//! exports, atomic partial updates, secondary-unique-field enforcement and a
//! data dictionary. Failures and read latency can be injected to reproduce
//! outages and assignment races.

use super::{ConflictSignatures, FieldMetadata, FieldUpdates, Filter, RecordStore, StoreError};
use crate::model::{RawRecord, RECORD_ID_FIELD};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, RawRecord>>,
    schema: Option<Vec<FieldMetadata>>,
    unique_fields: Vec<String>,
    query_delay: Duration,
    query_failures: Mutex<VecDeque<StoreError>>,
    update_failures: Mutex<VecDeque<StoreError>>,
    updates: Mutex<Vec<(String, FieldUpdates)>>,
    queries: AtomicUsize,
    schema_fetches: AtomicUsize,
}

impl MemoryStore {
    /// Store without a data dictionary; `fetch_schema` fails
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: Vec<FieldMetadata>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Reject writes that would duplicate a non-empty value of `field`
    pub fn with_unique_field(mut self, field: impl Into<String>) -> Self {
        self.unique_fields.push(field.into());
        self
    }

    /// Delay every query after taking its snapshot, widening read/write races
    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    pub fn insert(&self, record: RawRecord) {
        let id = record.get(RECORD_ID_FIELD).cloned().unwrap_or_default();
        lock(&self.records).insert(id, record);
    }

    pub fn record(&self, record_id: &str) -> Option<RawRecord> {
        lock(&self.records).get(record_id).cloned()
    }

    pub fn records(&self) -> Vec<RawRecord> {
        lock(&self.records).values().cloned().collect()
    }

    pub fn fail_next_query(&self, err: StoreError) {
        lock(&self.query_failures).push_back(err);
    }

    pub fn fail_next_update(&self, err: StoreError) {
        lock(&self.update_failures).push_back(err);
    }

    /// Every successful update, in order
    pub fn update_log(&self) -> Vec<(String, FieldUpdates)> {
        lock(&self.updates).clone()
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn schema_fetch_count(&self) -> usize {
        self.schema_fetches.load(Ordering::SeqCst)
    }

    fn check_unique(
        &self,
        records: &BTreeMap<String, RawRecord>,
        record_id: &str,
        updates: &FieldUpdates,
    ) -> Result<(), StoreError> {
        for field in &self.unique_fields {
            let Some(value) = updates.get(field).filter(|v| !v.is_empty()) else {
                continue;
            };
            let taken = records
                .iter()
                .any(|(id, r)| id != record_id && r.get(field) == Some(value));
            if taken {
                let body = format!(
                    "ERROR: The value '{}' for field '{}' is a duplicate value \
                     (secondary unique field constraint)",
                    value, field
                );
                return Err(StoreError::from_response(
                    400,
                    body,
                    None,
                    &ConflictSignatures::default(),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn query(&self, filter: &Filter, fields: &[String]) -> Result<Vec<RawRecord>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.query_failures).pop_front() {
            return Err(err);
        }

        let snapshot: Vec<RawRecord> = lock(&self.records)
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| project(r, fields))
            .collect();

        if !self.query_delay.is_zero() {
            tokio::time::sleep(self.query_delay).await;
        }
        Ok(snapshot)
    }

    async fn update(&self, record_id: &str, updates: &FieldUpdates) -> Result<(), StoreError> {
        if let Some(err) = lock(&self.update_failures).pop_front() {
            return Err(err);
        }

        let mut records = lock(&self.records);
        self.check_unique(&records, record_id, updates)?;

        let record = records.entry(record_id.to_string()).or_insert_with(|| {
            RawRecord::from([(RECORD_ID_FIELD.to_string(), record_id.to_string())])
        });
        for (field, value) in updates {
            record.insert(field.clone(), value.clone());
        }
        drop(records);

        lock(&self.updates).push((record_id.to_string(), updates.clone()));
        Ok(())
    }

    async fn fetch_schema(&self) -> Result<Vec<FieldMetadata>, StoreError> {
        self.schema_fetches.fetch_add(1, Ordering::SeqCst);
        self.schema.clone().ok_or_else(|| StoreError::Api {
            status: 403,
            body: "You do not have API Export privileges".into(),
            retry_after: None,
        })
    }
}

fn project(record: &RawRecord, fields: &[String]) -> RawRecord {
    if fields.is_empty() {
        return record.clone();
    }
    record
        .iter()
        .filter(|(k, _)| k.as_str() == RECORD_ID_FIELD || fields.contains(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
