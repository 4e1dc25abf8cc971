//! REDCap API client
//!
//! Every call is a form-encoded POST to the project API endpoint carrying the
//! project token. Transient failures are retried with exponential backoff;
//! uniqueness violations are classified from the error body and returned to
//! the caller untouched.

use super::{
    with_retry, ConflictSignatures, FieldMetadata, FieldUpdates, Filter, RecordStore,
    RetryPolicy, StoreError,
};
use crate::config::TomlConfig;
use crate::model::{RawRecord, RECORD_ID_FIELD};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const USER_AGENT: &str = concat!("recruit-pipeline/", env!("CARGO_PKG_VERSION"));

/// REDCap API client
pub struct RedcapClient {
    http_client: reqwest::Client,
    api_url: String,
    api_token: String,
    retry: RetryPolicy,
    signatures: ConflictSignatures,
}

impl RedcapClient {
    pub fn new(
        api_url: impl Into<String>,
        api_token: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
        signatures: ConflictSignatures,
    ) -> Result<Self, StoreError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            api_url: api_url.into(),
            api_token: api_token.into(),
            retry,
            signatures,
        })
    }

    /// Build a client from loaded configuration. Fails if URL or token is unset.
    pub fn from_config(config: &TomlConfig) -> crate::Result<Self> {
        let (url, token) = config.redcap.credentials()?;
        let client = Self::new(
            url,
            token,
            Duration::from_secs(config.redcap.timeout_secs),
            config.retry.policy(),
            config.redcap.signatures(),
        )?;
        Ok(client)
    }

    /// Export records (`content=record`), optionally filtered server-side
    pub async fn export_records(
        &self,
        filter: &Filter,
        fields: &[String],
    ) -> Result<Vec<RawRecord>, StoreError> {
        let mut params = self.base_params("record");
        params.push(("type".into(), "flat".into()));
        params.push(("rawOrLabel".into(), "raw".into()));
        let logic = filter.to_filter_logic()?;
        if !logic.is_empty() {
            params.push(("filterLogic".into(), logic.clone()));
        }
        for (i, field) in fields.iter().enumerate() {
            params.push((format!("fields[{i}]"), field.clone()));
        }

        tracing::debug!(filter = %logic, fields = fields.len(), "Exporting records");
        let body = self.post("export records", &params).await?;
        let records = parse_records(&body)?;
        tracing::debug!(count = records.len(), "Records exported");
        Ok(records)
    }

    /// Import a partial record (`content=record`, overwrite behavior)
    pub async fn import_record(
        &self,
        record_id: &str,
        updates: &FieldUpdates,
    ) -> Result<(), StoreError> {
        let mut record = updates.clone();
        record.insert(RECORD_ID_FIELD.to_string(), record_id.to_string());
        let data = serde_json::to_string(&[record])
            .map_err(|e| StoreError::Parse(format!("Failed to encode record: {}", e)))?;

        let mut params = self.base_params("record");
        params.push(("type".into(), "flat".into()));
        params.push(("overwriteBehavior".into(), "overwrite".into()));
        params.push(("returnContent".into(), "count".into()));
        params.push(("data".into(), data));

        let body = self.post("import record", &params).await?;
        match import_count(&body) {
            Some(0) => tracing::warn!(record_id, "REDCap reported zero records imported"),
            Some(_) => tracing::debug!(record_id, fields = updates.len(), "Record updated"),
            None => tracing::debug!(record_id, response = %body, "Unrecognized import response"),
        }
        Ok(())
    }

    /// Export the data dictionary (`content=metadata`)
    pub async fn export_metadata(&self) -> Result<Vec<FieldMetadata>, StoreError> {
        let params = self.base_params("metadata");
        let body = self.post("export metadata", &params).await?;
        serde_json::from_str(&body)
            .map_err(|e| StoreError::Parse(format!("Invalid metadata export: {}", e)))
    }

    fn base_params(&self, content: &str) -> Vec<(String, String)> {
        vec![
            ("token".into(), self.api_token.clone()),
            ("content".into(), content.into()),
            ("format".into(), "json".into()),
            ("returnFormat".into(), "json".into()),
        ]
    }

    async fn post(
        &self,
        operation: &str,
        params: &[(String, String)],
    ) -> Result<String, StoreError> {
        with_retry(operation, &self.retry, || self.post_once(params)).await
    }

    async fn post_once(&self, params: &[(String, String)]) -> Result<String, StoreError> {
        let response = self
            .http_client
            .post(&self.api_url)
            .form(params)
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(StoreError::from_response(
                status.as_u16(),
                body,
                retry_after,
                &self.signatures,
            ))
        }
    }
}

#[async_trait]
impl RecordStore for RedcapClient {
    async fn query(&self, filter: &Filter, fields: &[String]) -> Result<Vec<RawRecord>, StoreError> {
        self.export_records(filter, fields).await
    }

    async fn update(&self, record_id: &str, updates: &FieldUpdates) -> Result<(), StoreError> {
        self.import_record(record_id, updates).await
    }

    async fn fetch_schema(&self) -> Result<Vec<FieldMetadata>, StoreError> {
        self.export_metadata().await
    }
}

/// Flatten an export into string maps. REDCap exports strings, but some
/// proxies and older versions emit bare numbers.
fn parse_records(body: &str) -> Result<Vec<RawRecord>, StoreError> {
    let rows: Vec<serde_json::Map<String, Value>> = serde_json::from_str(body)
        .map_err(|e| StoreError::Parse(format!("Invalid record export: {}", e)))?;

    Ok(rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(field, value)| (field, value_to_string(value)))
                .collect()
        })
        .collect())
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn import_count(body: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("count")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_records_stringifies_values() {
        let body = r#"[{"record_id": "1", "age": 30, "email": null, "flag": true}]"#;
        let records = parse_records(body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["record_id"], "1");
        assert_eq!(records[0]["age"], "30");
        assert_eq!(records[0]["email"], "");
        assert_eq!(records[0]["flag"], "true");
    }

    #[test]
    fn test_parse_records_rejects_non_array() {
        let err = parse_records(r#"{"error": "You do not have permissions"}"#).unwrap_err();
        assert!(matches!(err, StoreError::Parse(_)));
    }

    #[test]
    fn test_import_count_accepts_number_or_string() {
        assert_eq!(import_count(r#"{"count": 1}"#), Some(1));
        assert_eq!(import_count(r#"{"count": "0"}"#), Some(0));
        assert_eq!(import_count("1"), None);
    }
}
