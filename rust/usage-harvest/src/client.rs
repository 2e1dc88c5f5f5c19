//! Protocol client and import pipeline seams.
//!
//! The scheduler only needs a typed `{success, error_code, payload}` answer
//! from a provider. [`HttpReportClient`] produces it for COUNTER-style JSON
//! endpoints; tests substitute their own [`ReportClient`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Credential, ErrorCode, ReportType};

/// Typed answer of one report request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Identifies this download attempt; also names the imported payload.
    pub attempt_id: Uuid,
    pub success: bool,
    pub error_code: Option<ErrorCode>,
    pub payload: Option<Value>,
}

impl FetchResponse {
    pub fn success(payload: Value) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            success: true,
            error_code: None,
            payload: Some(payload),
        }
    }

    pub fn error(code: impl Into<String>) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            success: false,
            error_code: Some(ErrorCode::new(code)),
            payload: None,
        }
    }
}

/// Downloads one report. Returns only once the provider has answered.
#[async_trait]
pub trait ReportClient: Send + Sync {
    async fn fetch(
        &self,
        credential: &Credential,
        report_type: &ReportType,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<FetchResponse>;
}

/// Receives successful payloads for parsing into usage records.
#[async_trait]
pub trait ImportSink: Send + Sync {
    async fn import(&self, attempt_id: Uuid, payload: Value) -> Result<()>;
}

/// Drops payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullImport;

#[async_trait]
impl ImportSink for NullImport {
    async fn import(&self, _attempt_id: Uuid, _payload: Value) -> Result<()> {
        Ok(())
    }
}

/// Writes each payload to `<dir>/<attempt_id>.json` for an external importer.
#[derive(Debug, Clone)]
pub struct DirectoryImport {
    dir: PathBuf,
}

impl DirectoryImport {
    /// Sink writing into `dir`, which is created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ImportSink for DirectoryImport {
    async fn import(&self, attempt_id: Uuid, payload: Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create import directory {}", self.dir.display()))?;
        let path = self.dir.join(format!("{attempt_id}.json"));
        let body = serde_json::to_vec_pretty(&payload)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// COUNTER/SUSHI JSON client.
pub struct HttpReportClient {
    client: reqwest::Client,
}

impl HttpReportClient {
    /// Create a client with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl std::fmt::Debug for HttpReportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReportClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl ReportClient for HttpReportClient {
    async fn fetch(
        &self,
        credential: &Credential,
        report_type: &ReportType,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<FetchResponse> {
        let url = format!(
            "{}/reports/{}",
            credential.url.trim_end_matches('/'),
            report_type.code.to_lowercase()
        );
        let mut query = vec![
            ("begin_date".to_string(), start_date.format("%Y-%m-%d").to_string()),
            ("end_date".to_string(), end_date.format("%Y-%m-%d").to_string()),
        ];
        query.extend(credential.params.iter().map(|(k, v)| (k.clone(), v.clone())));

        tracing::debug!(url = %url, credential_id = %credential.id, "Requesting report");

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {url}"))?;
        let payload = serde_json::from_str::<Value>(&body).ok();

        let error_code = payload
            .as_ref()
            .and_then(extract_error_code)
            .or_else(|| {
                (!status.is_success()).then(|| ErrorCode::new(format!("http-{}", status.as_u16())))
            });

        Ok(FetchResponse {
            attempt_id: Uuid::new_v4(),
            success: error_code.is_none() && payload.is_some(),
            error_code,
            payload,
        })
    }
}

/// Provider exception code carried in a COUNTER JSON body, if any.
///
/// Recognizes a bare exception object, an array of exceptions, and the
/// `Exception`/`Exceptions` members at top level or in `Report_Header`.
pub fn extract_error_code(body: &Value) -> Option<ErrorCode> {
    fn code_of(exception: &Value) -> Option<ErrorCode> {
        match exception.get("Code")? {
            Value::Number(n) => Some(ErrorCode::new(n.to_string())),
            Value::String(s) if !s.is_empty() => Some(ErrorCode::new(s.clone())),
            _ => None,
        }
    }

    fn from_container(container: &Value) -> Option<ErrorCode> {
        if let Some(exception) = container.get("Exception") {
            return code_of(exception);
        }
        container
            .get("Exceptions")
            .and_then(Value::as_array)
            .and_then(|list| list.iter().find_map(code_of))
    }

    match body {
        Value::Array(list) => list.iter().find_map(code_of),
        Value::Object(_) => code_of(body)
            .or_else(|| from_container(body))
            .or_else(|| body.get("Report_Header").and_then(from_container)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_extract_error_code_shapes() {
        assert_eq!(
            extract_error_code(&json!({"Code": 1011, "Message": "Report Queued"})),
            Some(ErrorCode::new("1011"))
        );
        assert_eq!(
            extract_error_code(&json!([{"Code": 3030, "Severity": "Error"}])),
            Some(ErrorCode::new("3030"))
        );
        assert_eq!(
            extract_error_code(&json!({"Exception": {"Code": "1020"}})),
            Some(ErrorCode::new("1020"))
        );
        assert_eq!(
            extract_error_code(&json!({
                "Report_Header": {"Exceptions": [{"Code": 3031}]},
                "Report_Items": []
            })),
            Some(ErrorCode::new("3031"))
        );
    }

    #[test]
    fn test_extract_error_code_absent() {
        assert_eq!(
            extract_error_code(&json!({"Report_Header": {}, "Report_Items": []})),
            None
        );
        assert_eq!(extract_error_code(&json!("plain")), None);
    }

    #[tokio::test]
    async fn test_directory_import_writes_payload() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectoryImport::new(dir.path().join("imports"));
        let attempt = Uuid::new_v4();

        sink.import(attempt, json!({"Report_Items": []})).await.unwrap();

        let written = std::fs::read_to_string(
            dir.path().join("imports").join(format!("{attempt}.json")),
        )
        .unwrap();
        let value: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value, json!({"Report_Items": []}));
    }
}
