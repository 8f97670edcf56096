use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::parse::padding_record;
use crate::provider::types::{BatchRecord, PollOutcome, ProviderError, ProviderRow, SubmitReceipt};

const DEFAULT_RETRY_AFTER_MS: u64 = 5_000;

/// External batch lookup provider.
#[async_trait]
pub trait TraceProvider: Send + Sync {
    async fn submit(&self, records: &[BatchRecord]) -> Result<SubmitReceipt, ProviderError>;

    /// `Ready` always carries at least one real (non-padding) row.
    async fn poll(&self, provider_job_id: &str) -> Result<PollOutcome, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub min_batch_size: usize,
}

pub fn http(settings: ProviderSettings) -> Arc<dyn TraceProvider> {
    Arc::new(HttpTraceProvider {
        client: reqwest::Client::new(),
        settings,
    })
}

struct HttpTraceProvider {
    client: reqwest::Client,
    settings: ProviderSettings,
}

impl HttpTraceProvider {
    fn url(&self, path: &str) -> Result<String, ProviderError> {
        let base_url = self
            .settings
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ProviderError::Transport("provider base url missing".to_string()))?;
        Ok(format!("{}/{path}", base_url.trim_end_matches('/')))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.timeout(Duration::from_millis(self.settings.timeout_ms));
        match self
            .settings
            .api_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
        {
            Some(token) => request.header("authorization", format!("Bearer {token}")),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "id")]
    job_id: Option<Value>,
}

#[async_trait]
impl TraceProvider for HttpTraceProvider {
    async fn submit(&self, records: &[BatchRecord]) -> Result<SubmitReceipt, ProviderError> {
        let (csv, padded) = encode_batch(records, self.settings.min_batch_size)?;
        let part = Part::bytes(csv)
            .file_name("batch.csv")
            .mime_str("text/csv")
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        let form = Form::new().part("file", part);

        let resp = self
            .authorize(self.client.post(self.url("batches")?))
            .multipart(form)
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        let status = resp.status();
        let retry_after_ms = retry_after_ms(&resp);
        let body = resp.text().await.unwrap_or_default();
        check_status(status, retry_after_ms, &body)?;

        let parsed = serde_json::from_str::<SubmitResponse>(&body)
            .map_err(|error| ProviderError::Format(format!("submit response: {error}")))?;
        let provider_job_id = match parsed.job_id {
            Some(Value::String(value)) if !value.trim().is_empty() => value.trim().to_string(),
            Some(Value::Number(value)) => value.to_string(),
            _ => {
                return Err(ProviderError::Format(
                    "submit response missing job_id".to_string(),
                ));
            }
        };
        tracing::info!(
            provider_job_id,
            records = records.len(),
            padded,
            "provider batch accepted"
        );
        Ok(SubmitReceipt {
            provider_job_id,
            padded,
        })
    }

    async fn poll(&self, provider_job_id: &str) -> Result<PollOutcome, ProviderError> {
        let resp = self
            .authorize(self.client.get(self.url(&format!("batches/{provider_job_id}"))?))
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        let status = resp.status();
        let retry_after_ms = retry_after_ms(&resp);
        let body = resp.text().await.unwrap_or_default();
        check_status(status, retry_after_ms, &body)?;

        match interpret_poll_body(&body) {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                tracing::warn!(provider_job_id, reason = %error, "provider poll response malformed; treating as pending");
                Ok(PollOutcome::Pending)
            }
        }
    }
}

fn check_status(status: StatusCode, retry_after_ms: u64, body: &str) -> Result<(), ProviderError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited { retry_after_ms });
    }
    if !status.is_success() {
        let detail = if body.trim().is_empty() {
            format!("http {}", status.as_u16())
        } else {
            format!("http {}: {}", status.as_u16(), body.trim())
        };
        return Err(ProviderError::Submission(detail));
    }
    Ok(())
}

fn retry_after_ms(resp: &reqwest::Response) -> u64 {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map_or(DEFAULT_RETRY_AFTER_MS, |seconds| seconds.saturating_mul(1_000))
}

/// Flat upload schema. Zip is deliberately absent; the provider rejects it.
#[derive(Debug, Serialize)]
struct BatchRow<'a> {
    address: &'a str,
    city: &'a str,
    state: &'a str,
    first_name: &'a str,
    last_name: &'a str,
    mail_address: &'a str,
    mail_city: &'a str,
    mail_state: &'a str,
}

impl<'a> From<&'a BatchRecord> for BatchRow<'a> {
    fn from(record: &'a BatchRecord) -> Self {
        Self {
            address: &record.address,
            city: &record.city,
            state: &record.state,
            first_name: record.first_name.as_deref().unwrap_or_default(),
            last_name: record.last_name.as_deref().unwrap_or_default(),
            mail_address: &record.address,
            mail_city: &record.city,
            mail_state: &record.state,
        }
    }
}

/// Encodes `records` as the provider CSV, padding undersized batches.
pub fn encode_batch(
    records: &[BatchRecord],
    min_batch_size: usize,
) -> Result<(Vec<u8>, bool), ProviderError> {
    if records.is_empty() {
        return Err(ProviderError::Submission("empty batch".to_string()));
    }
    let padding = padding_record();
    let padded = records.len() < min_batch_size;
    let pad_count = min_batch_size.saturating_sub(records.len());

    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records
        .iter()
        .chain(std::iter::repeat_n(&padding, pad_count))
    {
        writer
            .serialize(BatchRow::from(record))
            .map_err(|error| ProviderError::Format(error.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|error| ProviderError::Format(error.to_string()))?;
    Ok((bytes, padded))
}

/// Maps a poll body to an outcome. Empty and padding-only arrays are `Pending`.
pub fn interpret_poll_body(body: &str) -> Result<PollOutcome, ProviderError> {
    let value = serde_json::from_str::<Value>(body)
        .map_err(|error| ProviderError::Format(format!("poll body is not json: {error}")))?;
    match value {
        Value::Array(items) => {
            let mut rows = Vec::with_capacity(items.len());
            for item in items {
                let Value::Object(map) = item else {
                    return Err(ProviderError::Format(
                        "poll array contains a non-object row".to_string(),
                    ));
                };
                let row = ProviderRow(map);
                if !row.is_padding() {
                    rows.push(row);
                }
            }
            if rows.is_empty() {
                Ok(PollOutcome::Pending)
            } else {
                Ok(PollOutcome::Ready(rows))
            }
        }
        Value::Object(map) => {
            let pending = map.get("pending").and_then(Value::as_bool) == Some(true)
                || matches!(
                    map.get("status").and_then(Value::as_str),
                    Some("pending" | "processing" | "queued")
                );
            if pending {
                Ok(PollOutcome::Pending)
            } else {
                Err(ProviderError::Format(
                    "poll object is neither pending nor a result array".to_string(),
                ))
            }
        }
        _ => Err(ProviderError::Format(
            "poll body is neither an array nor an object".to_string(),
        )),
    }
}
