use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::{AddressInput, CanonicalAddress};
use crate::provider::types::{BatchRecord, ContactResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Pending,
    Processing,
    Success,
    NoMatch,
    Error,
}

impl TraceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::NoMatch => "no_match",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "success" => Some(Self::Success),
            "no_match" => Some(Self::NoMatch),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Terminal without a usable result; such records may be deleted for a retry.
    pub fn is_failed(self) -> bool {
        matches!(self, Self::NoMatch | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BulkJobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Caller submission for one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRequest {
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    #[serde(default)]
    pub owner_first_name: Option<String>,
    #[serde(default)]
    pub owner_last_name: Option<String>,
}

impl TraceRequest {
    pub fn address_input(&self) -> AddressInput {
        AddressInput {
            address: self.address.clone(),
            city: self.city.clone(),
            state: self.state.clone(),
            zip: self.zip.clone(),
        }
    }

    pub fn batch_record(&self) -> BatchRecord {
        BatchRecord {
            address: self.address.trim().to_string(),
            city: self.city.trim().to_string(),
            state: self.state.trim().to_ascii_uppercase(),
            first_name: non_blank(self.owner_first_name.as_deref()),
            last_name: non_blank(self.owner_last_name.as_deref()),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub caller_id: String,
    pub address_fingerprint: String,
    pub canonical_address: String,
    /// Street line as submitted; bulk results are matched against it.
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub status: TraceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulk_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ContactResult>,
    pub cost_cents: i64,
    pub charge_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TraceRecord {
    pub fn new_pending(
        caller_id: &str,
        request: &TraceRequest,
        canonical: &CanonicalAddress,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            trace_id: format!("trc_{}", uuid::Uuid::now_v7()),
            caller_id: caller_id.to_string(),
            address_fingerprint: canonical.fingerprint.clone(),
            canonical_address: canonical.canonical.clone(),
            street: request.address.trim().to_string(),
            city: canonical.city.clone(),
            state: canonical.state.clone(),
            zip: canonical.zip5.clone(),
            status: TraceStatus::Pending,
            provider_job_id: None,
            bulk_job_id: None,
            result: None,
            cost_cents: 0,
            charge_cents: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.result.as_ref().is_some_and(ContactResult::has_contact)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkJob {
    pub bulk_job_id: String,
    pub caller_id: String,
    pub status: BulkJobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_job_id: Option<String>,
    pub total_records: i64,
    pub dedupe_removed: i64,
    pub records_submitted: i64,
    pub records_matched: i64,
    pub records_rejected: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Answer to a single-trace submission or status check.
#[derive(Debug, Clone, Serialize)]
pub struct TraceOutcome {
    pub trace_id: String,
    pub status: TraceStatus,
    /// Served from the dedup cache; never charged.
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ContactResult>,
    pub charge_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TraceOutcome {
    pub fn from_record(record: &TraceRecord, cached: bool) -> Self {
        let message = match record.status {
            TraceStatus::Pending | TraceStatus::Processing => {
                Some("still processing; check back later".to_string())
            }
            TraceStatus::Error => record.error_message.clone(),
            _ => None,
        };
        Self {
            trace_id: record.trace_id.clone(),
            status: record.status,
            cached,
            result: record.result.clone(),
            charge_cents: if cached { 0 } else { record.charge_cents },
            message,
        }
    }
}
