use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rejected submission: {0}")]
    Submission(String),
    #[error("provider rate limited; retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("unexpected provider response shape: {0}")]
    Format(String),
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Submission(_) => "provider_submission_failed",
            Self::RateLimited { .. } => "provider_rate_limited",
            Self::Transport(_) => "provider_unreachable",
            Self::Format(_) => "provider_format_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneKind {
    Primary,
    Mobile,
    Landline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub number: String,
    pub kind: PhoneKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailingAddress {
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

/// Internal contact result. Provider sentinels never reach this type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactResult {
    pub owner_names: Vec<String>,
    pub phones: Vec<PhoneNumber>,
    pub emails: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailing_address: Option<MailingAddress>,
    pub confidence: u8,
}

impl ContactResult {
    pub fn has_contact(&self) -> bool {
        !self.phones.is_empty() || !self.emails.is_empty()
    }
}

/// One address handed to the provider in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub address: String,
    pub city: String,
    pub state: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// A flat provider result row, kept as the raw JSON object until parsed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ProviderRow(pub Map<String, Value>);

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Pending,
    Ready(Vec<ProviderRow>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub provider_job_id: String,
    pub padded: bool,
}
