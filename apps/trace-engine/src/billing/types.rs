use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerTier {
    #[default]
    Standard,
    Premium,
}

impl CallerTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "standard" => Some(Self::Standard),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Debit,
    Credit,
}

impl LedgerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "debit" => Some(Self::Debit),
            "credit" => Some(Self::Credit),
            _ => None,
        }
    }
}

/// Per-success prices in cents, keyed by caller tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingTable {
    pub standard_rate_cents: i64,
    pub premium_rate_cents: i64,
    /// What the provider bills us for one matched record.
    pub provider_cost_cents: i64,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            standard_rate_cents: 11,
            premium_rate_cents: 7,
            provider_cost_cents: 4,
        }
    }
}

impl PricingTable {
    pub fn rate_for(&self, tier: CallerTier) -> i64 {
        match tier {
            CallerTier::Standard => self.standard_rate_cents,
            CallerTier::Premium => self.premium_rate_cents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAccount {
    pub caller_id: String,
    pub balance_cents: i64,
    pub tier: CallerTier,
    pub low_balance_threshold_cents: i64,
    pub auto_rebill_enabled: bool,
    pub auto_rebill_amount_cents: i64,
    pub updated_at: DateTime<Utc>,
}

impl WalletAccount {
    /// Shape reported for callers that have never been credited.
    pub fn empty(caller_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            caller_id: caller_id.to_string(),
            balance_cents: 0,
            tier: CallerTier::Standard,
            low_balance_threshold_cents: 0,
            auto_rebill_enabled: false,
            auto_rebill_amount_cents: 0,
            updated_at: now,
        }
    }
}

/// Account settings owned by the caller profile. Never carries a balance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSettings {
    #[serde(default)]
    pub tier: CallerTier,
    #[serde(default)]
    pub low_balance_threshold_cents: i64,
    #[serde(default)]
    pub auto_rebill_enabled: bool,
    #[serde(default)]
    pub auto_rebill_amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub caller_id: String,
    pub kind: LedgerKind,
    pub amount_cents: i64,
    pub balance_before_cents: i64,
    pub balance_after_cents: i64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeQuote {
    pub tier: CallerTier,
    pub rate_cents: i64,
    pub record_count: u64,
    pub required_cents: i64,
    pub available_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Charged(LedgerEntry),
    /// A debit for this trace already exists; nothing new was written.
    AlreadyCharged(LedgerEntry),
    Rejected { balance_cents: i64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditRequest {
    pub amount_cents: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerResponse {
    pub caller_id: String,
    pub entries: Vec<LedgerEntry>,
}
