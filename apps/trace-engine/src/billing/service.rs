use std::sync::Arc;

use chrono::Utc;

use crate::billing::store::{DebitOutcome, LedgerMutation, WalletStore, WalletStoreError};
use crate::billing::types::{
    ChargeOutcome, ChargeQuote, LedgerEntry, PricingTable, WalletAccount, WalletSettings,
};
use crate::hooks::TraceHooks;

const MAX_LEDGER_PAGE: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("insufficient funds: required {required_cents}, available {available_cents}")]
    InsufficientFunds {
        required_cents: i64,
        available_cents: i64,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InsufficientFunds { .. } => self.to_string(),
            Self::InvalidRequest(message) | Self::Internal(message) => message.clone(),
        }
    }
}

/// Funds gate, charge-on-success and the wallet collaborator contract.
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn WalletStore>,
    pricing: PricingTable,
    hooks: Arc<dyn TraceHooks>,
}

impl BillingService {
    pub fn new(store: Arc<dyn WalletStore>, hooks: Arc<dyn TraceHooks>) -> Self {
        Self::new_with_pricing(store, hooks, PricingTable::default())
    }

    pub fn new_with_pricing(
        store: Arc<dyn WalletStore>,
        hooks: Arc<dyn TraceHooks>,
        pricing: PricingTable,
    ) -> Self {
        Self {
            store,
            pricing,
            hooks,
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// The caller's wallet; callers without one read as an empty standard account.
    pub async fn account(&self, caller_id: &str) -> Result<WalletAccount, BillingError> {
        Ok(self
            .store
            .get_account(caller_id)
            .await
            .map_err(map_store_error)?
            .unwrap_or_else(|| WalletAccount::empty(caller_id, Utc::now())))
    }

    pub async fn check_balance(&self, caller_id: &str) -> Result<i64, BillingError> {
        Ok(self.account(caller_id).await?.balance_cents)
    }

    pub async fn quote(
        &self,
        caller_id: &str,
        record_count: u64,
    ) -> Result<ChargeQuote, BillingError> {
        let account = self.account(caller_id).await?;
        let rate_cents = self.pricing.rate_for(account.tier);
        let count = i64::try_from(record_count)
            .map_err(|_| BillingError::InvalidRequest("record count too large".to_string()))?;
        Ok(ChargeQuote {
            tier: account.tier,
            rate_cents,
            record_count,
            required_cents: rate_cents.saturating_mul(count),
            available_cents: account.balance_cents,
        })
    }

    /// Rejects when the balance cannot cover `record_count` successes at the
    /// caller's own rate.
    pub async fn ensure_funds(
        &self,
        caller_id: &str,
        record_count: u64,
    ) -> Result<ChargeQuote, BillingError> {
        let quote = self.quote(caller_id, record_count).await?;
        if quote.available_cents < quote.required_cents {
            tracing::info!(
                caller_id,
                required_cents = quote.required_cents,
                available_cents = quote.available_cents,
                "funds gate rejected submission"
            );
            return Err(BillingError::InsufficientFunds {
                required_cents: quote.required_cents,
                available_cents: quote.available_cents,
            });
        }
        Ok(quote)
    }

    /// Debits the caller's success rate for `trace_id`, at most once per trace.
    pub async fn charge_trace(
        &self,
        caller_id: &str,
        trace_id: &str,
    ) -> Result<ChargeOutcome, BillingError> {
        let account = self.account(caller_id).await?;
        let amount_cents = self.pricing.rate_for(account.tier);
        if amount_cents <= 0 {
            return Err(BillingError::InvalidRequest(format!(
                "{} rate must be positive",
                account.tier.as_str()
            )));
        }
        let outcome = self
            .store
            .debit(LedgerMutation {
                entry_id: format!("led_{}", uuid::Uuid::now_v7()),
                caller_id: caller_id.to_string(),
                amount_cents,
                reason: format!("trace {trace_id} success"),
                trace_id: Some(trace_id.to_string()),
                created_at: Utc::now(),
            })
            .await;

        match outcome {
            Ok(DebitOutcome::Debited { entry, account }) => {
                if entry.balance_before_cents >= account.low_balance_threshold_cents
                    && entry.balance_after_cents < account.low_balance_threshold_cents
                {
                    tracing::info!(
                        caller_id,
                        balance_cents = account.balance_cents,
                        threshold_cents = account.low_balance_threshold_cents,
                        "wallet crossed low balance threshold"
                    );
                    self.hooks.low_balance(&account, &entry);
                }
                Ok(ChargeOutcome::Charged(entry))
            }
            Ok(DebitOutcome::AlreadyDebited(entry)) => Ok(ChargeOutcome::AlreadyCharged(entry)),
            Ok(DebitOutcome::InsufficientFunds { balance_cents }) => {
                Ok(ChargeOutcome::Rejected { balance_cents })
            }
            // Lost a concurrent insert on the per-trace debit index.
            Err(WalletStoreError::Conflict(_)) => {
                let existing = self
                    .store
                    .debit_for_trace(trace_id)
                    .await
                    .map_err(map_store_error)?
                    .ok_or_else(|| {
                        BillingError::Internal("debit conflict without ledger entry".to_string())
                    })?;
                Ok(ChargeOutcome::AlreadyCharged(existing))
            }
            Err(error) => Err(map_store_error(error)),
        }
    }

    pub async fn credit(
        &self,
        caller_id: &str,
        amount_cents: i64,
        reason: &str,
    ) -> Result<LedgerEntry, BillingError> {
        if caller_id.trim().is_empty() {
            return Err(BillingError::InvalidRequest(
                "caller_id is required".to_string(),
            ));
        }
        if amount_cents <= 0 {
            return Err(BillingError::InvalidRequest(
                "amount_cents must be positive".to_string(),
            ));
        }
        let reason = match reason.trim() {
            "" => "credit",
            reason => reason,
        };
        let (entry, account) = self
            .store
            .credit(LedgerMutation {
                entry_id: format!("led_{}", uuid::Uuid::now_v7()),
                caller_id: caller_id.to_string(),
                amount_cents,
                reason: reason.to_string(),
                trace_id: None,
                created_at: Utc::now(),
            })
            .await
            .map_err(map_store_error)?;
        tracing::info!(
            caller_id,
            amount_cents,
            balance_cents = account.balance_cents,
            "wallet credited"
        );
        Ok(entry)
    }

    pub async fn configure_account(
        &self,
        caller_id: &str,
        settings: WalletSettings,
    ) -> Result<WalletAccount, BillingError> {
        if settings.low_balance_threshold_cents < 0 || settings.auto_rebill_amount_cents < 0 {
            return Err(BillingError::InvalidRequest(
                "wallet settings must not be negative".to_string(),
            ));
        }
        self.store
            .put_settings(caller_id, settings, Utc::now())
            .await
            .map_err(map_store_error)
    }

    pub async fn ledger(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, BillingError> {
        self.store
            .list_ledger(caller_id, limit.clamp(1, MAX_LEDGER_PAGE))
            .await
            .map_err(map_store_error)
    }

    pub async fn debit_for_trace(
        &self,
        trace_id: &str,
    ) -> Result<Option<LedgerEntry>, BillingError> {
        self.store
            .debit_for_trace(trace_id)
            .await
            .map_err(map_store_error)
    }
}

fn map_store_error(error: WalletStoreError) -> BillingError {
    match error {
        WalletStoreError::Conflict(message) => BillingError::InvalidRequest(message),
        WalletStoreError::NotFound(message) => BillingError::InvalidRequest(message),
        WalletStoreError::Db(message) => BillingError::Internal(message),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{Result, anyhow};

    use super::*;
    use crate::billing::store;
    use crate::billing::types::{CallerTier, LedgerKind};
    use crate::test_support::RecordingHooks;

    fn service() -> (BillingService, Arc<RecordingHooks>) {
        let hooks = Arc::new(RecordingHooks::default());
        (BillingService::new(store::memory(), hooks.clone()), hooks)
    }

    #[tokio::test]
    async fn gate_rejects_balance_below_single_rate() -> Result<()> {
        let (billing, _) = service();
        billing.credit("caller_a", 5, "seed").await?;
        match billing.ensure_funds("caller_a", 1).await {
            Err(BillingError::InsufficientFunds {
                required_cents,
                available_cents,
            }) => {
                assert_eq!(required_cents, 11);
                assert_eq!(available_cents, 5);
            }
            other => return Err(anyhow!("expected insufficient funds, got {other:?}")),
        }
        Ok(())
    }

    #[tokio::test]
    async fn premium_tier_uses_discounted_rate_for_gate_and_charge() -> Result<()> {
        let (billing, _) = service();
        billing
            .configure_account(
                "caller_p",
                WalletSettings {
                    tier: CallerTier::Premium,
                    ..WalletSettings::default()
                },
            )
            .await?;
        billing.credit("caller_p", 21, "seed").await?;
        let quote = billing.ensure_funds("caller_p", 3).await?;
        assert_eq!(quote.rate_cents, 7);
        assert_eq!(quote.required_cents, 21);
        assert!(billing.ensure_funds("caller_p", 4).await.is_err());

        let ChargeOutcome::Charged(entry) = billing.charge_trace("caller_p", "trc_1").await? else {
            return Err(anyhow!("expected charge"));
        };
        assert_eq!(entry.amount_cents, 7);
        assert_eq!(entry.balance_after_cents, 14);
        Ok(())
    }

    #[tokio::test]
    async fn second_charge_for_same_trace_returns_existing_entry() -> Result<()> {
        let (billing, _) = service();
        billing.credit("caller_a", 100, "seed").await?;
        let ChargeOutcome::Charged(first) = billing.charge_trace("caller_a", "trc_1").await? else {
            return Err(anyhow!("expected charge"));
        };
        let second = billing.charge_trace("caller_a", "trc_1").await?;
        assert_eq!(second, ChargeOutcome::AlreadyCharged(first));
        assert_eq!(billing.check_balance("caller_a").await?, 89);
        Ok(())
    }

    #[tokio::test]
    async fn debit_never_drives_balance_negative() -> Result<()> {
        let (billing, _) = service();
        billing.credit("caller_a", 15, "seed").await?;
        let mut tasks = Vec::new();
        for index in 0..8 {
            let billing = billing.clone();
            tasks.push(tokio::spawn(async move {
                billing.charge_trace("caller_a", &format!("trc_{index}")).await
            }));
        }
        let mut charged = 0;
        for task in tasks {
            if matches!(task.await??, ChargeOutcome::Charged(_)) {
                charged += 1;
            }
        }
        assert_eq!(charged, 1);
        assert_eq!(billing.check_balance("caller_a").await?, 4);

        let ledger = billing.ledger("caller_a", 50).await?;
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].kind, LedgerKind::Debit);
        assert_eq!(ledger[0].balance_before_cents, 15);
        assert_eq!(ledger[0].balance_after_cents, 4);
        assert_eq!(ledger[1].kind, LedgerKind::Credit);
        Ok(())
    }

    #[tokio::test]
    async fn low_balance_hook_fires_when_threshold_is_crossed() -> Result<()> {
        let (billing, hooks) = service();
        billing
            .configure_account(
                "caller_a",
                WalletSettings {
                    tier: CallerTier::Standard,
                    low_balance_threshold_cents: 20,
                    auto_rebill_enabled: true,
                    auto_rebill_amount_cents: 1_000,
                },
            )
            .await?;
        billing.credit("caller_a", 35, "seed").await?;
        billing.charge_trace("caller_a", "trc_1").await?;
        assert!(hooks.low_balance.lock().map_err(|_| anyhow!("poisoned"))?.is_empty());
        billing.charge_trace("caller_a", "trc_2").await?;
        billing.charge_trace("caller_a", "trc_3").await?;
        let fired = hooks.low_balance.lock().map_err(|_| anyhow!("poisoned"))?.clone();
        assert_eq!(fired, vec![("caller_a".to_string(), 13)]);
        Ok(())
    }

    #[tokio::test]
    async fn zero_rate_is_rejected_without_ledger_entry() -> Result<()> {
        let billing = BillingService::new_with_pricing(
            store::memory(),
            Arc::new(RecordingHooks::default()),
            PricingTable {
                standard_rate_cents: 0,
                premium_rate_cents: 0,
                provider_cost_cents: 4,
            },
        );
        billing.credit("caller_a", 50, "seed").await?;
        assert!(matches!(
            billing.charge_trace("caller_a", "trc_1").await,
            Err(BillingError::InvalidRequest(_))
        ));
        assert!(billing.debit_for_trace("trc_1").await?.is_none());
        assert_eq!(billing.check_balance("caller_a").await?, 50);
        Ok(())
    }

    #[tokio::test]
    async fn credit_rejects_non_positive_amounts() -> Result<()> {
        let (billing, _) = service();
        assert!(matches!(
            billing.credit("caller_a", 0, "oops").await,
            Err(BillingError::InvalidRequest(_))
        ));
        assert_eq!(billing.check_balance("caller_a").await?, 0);
        Ok(())
    }
}
