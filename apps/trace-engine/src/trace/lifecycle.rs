use std::sync::Arc;

use chrono::Utc;

use crate::billing::BillingService;
use crate::billing::types::ChargeOutcome;
use crate::hooks::TraceHooks;
use crate::provider::parse::{match_key, parse_result};
use crate::provider::types::{ContactResult, ProviderRow};
use crate::trace::service::TraceError;
use crate::trace::store::{TraceFinalization, TraceStore};
use crate::trace::types::{TraceRecord, TraceStatus};

/// Terminal transitions for `processing` records and the billing step tied to
/// them. Every path into `success`, `no_match` or a sweep goes through here.
#[derive(Clone)]
pub struct TraceLifecycle {
    store: Arc<dyn TraceStore>,
    billing: BillingService,
    hooks: Arc<dyn TraceHooks>,
    provider_cost_cents: i64,
}

impl TraceLifecycle {
    pub fn new(
        store: Arc<dyn TraceStore>,
        billing: BillingService,
        hooks: Arc<dyn TraceHooks>,
    ) -> Self {
        let provider_cost_cents = billing.pricing().provider_cost_cents;
        Self {
            store,
            billing,
            hooks,
            provider_cost_cents,
        }
    }

    /// Applies a provider row (or its absence) to a `processing` record.
    pub async fn complete(
        &self,
        record: &TraceRecord,
        result: Option<ContactResult>,
    ) -> Result<TraceRecord, TraceError> {
        let successful = result.as_ref().is_some_and(ContactResult::has_contact);
        let finalization = TraceFinalization {
            status: if successful {
                TraceStatus::Success
            } else {
                TraceStatus::NoMatch
            },
            cost_cents: if successful {
                self.provider_cost_cents
            } else {
                0
            },
            result,
            now: Utc::now(),
        };
        let Some(finalized) = self
            .store
            .finalize(&record.trace_id, finalization)
            .await
            .map_err(TraceError::from)?
        else {
            // Another poller already moved it; report what it decided.
            return self
                .store
                .get(&record.trace_id)
                .await?
                .ok_or(TraceError::NotFound);
        };

        if finalized.status != TraceStatus::Success {
            tracing::info!(
                caller_id = %finalized.caller_id,
                trace_id = %finalized.trace_id,
                "trace completed without contact data"
            );
            return Ok(finalized);
        }

        let finalized = self.charge(finalized).await?;
        self.hooks.trace_succeeded(&finalized);
        Ok(finalized)
    }

    /// Forces a straggler to `no_match` with no charge.
    pub async fn sweep(&self, record: &TraceRecord) -> Result<Option<TraceRecord>, TraceError> {
        Ok(self
            .store
            .finalize(
                &record.trace_id,
                TraceFinalization {
                    status: TraceStatus::NoMatch,
                    result: None,
                    cost_cents: 0,
                    now: Utc::now(),
                },
            )
            .await?)
    }

    async fn charge(&self, record: TraceRecord) -> Result<TraceRecord, TraceError> {
        let outcome = self
            .billing
            .charge_trace(&record.caller_id, &record.trace_id)
            .await;
        let charge_cents = match outcome {
            Ok(ChargeOutcome::Charged(entry) | ChargeOutcome::AlreadyCharged(entry)) => {
                entry.amount_cents
            }
            Ok(ChargeOutcome::Rejected { balance_cents }) => {
                tracing::warn!(
                    caller_id = %record.caller_id,
                    trace_id = %record.trace_id,
                    balance_cents,
                    "debit rejected after successful trace; charge left at 0"
                );
                return Ok(record);
            }
            Err(error) => {
                tracing::warn!(
                    caller_id = %record.caller_id,
                    trace_id = %record.trace_id,
                    reason = %error,
                    "debit failed after successful trace; charge left at 0"
                );
                return Ok(record);
            }
        };
        Ok(self
            .store
            .set_charge(&record.trace_id, charge_cents)
            .await?)
    }
}

/// Picks the row for one submitted address: among rows whose address text
/// matches (all rows when none do), the first with contact data, else the first.
pub fn select_row<'a>(rows: &'a [ProviderRow], record: &TraceRecord) -> Option<&'a ProviderRow> {
    let key = match_key(&record.street, &record.city, &record.state);
    let matching = rows
        .iter()
        .filter(|row| row.match_key().as_ref() == Some(&key))
        .collect::<Vec<_>>();
    let candidates = if matching.is_empty() {
        rows.iter().collect::<Vec<_>>()
    } else {
        matching
    };
    candidates
        .iter()
        .find(|row| row.has_contact_fields())
        .or_else(|| candidates.first())
        .copied()
}

pub fn result_for(rows: &[ProviderRow], record: &TraceRecord) -> Option<ContactResult> {
    select_row(rows, record).map(parse_result)
}
