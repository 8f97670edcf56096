use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::address::{self, ValidationError};
use crate::billing::{BillingError, BillingService};
use crate::provider::TraceProvider;
use crate::provider::types::{BatchRecord, PollOutcome, ProviderError};
use crate::trace::cache::DedupCache;
use crate::trace::lifecycle::{TraceLifecycle, result_for};
use crate::trace::store::{TraceStore, TraceStoreError};
use crate::trace::types::{TraceOutcome, TraceRecord, TraceRequest, TraceStatus};

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("insufficient funds: required {required_cents}, available {available_cents}")]
    InsufficientFunds {
        required_cents: i64,
        available_cents: i64,
    },
    #[error("provider rate limited; retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("provider submission failed: {0}")]
    Submission(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl TraceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::RateLimited { .. } => "rate_limited",
            Self::Submission(_) => "provider_submission_failed",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Submission(message)
            | Self::ProviderUnavailable(message)
            | Self::InvalidRequest(message)
            | Self::Conflict(message)
            | Self::Internal(message) => message.clone(),
            Self::NotFound => "not found".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<TraceStoreError> for TraceError {
    fn from(error: TraceStoreError) -> Self {
        match error {
            TraceStoreError::Conflict(message) => Self::Conflict(message),
            TraceStoreError::NotFound(_) => Self::NotFound,
            TraceStoreError::Db(message) => Self::Internal(message),
        }
    }
}

impl From<BillingError> for TraceError {
    fn from(error: BillingError) -> Self {
        match error {
            BillingError::InsufficientFunds {
                required_cents,
                available_cents,
            } => Self::InsufficientFunds {
                required_cents,
                available_cents,
            },
            BillingError::InvalidRequest(message) => Self::InvalidRequest(message),
            BillingError::Internal(message) => Self::Internal(message),
        }
    }
}

impl From<ProviderError> for TraceError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::RateLimited { retry_after_ms } => Self::RateLimited { retry_after_ms },
            ProviderError::Submission(message) | ProviderError::Format(message) => {
                Self::Submission(message)
            }
            ProviderError::Transport(message) => Self::ProviderUnavailable(message),
        }
    }
}

/// Single-trace poll schedule: a warm-up delay, then a fixed interval.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(8_000),
            interval: Duration::from_millis(3_000),
            max_attempts: 10,
        }
    }
}

/// How long a record may sit in `pending` before it is treated as abandoned.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TraceService {
    store: Arc<dyn TraceStore>,
    cache: DedupCache,
    provider: Arc<dyn TraceProvider>,
    billing: BillingService,
    lifecycle: TraceLifecycle,
    polling: PollPolicy,
    pending_timeout: Duration,
}

impl TraceService {
    pub fn new(
        store: Arc<dyn TraceStore>,
        cache: DedupCache,
        provider: Arc<dyn TraceProvider>,
        billing: BillingService,
        lifecycle: TraceLifecycle,
    ) -> Self {
        Self::new_with_polling(store, cache, provider, billing, lifecycle, PollPolicy::default())
    }

    pub fn new_with_polling(
        store: Arc<dyn TraceStore>,
        cache: DedupCache,
        provider: Arc<dyn TraceProvider>,
        billing: BillingService,
        lifecycle: TraceLifecycle,
        polling: PollPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            provider,
            billing,
            lifecycle,
            polling,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }

    pub fn with_pending_timeout(mut self, pending_timeout: Duration) -> Self {
        self.pending_timeout = pending_timeout;
        self
    }

    /// Validates, consults the cache, gates on funds and hands one address to
    /// the provider. Returns a cached result or a `processing` handle.
    pub async fn submit(
        &self,
        caller_id: &str,
        request: &TraceRequest,
    ) -> Result<TraceOutcome, TraceError> {
        let input = request.address_input();
        address::validate(&input)?;
        let canonical = address::canonicalize(&input);

        if let Some(cached) = self
            .cache
            .lookup_single(caller_id, &canonical.fingerprint)
            .await?
        {
            tracing::info!(caller_id, trace_id = %cached.trace_id, "trace served from cache");
            return Ok(TraceOutcome::from_record(&cached, true));
        }

        if let Some(active) = self
            .store
            .find_active(caller_id, &canonical.fingerprint)
            .await?
        {
            let active = self.expire_if_abandoned(active).await?;
            if active.status.is_active() {
                return Ok(TraceOutcome::from_record(&active, false));
            }
        }

        self.billing.ensure_funds(caller_id, 1).await?;

        let removed = self
            .store
            .delete_failed(caller_id, std::slice::from_ref(&canonical.fingerprint))
            .await?;
        if removed > 0 {
            tracing::info!(caller_id, removed, "cleared failed traces before retry");
        }

        let record = TraceRecord::new_pending(caller_id, request, &canonical, Utc::now());
        let record = match self.store.insert_active(record).await {
            Ok(record) => record,
            Err(TraceStoreError::Conflict(_)) => {
                // A concurrent submission for the same address won the insert.
                let active = self
                    .store
                    .find_active(caller_id, &canonical.fingerprint)
                    .await?
                    .ok_or_else(|| {
                        TraceError::Conflict("trace for address changed concurrently".to_string())
                    })?;
                return Ok(TraceOutcome::from_record(&active, false));
            }
            Err(error) => return Err(error.into()),
        };

        // Runs detached so a dropped request cannot strand the record in `pending`.
        let handoff = tokio::spawn(hand_off(
            Arc::clone(&self.store),
            Arc::clone(&self.provider),
            record,
            request.batch_record(),
        ));
        let record = handoff.await.map_err(|error| {
            TraceError::Internal(format!("provider handoff task failed: {error}"))
        })??;
        Ok(TraceOutcome::from_record(&record, false))
    }

    /// A `pending` record older than the pending timeout lost its submission
    /// (process exit or a failed store write) and is moved to `error`.
    async fn expire_if_abandoned(&self, record: TraceRecord) -> Result<TraceRecord, TraceError> {
        if record.status != TraceStatus::Pending {
            return Ok(record);
        }
        let age = (Utc::now() - record.updated_at)
            .to_std()
            .unwrap_or_default();
        if age < self.pending_timeout {
            return Ok(record);
        }
        match self
            .store
            .mark_error(&record.trace_id, "provider submission abandoned", Utc::now())
            .await
        {
            Ok(expired) => {
                tracing::warn!(
                    caller_id = %expired.caller_id,
                    trace_id = %expired.trace_id,
                    age_ms = age.as_millis() as u64,
                    "expired abandoned pending trace"
                );
                Ok(expired)
            }
            // The submission finished in the meantime.
            Err(TraceStoreError::Conflict(_)) => self
                .store
                .get(&record.trace_id)
                .await?
                .ok_or(TraceError::NotFound),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn get_record(
        &self,
        caller_id: &str,
        trace_id: &str,
    ) -> Result<TraceRecord, TraceError> {
        self.store
            .get(trace_id)
            .await?
            .filter(|record| record.caller_id == caller_id)
            .ok_or(TraceError::NotFound)
    }

    /// Status check. A single-trace record still `processing` is polled once;
    /// bulk members are left to the bulk poller.
    pub async fn status(&self, caller_id: &str, trace_id: &str) -> Result<TraceOutcome, TraceError> {
        let record = self.get_record(caller_id, trace_id).await?;
        let record = self.expire_if_abandoned(record).await?;
        let record = self.poll_once(record).await?;
        Ok(TraceOutcome::from_record(&record, false))
    }

    async fn poll_once(&self, record: TraceRecord) -> Result<TraceRecord, TraceError> {
        if record.status != TraceStatus::Processing || record.bulk_job_id.is_some() {
            return Ok(record);
        }
        let Some(provider_job_id) = record.provider_job_id.clone() else {
            return Ok(record);
        };
        match self.provider.poll(&provider_job_id).await? {
            PollOutcome::Pending => Ok(record),
            PollOutcome::Ready(rows) => {
                let result = result_for(&rows, &record);
                self.lifecycle.complete(&record, result).await
            }
        }
    }

    /// Submits and then polls on the bounded schedule. Running out of attempts
    /// leaves the record `processing` and reports it as such.
    pub async fn submit_and_wait(
        &self,
        caller_id: &str,
        request: &TraceRequest,
    ) -> Result<TraceOutcome, TraceError> {
        let outcome = self.submit(caller_id, request).await?;
        if outcome.status != TraceStatus::Processing {
            return Ok(outcome);
        }
        let mut record = self.get_record(caller_id, &outcome.trace_id).await?;
        if record.bulk_job_id.is_some() {
            return Ok(outcome);
        }

        tokio::time::sleep(self.polling.initial_delay).await;
        for attempt in 1..=self.polling.max_attempts {
            let mut delay = self.polling.interval;
            match self.poll_once(record.clone()).await {
                Ok(updated) => {
                    record = updated;
                    if record.status.is_terminal() {
                        return Ok(TraceOutcome::from_record(&record, false));
                    }
                }
                Err(TraceError::RateLimited { retry_after_ms }) => {
                    delay = delay.max(Duration::from_millis(retry_after_ms));
                    tracing::info!(caller_id, trace_id = %record.trace_id, attempt, retry_after_ms, "poll rate limited");
                }
                Err(error) => {
                    tracing::warn!(caller_id, trace_id = %record.trace_id, attempt, reason = %error, "poll attempt failed");
                }
            }
            if attempt < self.polling.max_attempts {
                tokio::time::sleep(delay).await;
            }
        }

        tracing::info!(
            caller_id,
            trace_id = %record.trace_id,
            attempts = self.polling.max_attempts,
            "trace still processing after bounded polling"
        );
        Ok(TraceOutcome::from_record(&record, false))
    }

    /// Operator cache clear: deletes a terminal record so the next request
    /// resubmits.
    pub async fn clear(&self, caller_id: &str, trace_id: &str) -> Result<(), TraceError> {
        let record = self.get_record(caller_id, trace_id).await?;
        let record = self.expire_if_abandoned(record).await?;
        if record.status.is_active() {
            return Err(TraceError::Conflict(
                "trace is still in progress".to_string(),
            ));
        }
        if !self.store.delete(trace_id).await? {
            return Err(TraceError::NotFound);
        }
        tracing::info!(caller_id, trace_id, "trace cleared");
        Ok(())
    }
}

/// Submits one pending record to the provider and records the outcome.
async fn hand_off(
    store: Arc<dyn TraceStore>,
    provider: Arc<dyn TraceProvider>,
    record: TraceRecord,
    batch_record: BatchRecord,
) -> Result<TraceRecord, TraceError> {
    match provider.submit(&[batch_record]).await {
        Ok(receipt) => {
            let record = match store
                .mark_processing(&record.trace_id, &receipt.provider_job_id, Utc::now())
                .await
            {
                Ok(record) => record,
                Err(error) => {
                    tracing::warn!(
                        caller_id = %record.caller_id,
                        trace_id = %record.trace_id,
                        provider_job_id = %receipt.provider_job_id,
                        reason = %error,
                        "provider accepted trace but record left pending"
                    );
                    return Err(error.into());
                }
            };
            tracing::info!(
                caller_id = %record.caller_id,
                trace_id = %record.trace_id,
                provider_job_id = %receipt.provider_job_id,
                "trace submitted"
            );
            Ok(record)
        }
        Err(error) => {
            tracing::warn!(
                caller_id = %record.caller_id,
                trace_id = %record.trace_id,
                reason = %error,
                "provider submission failed"
            );
            store
                .mark_error(&record.trace_id, &error.to_string(), Utc::now())
                .await?;
            Err(error.into())
        }
    }
}
