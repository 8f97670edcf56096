use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::address::{self, CanonicalAddress};
use crate::billing::BillingService;
use crate::bulk::supervisor::BulkSupervisor;
use crate::provider::TraceProvider;
use crate::provider::parse::{match_key, parse_result};
use crate::provider::types::{BatchRecord, PollOutcome, ProviderRow};
use crate::trace::TraceError;
use crate::trace::service::DEFAULT_PENDING_TIMEOUT;
use crate::trace::cache::{DedupCache, Fingerprinted, remove_internal_duplicates};
use crate::trace::lifecycle::TraceLifecycle;
use crate::trace::store::TraceStore;
use crate::trace::types::{BulkJob, BulkJobStatus, TraceRecord, TraceRequest, TraceStatus};

pub const DEFAULT_MAX_RECORDS: usize = 10_000;

#[derive(Debug, Clone, Deserialize)]
pub struct BulkSubmitRequest {
    pub records: Vec<TraceRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    pub row_index: usize,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedRow {
    pub row_index: usize,
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkSubmitResponse {
    /// Absent when nothing new had to be submitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulk_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BulkJobStatus>,
    pub total_records: usize,
    pub internal_duplicates: usize,
    pub history_duplicates: usize,
    pub dedupe_removed: usize,
    pub records_submitted: usize,
    pub records_rejected: usize,
    pub rejected: Vec<RejectedRow>,
    pub cached: Vec<CachedRow>,
}

struct BulkItem {
    row_index: usize,
    request: TraceRequest,
    canonical: CanonicalAddress,
}

impl Fingerprinted for BulkItem {
    fn fingerprint(&self) -> &str {
        &self.canonical.fingerprint
    }
}

type MatchKey = (String, String, String);

/// Many-record submissions: one provider batch per job, fanned back in by
/// address text when the job is polled.
#[derive(Clone)]
pub struct BulkService {
    store: Arc<dyn TraceStore>,
    cache: DedupCache,
    provider: Arc<dyn TraceProvider>,
    billing: BillingService,
    lifecycle: TraceLifecycle,
    max_records: usize,
    pending_timeout: Duration,
    supervisor: Option<BulkSupervisor>,
}

impl BulkService {
    pub fn new(
        store: Arc<dyn TraceStore>,
        cache: DedupCache,
        provider: Arc<dyn TraceProvider>,
        billing: BillingService,
        lifecycle: TraceLifecycle,
        max_records: usize,
    ) -> Self {
        Self {
            store,
            cache,
            provider,
            billing,
            lifecycle,
            max_records,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            supervisor: None,
        }
    }

    pub fn with_pending_timeout(mut self, pending_timeout: Duration) -> Self {
        self.pending_timeout = pending_timeout;
        self
    }

    pub fn with_supervisor(mut self, supervisor: BulkSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn supervisor(&self) -> Option<&BulkSupervisor> {
        self.supervisor.as_ref()
    }

    pub async fn submit(
        &self,
        caller_id: &str,
        request: BulkSubmitRequest,
    ) -> Result<BulkSubmitResponse, TraceError> {
        let total_records = request.records.len();
        if total_records == 0 {
            return Err(TraceError::InvalidRequest(
                "records must not be empty".to_string(),
            ));
        }
        if total_records > self.max_records {
            return Err(TraceError::InvalidRequest(format!(
                "at most {} records per submission",
                self.max_records
            )));
        }

        let mut rejected = Vec::new();
        let mut items = Vec::with_capacity(total_records);
        for (row_index, trace_request) in request.records.into_iter().enumerate() {
            let input = trace_request.address_input();
            match address::validate(&input) {
                Ok(()) => items.push(BulkItem {
                    row_index,
                    canonical: address::canonicalize(&input),
                    request: trace_request,
                }),
                Err(error) => rejected.push(RejectedRow {
                    row_index,
                    field: error.field.as_str().to_string(),
                    message: error.message,
                }),
            }
        }

        let (unique, internal_duplicates) = remove_internal_duplicates(items);
        let partition = self.cache.lookup_batch(caller_id, unique).await?;
        let history_duplicates = partition.cached.len();
        let cached = partition
            .cached
            .iter()
            .map(|(item, record)| CachedRow {
                row_index: item.row_index,
                trace_id: record.trace_id.clone(),
            })
            .collect::<Vec<_>>();
        let new_items = partition.new;

        let mut response = BulkSubmitResponse {
            bulk_job_id: None,
            status: None,
            total_records,
            internal_duplicates,
            history_duplicates,
            dedupe_removed: internal_duplicates + history_duplicates,
            records_submitted: 0,
            records_rejected: rejected.len(),
            rejected,
            cached,
        };
        if new_items.is_empty() {
            tracing::info!(
                caller_id,
                total_records,
                dedupe_removed = response.dedupe_removed,
                "bulk submission fully deduplicated"
            );
            return Ok(response);
        }

        self.billing
            .ensure_funds(caller_id, new_items.len() as u64)
            .await?;

        let fingerprints = new_items
            .iter()
            .map(|item| item.canonical.fingerprint.clone())
            .collect::<Vec<_>>();
        self.store.delete_failed(caller_id, &fingerprints).await?;

        let now = Utc::now();
        let job = self
            .store
            .insert_bulk_job(BulkJob {
                bulk_job_id: format!("bulk_{}", uuid::Uuid::now_v7()),
                caller_id: caller_id.to_string(),
                status: BulkJobStatus::Pending,
                provider_job_id: None,
                total_records: total_records as i64,
                dedupe_removed: response.dedupe_removed as i64,
                records_submitted: new_items.len() as i64,
                records_matched: 0,
                records_rejected: response.records_rejected as i64,
                error_message: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            })
            .await?;

        let batch = new_items
            .iter()
            .map(|item| item.request.batch_record())
            .collect::<Vec<_>>();
        let records = new_items
            .iter()
            .map(|item| {
                let mut record =
                    TraceRecord::new_pending(caller_id, &item.request, &item.canonical, now);
                record.status = TraceStatus::Processing;
                record.bulk_job_id = Some(job.bulk_job_id.clone());
                record
            })
            .collect::<Vec<_>>();
        // Runs detached so a dropped request cannot strand the job in `pending`
        // or leave it unsupervised.
        let service = self.clone();
        let handoff = tokio::spawn(async move {
            let job = hand_off_batch(
                Arc::clone(&service.store),
                Arc::clone(&service.provider),
                job,
                batch,
                records,
            )
            .await?;
            if let Some(supervisor) = &service.supervisor {
                supervisor
                    .watch(service.clone(), &job.caller_id, &job.bulk_job_id)
                    .await;
            }
            Ok::<_, TraceError>(job)
        });
        let job = handoff.await.map_err(|error| {
            TraceError::Internal(format!("bulk handoff task failed: {error}"))
        })??;
        tracing::info!(
            caller_id,
            bulk_job_id = %job.bulk_job_id,
            records_submitted = new_items.len(),
            dedupe_removed = response.dedupe_removed,
            "bulk job submitted"
        );

        response.bulk_job_id = Some(job.bulk_job_id);
        response.status = Some(job.status);
        response.records_submitted = new_items.len();
        Ok(response)
    }

    pub async fn get_job(&self, caller_id: &str, bulk_job_id: &str) -> Result<BulkJob, TraceError> {
        let job = self
            .store
            .get_bulk_job(bulk_job_id)
            .await?
            .filter(|job| job.caller_id == caller_id)
            .ok_or(TraceError::NotFound)?;
        if job.status == BulkJobStatus::Pending && self.is_abandoned(&job) {
            return self.expire_abandoned(job).await;
        }
        Ok(job)
    }

    fn is_abandoned(&self, job: &BulkJob) -> bool {
        (Utc::now() - job.updated_at).to_std().unwrap_or_default() >= self.pending_timeout
    }

    /// Fails a job whose submission never reached the provider handoff's end.
    async fn expire_abandoned(&self, job: BulkJob) -> Result<BulkJob, TraceError> {
        match self
            .store
            .mark_bulk_job_failed(&job.bulk_job_id, "provider submission abandoned", Utc::now())
            .await?
        {
            Some(failed) => {
                tracing::warn!(
                    caller_id = %failed.caller_id,
                    bulk_job_id = %failed.bulk_job_id,
                    "expired abandoned pending bulk job"
                );
                Ok(failed)
            }
            None => self
                .store
                .get_bulk_job(&job.bulk_job_id)
                .await?
                .ok_or(TraceError::NotFound),
        }
    }

    /// Server-driven poll: pulls the provider's current result set and, once
    /// it is ready, applies every row, sweeps stragglers and completes the job.
    pub async fn poll(&self, caller_id: &str, bulk_job_id: &str) -> Result<BulkJob, TraceError> {
        let job = self.get_job(caller_id, bulk_job_id).await?;
        if job.status != BulkJobStatus::Processing {
            return Ok(job);
        }
        let Some(provider_job_id) = job.provider_job_id.clone() else {
            return Ok(job);
        };
        match self.provider.poll(&provider_job_id).await? {
            PollOutcome::Pending => Ok(job),
            PollOutcome::Ready(rows) => self.reconcile(job, rows).await,
        }
    }

    async fn reconcile(&self, job: BulkJob, rows: Vec<ProviderRow>) -> Result<BulkJob, TraceError> {
        let open = self
            .store
            .list_for_bulk(&job.bulk_job_id, Some(TraceStatus::Processing))
            .await?;
        let (pairs, unmatched) = pair_rows(open, &rows);
        if unmatched > 0 {
            tracing::warn!(
                bulk_job_id = %job.bulk_job_id,
                unmatched,
                "provider rows matched no open trace record"
            );
        }
        for (record, row) in pairs {
            self.lifecycle
                .complete(&record, Some(parse_result(row)))
                .await?;
        }

        let stragglers = self
            .store
            .list_for_bulk(&job.bulk_job_id, Some(TraceStatus::Processing))
            .await?;
        let mut swept = 0_usize;
        for record in &stragglers {
            if self.lifecycle.sweep(record).await?.is_some() {
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::info!(
                bulk_job_id = %job.bulk_job_id,
                swept,
                "swept unreturned bulk records to no_match"
            );
        }

        let matched = self
            .store
            .list_for_bulk(&job.bulk_job_id, Some(TraceStatus::Success))
            .await?
            .len();
        let completed = match self
            .store
            .complete_bulk_job(&job.bulk_job_id, matched as i64, Utc::now())
            .await?
        {
            Some(completed) => {
                tracing::info!(
                    caller_id = %completed.caller_id,
                    bulk_job_id = %completed.bulk_job_id,
                    records_matched = completed.records_matched,
                    "bulk job completed"
                );
                completed
            }
            None => self
                .store
                .get_bulk_job(&job.bulk_job_id)
                .await?
                .ok_or(TraceError::NotFound)?,
        };
        if let Some(supervisor) = &self.supervisor {
            supervisor.cancel(&completed.bulk_job_id).await;
        }
        Ok(completed)
    }

    /// Read-only projection over the job's trace records.
    pub async fn records(
        &self,
        caller_id: &str,
        bulk_job_id: &str,
    ) -> Result<Vec<TraceRecord>, TraceError> {
        let job = self.get_job(caller_id, bulk_job_id).await?;
        Ok(self.store.list_for_bulk(&job.bulk_job_id, None).await?)
    }

    /// Fails jobs left `pending` by a previous process and re-attaches pollers
    /// to jobs left `processing`.
    pub async fn resume_supervision(&self) -> Result<usize, TraceError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.pending_timeout).unwrap_or(chrono::Duration::zero());
        for job in self.store.list_stale_pending_bulk_jobs(cutoff).await? {
            self.expire_abandoned(job).await?;
        }
        let Some(supervisor) = &self.supervisor else {
            return Ok(0);
        };
        let jobs = self.store.list_processing_bulk_jobs().await?;
        let mut resumed = 0;
        for job in jobs {
            if supervisor
                .watch(self.clone(), &job.caller_id, &job.bulk_job_id)
                .await
            {
                resumed += 1;
            }
        }
        Ok(resumed)
    }
}

/// Submits a pending job's batch to the provider and attaches its records.
async fn hand_off_batch(
    store: Arc<dyn TraceStore>,
    provider: Arc<dyn TraceProvider>,
    job: BulkJob,
    batch: Vec<BatchRecord>,
    mut records: Vec<TraceRecord>,
) -> Result<BulkJob, TraceError> {
    let receipt = match provider.submit(&batch).await {
        Ok(receipt) => receipt,
        Err(error) => {
            tracing::warn!(
                caller_id = %job.caller_id,
                bulk_job_id = %job.bulk_job_id,
                reason = %error,
                "provider rejected bulk batch"
            );
            store
                .mark_bulk_job_failed(&job.bulk_job_id, &error.to_string(), Utc::now())
                .await?;
            return Err(error.into());
        }
    };
    for record in &mut records {
        record.provider_job_id = Some(receipt.provider_job_id.clone());
    }
    match store
        .attach_bulk_submission(&job.bulk_job_id, &receipt.provider_job_id, records, Utc::now())
        .await
    {
        Ok(job) => {
            tracing::info!(
                caller_id = %job.caller_id,
                bulk_job_id = %job.bulk_job_id,
                provider_job_id = %receipt.provider_job_id,
                "bulk batch accepted by provider"
            );
            Ok(job)
        }
        Err(error) => {
            tracing::warn!(
                caller_id = %job.caller_id,
                bulk_job_id = %job.bulk_job_id,
                provider_job_id = %receipt.provider_job_id,
                reason = %error,
                "provider accepted bulk batch but job left pending"
            );
            Err(error.into())
        }
    }
}

/// Pairs provider rows with open records sharing their address key.
///
/// Records are taken oldest first; within a key, rows carrying contact data
/// are used before rows without, each in provider order. A row pairs with at
/// most one record and vice versa. Returns the pairs and the count of rows
/// left without a record.
fn pair_rows(
    mut open: Vec<TraceRecord>,
    rows: &[ProviderRow],
) -> (Vec<(TraceRecord, &ProviderRow)>, usize) {
    open.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.trace_id.cmp(&b.trace_id))
    });
    let mut records_by_key: HashMap<MatchKey, VecDeque<TraceRecord>> = HashMap::new();
    for record in open {
        records_by_key
            .entry(match_key(&record.street, &record.city, &record.state))
            .or_default()
            .push_back(record);
    }

    let mut key_order: Vec<MatchKey> = Vec::new();
    let mut rows_by_key: HashMap<MatchKey, Vec<&ProviderRow>> = HashMap::new();
    let mut unmatched = 0;
    for row in rows {
        let Some(key) = row.match_key() else {
            unmatched += 1;
            continue;
        };
        let bucket = rows_by_key.entry(key.clone()).or_default();
        if bucket.is_empty() {
            key_order.push(key);
        }
        bucket.push(row);
    }

    let mut pairs = Vec::new();
    for key in key_order {
        let Some(mut bucket) = rows_by_key.remove(&key) else {
            continue;
        };
        bucket.sort_by_key(|row| !row.has_contact_fields());
        let mut records = records_by_key.remove(&key).unwrap_or_default();
        for row in bucket {
            match records.pop_front() {
                Some(record) => pairs.push((record, row)),
                None => unmatched += 1,
            }
        }
    }
    (pairs, unmatched)
}
