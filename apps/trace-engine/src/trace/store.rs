use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::TraceDb;
use crate::provider::types::ContactResult;
use crate::trace::types::{BulkJob, BulkJobStatus, TraceRecord, TraceStatus};

#[derive(Debug, thiserror::Error)]
pub enum TraceStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Terminal disposition applied to a `processing` record.
#[derive(Debug, Clone)]
pub struct TraceFinalization {
    pub status: TraceStatus,
    pub result: Option<ContactResult>,
    pub cost_cents: i64,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Inserts a new active record. `Conflict` when the caller already has an
    /// active record for the same fingerprint.
    async fn insert_active(&self, record: TraceRecord) -> Result<TraceRecord, TraceStoreError>;

    async fn get(&self, trace_id: &str) -> Result<Option<TraceRecord>, TraceStoreError>;

    async fn find_active(
        &self,
        caller_id: &str,
        fingerprint: &str,
    ) -> Result<Option<TraceRecord>, TraceStoreError>;

    /// `success` records for the fingerprints created at or after `since`, newest first.
    async fn list_successes(
        &self,
        caller_id: &str,
        fingerprints: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<TraceRecord>, TraceStoreError>;

    /// Deletes `no_match`/`error` records for the fingerprints; returns the count.
    async fn delete_failed(
        &self,
        caller_id: &str,
        fingerprints: &[String],
    ) -> Result<u64, TraceStoreError>;

    async fn delete(&self, trace_id: &str) -> Result<bool, TraceStoreError>;

    async fn mark_processing(
        &self,
        trace_id: &str,
        provider_job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TraceRecord, TraceStoreError>;

    async fn mark_error(
        &self,
        trace_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<TraceRecord, TraceStoreError>;

    /// Moves a `processing` record to a terminal state. `None` when the record
    /// was no longer processing, so exactly one caller wins each transition.
    async fn finalize(
        &self,
        trace_id: &str,
        finalization: TraceFinalization,
    ) -> Result<Option<TraceRecord>, TraceStoreError>;

    async fn set_charge(
        &self,
        trace_id: &str,
        charge_cents: i64,
    ) -> Result<TraceRecord, TraceStoreError>;

    async fn list_for_bulk(
        &self,
        bulk_job_id: &str,
        status: Option<TraceStatus>,
    ) -> Result<Vec<TraceRecord>, TraceStoreError>;

    async fn insert_bulk_job(&self, job: BulkJob) -> Result<BulkJob, TraceStoreError>;

    async fn get_bulk_job(&self, bulk_job_id: &str) -> Result<Option<BulkJob>, TraceStoreError>;

    /// Moves a `pending` job to `processing` and inserts its `processing`
    /// records in one step. Any active record for the same (caller,
    /// fingerprint) is re-pointed at the job instead of duplicated.
    /// `Conflict` when the job is no longer pending.
    async fn attach_bulk_submission(
        &self,
        bulk_job_id: &str,
        provider_job_id: &str,
        records: Vec<TraceRecord>,
        now: DateTime<Utc>,
    ) -> Result<BulkJob, TraceStoreError>;

    /// `pending` → `failed`; `None` when the job already left `pending`.
    async fn mark_bulk_job_failed(
        &self,
        bulk_job_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BulkJob>, TraceStoreError>;

    /// `processing` → `completed`; `None` when another poller already completed it.
    async fn complete_bulk_job(
        &self,
        bulk_job_id: &str,
        records_matched: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<BulkJob>, TraceStoreError>;

    async fn list_processing_bulk_jobs(&self) -> Result<Vec<BulkJob>, TraceStoreError>;

    /// `pending` jobs last touched before `updated_before`.
    async fn list_stale_pending_bulk_jobs(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<BulkJob>, TraceStoreError>;
}

pub fn memory() -> Arc<dyn TraceStore> {
    Arc::new(MemoryTraceStore::default())
}

pub fn postgres(db: Arc<TraceDb>) -> Arc<dyn TraceStore> {
    Arc::new(PostgresTraceStore { db })
}

#[derive(Default)]
struct MemoryTraceStore {
    inner: Mutex<MemoryTraceStoreInner>,
}

#[derive(Default)]
struct MemoryTraceStoreInner {
    records: HashMap<String, TraceRecord>,
    bulk_jobs: HashMap<String, BulkJob>,
}

impl MemoryTraceStoreInner {
    fn active_id(&self, caller_id: &str, fingerprint: &str) -> Option<String> {
        self.records
            .values()
            .find(|record| {
                record.caller_id == caller_id
                    && record.address_fingerprint == fingerprint
                    && record.status.is_active()
            })
            .map(|record| record.trace_id.clone())
    }

    fn record_mut(&mut self, trace_id: &str) -> Result<&mut TraceRecord, TraceStoreError> {
        self.records
            .get_mut(trace_id)
            .ok_or_else(|| TraceStoreError::NotFound("trace record".to_string()))
    }

    fn bulk_job_mut(&mut self, bulk_job_id: &str) -> Result<&mut BulkJob, TraceStoreError> {
        self.bulk_jobs
            .get_mut(bulk_job_id)
            .ok_or_else(|| TraceStoreError::NotFound("bulk job".to_string()))
    }

    fn upsert_bulk_records(&mut self, records: Vec<TraceRecord>) -> Result<(), TraceStoreError> {
        for record in records {
            match self.active_id(&record.caller_id, &record.address_fingerprint) {
                Some(existing_id) => {
                    let existing = self.record_mut(&existing_id)?;
                    existing.status = TraceStatus::Processing;
                    existing.provider_job_id.clone_from(&record.provider_job_id);
                    existing.bulk_job_id.clone_from(&record.bulk_job_id);
                    existing.street.clone_from(&record.street);
                    existing.updated_at = record.updated_at;
                }
                None => {
                    self.records.insert(record.trace_id.clone(), record);
                }
            }
        }
        Ok(())
    }
}

fn sort_oldest_first(records: &mut [TraceRecord]) {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.trace_id.cmp(&b.trace_id))
    });
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn insert_active(&self, record: TraceRecord) -> Result<TraceRecord, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .active_id(&record.caller_id, &record.address_fingerprint)
            .is_some()
        {
            return Err(TraceStoreError::Conflict(
                "active trace already exists for address".to_string(),
            ));
        }
        inner
            .records
            .insert(record.trace_id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, trace_id: &str) -> Result<Option<TraceRecord>, TraceStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.records.get(trace_id).cloned())
    }

    async fn find_active(
        &self,
        caller_id: &str,
        fingerprint: &str,
    ) -> Result<Option<TraceRecord>, TraceStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .active_id(caller_id, fingerprint)
            .and_then(|trace_id| inner.records.get(&trace_id).cloned()))
    }

    async fn list_successes(
        &self,
        caller_id: &str,
        fingerprints: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<TraceRecord>, TraceStoreError> {
        let inner = self.inner.lock().await;
        let mut out = inner
            .records
            .values()
            .filter(|record| {
                record.caller_id == caller_id
                    && record.status == TraceStatus::Success
                    && record.created_at >= since
                    && fingerprints.contains(&record.address_fingerprint)
            })
            .cloned()
            .collect::<Vec<_>>();
        sort_oldest_first(&mut out);
        out.reverse();
        Ok(out)
    }

    async fn delete_failed(
        &self,
        caller_id: &str,
        fingerprints: &[String],
    ) -> Result<u64, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.records.len();
        inner.records.retain(|_, record| {
            !(record.caller_id == caller_id
                && record.status.is_failed()
                && fingerprints.contains(&record.address_fingerprint))
        });
        Ok((before - inner.records.len()) as u64)
    }

    async fn delete(&self, trace_id: &str) -> Result<bool, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.records.remove(trace_id).is_some())
    }

    async fn mark_processing(
        &self,
        trace_id: &str,
        provider_job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TraceRecord, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.record_mut(trace_id)?;
        if record.status != TraceStatus::Pending {
            return Err(TraceStoreError::Conflict(format!(
                "trace is {}, expected pending",
                record.status.as_str()
            )));
        }
        record.status = TraceStatus::Processing;
        record.provider_job_id = Some(provider_job_id.to_string());
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn mark_error(
        &self,
        trace_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<TraceRecord, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.record_mut(trace_id)?;
        if record.status != TraceStatus::Pending {
            return Err(TraceStoreError::Conflict(format!(
                "trace is {}, expected pending",
                record.status.as_str()
            )));
        }
        record.status = TraceStatus::Error;
        record.error_message = Some(message.to_string());
        record.updated_at = now;
        record.completed_at = Some(now);
        Ok(record.clone())
    }

    async fn finalize(
        &self,
        trace_id: &str,
        finalization: TraceFinalization,
    ) -> Result<Option<TraceRecord>, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.record_mut(trace_id)?;
        if record.status != TraceStatus::Processing {
            return Ok(None);
        }
        record.status = finalization.status;
        record.result = finalization.result;
        record.cost_cents = finalization.cost_cents;
        record.updated_at = finalization.now;
        record.completed_at = Some(finalization.now);
        Ok(Some(record.clone()))
    }

    async fn set_charge(
        &self,
        trace_id: &str,
        charge_cents: i64,
    ) -> Result<TraceRecord, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.record_mut(trace_id)?;
        record.charge_cents = charge_cents;
        Ok(record.clone())
    }

    async fn list_for_bulk(
        &self,
        bulk_job_id: &str,
        status: Option<TraceStatus>,
    ) -> Result<Vec<TraceRecord>, TraceStoreError> {
        let inner = self.inner.lock().await;
        let mut out = inner
            .records
            .values()
            .filter(|record| {
                record.bulk_job_id.as_deref() == Some(bulk_job_id)
                    && status.is_none_or(|status| record.status == status)
            })
            .cloned()
            .collect::<Vec<_>>();
        sort_oldest_first(&mut out);
        Ok(out)
    }

    async fn insert_bulk_job(&self, job: BulkJob) -> Result<BulkJob, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.bulk_jobs.contains_key(&job.bulk_job_id) {
            return Err(TraceStoreError::Conflict("bulk job exists".to_string()));
        }
        inner.bulk_jobs.insert(job.bulk_job_id.clone(), job.clone());
        Ok(job)
    }

    async fn get_bulk_job(&self, bulk_job_id: &str) -> Result<Option<BulkJob>, TraceStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.bulk_jobs.get(bulk_job_id).cloned())
    }

    async fn attach_bulk_submission(
        &self,
        bulk_job_id: &str,
        provider_job_id: &str,
        records: Vec<TraceRecord>,
        now: DateTime<Utc>,
    ) -> Result<BulkJob, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        let status = inner.bulk_job_mut(bulk_job_id)?.status;
        if status != BulkJobStatus::Pending {
            return Err(TraceStoreError::Conflict(format!(
                "bulk job is {}, expected pending",
                status.as_str()
            )));
        }
        inner.upsert_bulk_records(records)?;
        let job = inner.bulk_job_mut(bulk_job_id)?;
        job.status = BulkJobStatus::Processing;
        job.provider_job_id = Some(provider_job_id.to_string());
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn mark_bulk_job_failed(
        &self,
        bulk_job_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BulkJob>, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.bulk_job_mut(bulk_job_id)?;
        if job.status != BulkJobStatus::Pending {
            return Ok(None);
        }
        job.status = BulkJobStatus::Failed;
        job.error_message = Some(message.to_string());
        job.updated_at = now;
        job.completed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete_bulk_job(
        &self,
        bulk_job_id: &str,
        records_matched: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<BulkJob>, TraceStoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.bulk_job_mut(bulk_job_id)?;
        if job.status != BulkJobStatus::Processing {
            return Ok(None);
        }
        job.status = BulkJobStatus::Completed;
        job.records_matched = records_matched;
        job.updated_at = now;
        job.completed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn list_processing_bulk_jobs(&self) -> Result<Vec<BulkJob>, TraceStoreError> {
        let inner = self.inner.lock().await;
        let mut out = inner
            .bulk_jobs
            .values()
            .filter(|job| job.status == BulkJobStatus::Processing)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn list_stale_pending_bulk_jobs(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<BulkJob>, TraceStoreError> {
        let inner = self.inner.lock().await;
        let mut out = inner
            .bulk_jobs
            .values()
            .filter(|job| job.status == BulkJobStatus::Pending && job.updated_at < updated_before)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}

struct PostgresTraceStore {
    db: Arc<TraceDb>,
}

const RECORD_COLUMNS: &str = "trace_id, caller_id, address_fingerprint, canonical_address, street, \
     city, state, zip, status, provider_job_id, bulk_job_id, result_json, cost_cents, \
     charge_cents, error_message, created_at, updated_at, completed_at";

const BULK_JOB_COLUMNS: &str = "bulk_job_id, caller_id, status, provider_job_id, total_records, \
     dedupe_removed, records_submitted, records_matched, records_rejected, error_message, \
     created_at, updated_at, completed_at";

fn db_error(error: tokio_postgres::Error) -> TraceStoreError {
    if error.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
        TraceStoreError::Conflict(error.to_string())
    } else {
        TraceStoreError::Db(error.to_string())
    }
}

fn result_json(result: Option<&ContactResult>) -> Result<Option<Value>, TraceStoreError> {
    result
        .map(serde_json::to_value)
        .transpose()
        .map_err(|error| TraceStoreError::Db(error.to_string()))
}

#[async_trait]
impl TraceStore for PostgresTraceStore {
    async fn insert_active(&self, record: TraceRecord) -> Result<TraceRecord, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let result = result_json(record.result.as_ref())?;
        client
            .execute(
                r#"
                INSERT INTO trace.trace_records (
                    trace_id, caller_id, address_fingerprint, canonical_address, street,
                    city, state, zip, status, provider_job_id, bulk_job_id, result_json,
                    cost_cents, charge_cents, error_message, created_at, updated_at, completed_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18
                )
                "#,
                &[
                    &record.trace_id,
                    &record.caller_id,
                    &record.address_fingerprint,
                    &record.canonical_address,
                    &record.street,
                    &record.city,
                    &record.state,
                    &record.zip,
                    &record.status.as_str(),
                    &record.provider_job_id,
                    &record.bulk_job_id,
                    &result,
                    &record.cost_cents,
                    &record.charge_cents,
                    &record.error_message,
                    &record.created_at,
                    &record.updated_at,
                    &record.completed_at,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(record)
    }

    async fn get(&self, trace_id: &str) -> Result<Option<TraceRecord>, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!("SELECT {RECORD_COLUMNS} FROM trace.trace_records WHERE trace_id = $1")
                    .as_str(),
                &[&trace_id],
            )
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(map_record_row)
            .transpose()
            .map_err(TraceStoreError::Db)
    }

    async fn find_active(
        &self,
        caller_id: &str,
        fingerprint: &str,
    ) -> Result<Option<TraceRecord>, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!(
                    "SELECT {RECORD_COLUMNS} FROM trace.trace_records \
                     WHERE caller_id = $1 AND address_fingerprint = $2 \
                       AND status IN ('pending', 'processing')"
                )
                .as_str(),
                &[&caller_id, &fingerprint],
            )
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(map_record_row)
            .transpose()
            .map_err(TraceStoreError::Db)
    }

    async fn list_successes(
        &self,
        caller_id: &str,
        fingerprints: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<TraceRecord>, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                format!(
                    "SELECT {RECORD_COLUMNS} FROM trace.trace_records \
                     WHERE caller_id = $1 AND address_fingerprint = ANY($2) \
                       AND status = 'success' AND created_at >= $3 \
                     ORDER BY created_at DESC, trace_id DESC"
                )
                .as_str(),
                &[&caller_id, &fingerprints, &since],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_record_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(TraceStoreError::Db)
    }

    async fn delete_failed(
        &self,
        caller_id: &str,
        fingerprints: &[String],
    ) -> Result<u64, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                DELETE FROM trace.trace_records
                 WHERE caller_id = $1
                   AND address_fingerprint = ANY($2)
                   AND status IN ('no_match', 'error')
                "#,
                &[&caller_id, &fingerprints],
            )
            .await
            .map_err(db_error)
    }

    async fn delete(&self, trace_id: &str) -> Result<bool, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let deleted = client
            .execute(
                "DELETE FROM trace.trace_records WHERE trace_id = $1",
                &[&trace_id],
            )
            .await
            .map_err(db_error)?;
        Ok(deleted > 0)
    }

    async fn mark_processing(
        &self,
        trace_id: &str,
        provider_job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TraceRecord, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!(
                    r#"
                    UPDATE trace.trace_records
                       SET status = 'processing', provider_job_id = $2, updated_at = $3
                     WHERE trace_id = $1 AND status = 'pending'
                    RETURNING {RECORD_COLUMNS}
                    "#
                )
                .as_str(),
                &[&trace_id, &provider_job_id, &now],
            )
            .await
            .map_err(db_error)?;
        let Some(row) = row else {
            return Err(TraceStoreError::Conflict(
                "trace is not pending".to_string(),
            ));
        };
        map_record_row(&row).map_err(TraceStoreError::Db)
    }

    async fn mark_error(
        &self,
        trace_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<TraceRecord, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!(
                    r#"
                    UPDATE trace.trace_records
                       SET status = 'error', error_message = $2, updated_at = $3, completed_at = $3
                     WHERE trace_id = $1 AND status = 'pending'
                    RETURNING {RECORD_COLUMNS}
                    "#
                )
                .as_str(),
                &[&trace_id, &message, &now],
            )
            .await
            .map_err(db_error)?;
        let Some(row) = row else {
            return Err(TraceStoreError::Conflict(
                "trace is not pending".to_string(),
            ));
        };
        map_record_row(&row).map_err(TraceStoreError::Db)
    }

    async fn finalize(
        &self,
        trace_id: &str,
        finalization: TraceFinalization,
    ) -> Result<Option<TraceRecord>, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let result = result_json(finalization.result.as_ref())?;
        let row = client
            .query_opt(
                format!(
                    r#"
                    UPDATE trace.trace_records
                       SET status = $2, result_json = $3, cost_cents = $4,
                           updated_at = $5, completed_at = $5
                     WHERE trace_id = $1 AND status = 'processing'
                    RETURNING {RECORD_COLUMNS}
                    "#
                )
                .as_str(),
                &[
                    &trace_id,
                    &finalization.status.as_str(),
                    &result,
                    &finalization.cost_cents,
                    &finalization.now,
                ],
            )
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(map_record_row)
            .transpose()
            .map_err(TraceStoreError::Db)
    }

    async fn set_charge(
        &self,
        trace_id: &str,
        charge_cents: i64,
    ) -> Result<TraceRecord, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!(
                    "UPDATE trace.trace_records SET charge_cents = $2 WHERE trace_id = $1 \
                     RETURNING {RECORD_COLUMNS}"
                )
                .as_str(),
                &[&trace_id, &charge_cents],
            )
            .await
            .map_err(db_error)?;
        let Some(row) = row else {
            return Err(TraceStoreError::NotFound("trace record".to_string()));
        };
        map_record_row(&row).map_err(TraceStoreError::Db)
    }

    async fn list_for_bulk(
        &self,
        bulk_job_id: &str,
        status: Option<TraceStatus>,
    ) -> Result<Vec<TraceRecord>, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let status = status.map(TraceStatus::as_str);
        let rows = client
            .query(
                format!(
                    "SELECT {RECORD_COLUMNS} FROM trace.trace_records \
                     WHERE bulk_job_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
                     ORDER BY created_at ASC, trace_id ASC"
                )
                .as_str(),
                &[&bulk_job_id, &status],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_record_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(TraceStoreError::Db)
    }

    async fn insert_bulk_job(&self, job: BulkJob) -> Result<BulkJob, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO trace.bulk_jobs (
                    bulk_job_id, caller_id, status, provider_job_id, total_records,
                    dedupe_removed, records_submitted, records_matched, records_rejected,
                    error_message, created_at, updated_at, completed_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13
                )
                "#,
                &[
                    &job.bulk_job_id,
                    &job.caller_id,
                    &job.status.as_str(),
                    &job.provider_job_id,
                    &job.total_records,
                    &job.dedupe_removed,
                    &job.records_submitted,
                    &job.records_matched,
                    &job.records_rejected,
                    &job.error_message,
                    &job.created_at,
                    &job.updated_at,
                    &job.completed_at,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(job)
    }

    async fn get_bulk_job(&self, bulk_job_id: &str) -> Result<Option<BulkJob>, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!("SELECT {BULK_JOB_COLUMNS} FROM trace.bulk_jobs WHERE bulk_job_id = $1")
                    .as_str(),
                &[&bulk_job_id],
            )
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(map_bulk_job_row)
            .transpose()
            .map_err(TraceStoreError::Db)
    }

    async fn attach_bulk_submission(
        &self,
        bulk_job_id: &str,
        provider_job_id: &str,
        records: Vec<TraceRecord>,
        now: DateTime<Utc>,
    ) -> Result<BulkJob, TraceStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;
        let row = tx
            .query_opt(
                format!(
                    r#"
                    UPDATE trace.bulk_jobs
                       SET status = 'processing', provider_job_id = $2, updated_at = $3
                     WHERE bulk_job_id = $1 AND status = 'pending'
                    RETURNING {BULK_JOB_COLUMNS}
                    "#
                )
                .as_str(),
                &[&bulk_job_id, &provider_job_id, &now],
            )
            .await
            .map_err(db_error)?;
        let Some(row) = row else {
            return Err(TraceStoreError::Conflict(
                "bulk job is not pending".to_string(),
            ));
        };
        let job = map_bulk_job_row(&row).map_err(TraceStoreError::Db)?;

        let statement = r#"
            INSERT INTO trace.trace_records (
                trace_id, caller_id, address_fingerprint, canonical_address, street,
                city, state, zip, status, provider_job_id, bulk_job_id,
                cost_cents, charge_cents, created_at, updated_at
            ) VALUES (
                $1,$2,$3,$4,$5,$6,$7,$8,'processing',$9,$10,0,0,$11,$11
            )
            ON CONFLICT (caller_id, address_fingerprint)
                WHERE status IN ('pending', 'processing')
            DO UPDATE SET status = 'processing',
                          provider_job_id = EXCLUDED.provider_job_id,
                          bulk_job_id = EXCLUDED.bulk_job_id,
                          street = EXCLUDED.street,
                          updated_at = EXCLUDED.updated_at
            "#;
        for record in &records {
            tx.execute(
                statement,
                &[
                    &record.trace_id,
                    &record.caller_id,
                    &record.address_fingerprint,
                    &record.canonical_address,
                    &record.street,
                    &record.city,
                    &record.state,
                    &record.zip,
                    &record.provider_job_id,
                    &record.bulk_job_id,
                    &record.created_at,
                ],
            )
            .await
            .map_err(db_error)?;
        }
        tx.commit().await.map_err(db_error)?;
        Ok(job)
    }

    async fn mark_bulk_job_failed(
        &self,
        bulk_job_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BulkJob>, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!(
                    r#"
                    UPDATE trace.bulk_jobs
                       SET status = 'failed', error_message = $2, updated_at = $3, completed_at = $3
                     WHERE bulk_job_id = $1 AND status = 'pending'
                    RETURNING {BULK_JOB_COLUMNS}
                    "#
                )
                .as_str(),
                &[&bulk_job_id, &message, &now],
            )
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(map_bulk_job_row)
            .transpose()
            .map_err(TraceStoreError::Db)
    }

    async fn complete_bulk_job(
        &self,
        bulk_job_id: &str,
        records_matched: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<BulkJob>, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!(
                    r#"
                    UPDATE trace.bulk_jobs
                       SET status = 'completed', records_matched = $2,
                           updated_at = $3, completed_at = $3
                     WHERE bulk_job_id = $1 AND status = 'processing'
                    RETURNING {BULK_JOB_COLUMNS}
                    "#
                )
                .as_str(),
                &[&bulk_job_id, &records_matched, &now],
            )
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(map_bulk_job_row)
            .transpose()
            .map_err(TraceStoreError::Db)
    }

    async fn list_processing_bulk_jobs(&self) -> Result<Vec<BulkJob>, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                format!(
                    "SELECT {BULK_JOB_COLUMNS} FROM trace.bulk_jobs \
                     WHERE status = 'processing' ORDER BY created_at ASC"
                )
                .as_str(),
                &[],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_bulk_job_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(TraceStoreError::Db)
    }

    async fn list_stale_pending_bulk_jobs(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<BulkJob>, TraceStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                format!(
                    "SELECT {BULK_JOB_COLUMNS} FROM trace.bulk_jobs \
                     WHERE status = 'pending' AND updated_at < $1 ORDER BY created_at ASC"
                )
                .as_str(),
                &[&updated_before],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_bulk_job_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(TraceStoreError::Db)
    }
}

fn map_record_row(row: &tokio_postgres::Row) -> Result<TraceRecord, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    let result: Option<Value> = row.try_get("result_json").map_err(|e| e.to_string())?;
    Ok(TraceRecord {
        trace_id: row.try_get("trace_id").map_err(|e| e.to_string())?,
        caller_id: row.try_get("caller_id").map_err(|e| e.to_string())?,
        address_fingerprint: row
            .try_get("address_fingerprint")
            .map_err(|e| e.to_string())?,
        canonical_address: row
            .try_get("canonical_address")
            .map_err(|e| e.to_string())?,
        street: row.try_get("street").map_err(|e| e.to_string())?,
        city: row.try_get("city").map_err(|e| e.to_string())?,
        state: row.try_get("state").map_err(|e| e.to_string())?,
        zip: row.try_get("zip").map_err(|e| e.to_string())?,
        status: TraceStatus::parse(&status).ok_or_else(|| format!("unknown status {status}"))?,
        provider_job_id: row
            .try_get("provider_job_id")
            .map_err(|e| e.to_string())?,
        bulk_job_id: row.try_get("bulk_job_id").map_err(|e| e.to_string())?,
        result: result
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| e.to_string())?,
        cost_cents: row.try_get("cost_cents").map_err(|e| e.to_string())?,
        charge_cents: row.try_get("charge_cents").map_err(|e| e.to_string())?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
        completed_at: row.try_get("completed_at").map_err(|e| e.to_string())?,
    })
}

fn map_bulk_job_row(row: &tokio_postgres::Row) -> Result<BulkJob, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    Ok(BulkJob {
        bulk_job_id: row.try_get("bulk_job_id").map_err(|e| e.to_string())?,
        caller_id: row.try_get("caller_id").map_err(|e| e.to_string())?,
        status: BulkJobStatus::parse(&status)
            .ok_or_else(|| format!("unknown bulk status {status}"))?,
        provider_job_id: row
            .try_get("provider_job_id")
            .map_err(|e| e.to_string())?,
        total_records: row.try_get("total_records").map_err(|e| e.to_string())?,
        dedupe_removed: row.try_get("dedupe_removed").map_err(|e| e.to_string())?,
        records_submitted: row
            .try_get("records_submitted")
            .map_err(|e| e.to_string())?,
        records_matched: row
            .try_get("records_matched")
            .map_err(|e| e.to_string())?,
        records_rejected: row
            .try_get("records_rejected")
            .map_err(|e| e.to_string())?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
        completed_at: row.try_get("completed_at").map_err(|e| e.to_string())?,
    })
}
