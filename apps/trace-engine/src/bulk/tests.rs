use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use super::service::BulkService;
use super::{BulkPollPolicy, BulkSubmitRequest};
use crate::test_support::{StubScript, TestEngine, austin_request, phone_fields, spawn_engine};
use crate::trace::TraceError;
use crate::trace::types::{BulkJob, BulkJobStatus, TraceRequest, TraceStatus};

const CALLER: &str = "caller_a";

fn street(n: usize) -> String {
    format!("{n} Oak St")
}

fn requests(range: impl IntoIterator<Item = usize>) -> Vec<TraceRequest> {
    range
        .into_iter()
        .map(|n| austin_request(&street(n)))
        .collect()
}

fn script_with_contacts(range: impl IntoIterator<Item = usize>) -> StubScript {
    range.into_iter().fold(StubScript::default(), |script, n| {
        script.with_contact(&street(n), phone_fields(&format!("512555{n:04}")))
    })
}

async fn submit_and_complete(
    engine: &TestEngine,
    records: Vec<TraceRequest>,
) -> Result<super::BulkSubmitResponse> {
    let response = engine
        .bulk
        .submit(CALLER, BulkSubmitRequest { records })
        .await?;
    let bulk_job_id = response
        .bulk_job_id
        .clone()
        .ok_or_else(|| anyhow!("expected a bulk job"))?;
    let job = engine.bulk.poll(CALLER, &bulk_job_id).await?;
    assert_eq!(job.status, BulkJobStatus::Completed);
    Ok(response)
}

#[tokio::test]
async fn duplicates_in_batch_and_history_are_removed_before_submission() -> Result<()> {
    let engine = spawn_engine(script_with_contacts(1..=95), None).await?;
    engine.billing.credit(CALLER, 2_000, "seed").await?;
    submit_and_complete(&engine, requests(1..=10)).await?;
    assert_eq!(engine.billing.check_balance(CALLER).await?, 2_000 - 110);

    let mut records = requests(1..=95);
    records.extend(requests(11..=15));
    let response = engine
        .bulk
        .submit(CALLER, BulkSubmitRequest { records })
        .await?;
    assert_eq!(response.total_records, 100);
    assert_eq!(response.internal_duplicates, 5);
    assert_eq!(response.history_duplicates, 10);
    assert_eq!(response.dedupe_removed, 15);
    assert_eq!(response.records_submitted, 85);
    assert_eq!(response.cached.len(), 10);
    assert_eq!(response.status, Some(BulkJobStatus::Processing));

    let bulk_job_id = response
        .bulk_job_id
        .ok_or_else(|| anyhow!("expected a bulk job"))?;
    let job = engine.bulk.get_job(CALLER, &bulk_job_id).await?;
    let provider_job_id = job
        .provider_job_id
        .ok_or_else(|| anyhow!("expected provider job id"))?;
    assert_eq!(engine.stub.uploaded_rows(&provider_job_id).await.len(), 85);
    Ok(())
}

#[tokio::test]
async fn resubmitting_a_completed_set_is_fully_deduplicated() -> Result<()> {
    let engine = spawn_engine(script_with_contacts(1..=20), None).await?;
    engine.billing.credit(CALLER, 1_000, "seed").await?;
    let first = submit_and_complete(&engine, requests(1..=20)).await?;
    assert_eq!(first.records_submitted, 20);

    let second = engine
        .bulk
        .submit(
            CALLER,
            BulkSubmitRequest {
                records: requests(1..=20),
            },
        )
        .await?;
    assert!(second.bulk_job_id.is_none());
    assert_eq!(second.dedupe_removed, first.records_submitted);
    assert_eq!(second.records_submitted, 0);
    assert_eq!(engine.stub.submission_count(), 1);
    assert_eq!(engine.billing.check_balance(CALLER).await?, 1_000 - 220);
    Ok(())
}

#[tokio::test]
async fn completed_job_sweeps_unreturned_records_to_no_match() -> Result<()> {
    let engine = spawn_engine(script_with_contacts(1..=2).dropping(&street(3)), None).await?;
    engine.billing.credit(CALLER, 100, "seed").await?;
    let response = submit_and_complete(&engine, requests(1..=3)).await?;
    let bulk_job_id = response
        .bulk_job_id
        .ok_or_else(|| anyhow!("expected a bulk job"))?;

    let job = engine.bulk.get_job(CALLER, &bulk_job_id).await?;
    assert_eq!(job.records_matched, 2);
    assert!(job.completed_at.is_some());

    let records = engine.bulk.records(CALLER, &bulk_job_id).await?;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|record| record.status.is_terminal()));
    let swept = records
        .iter()
        .find(|record| record.street == street(3))
        .ok_or_else(|| anyhow!("missing swept record"))?;
    assert_eq!(swept.status, TraceStatus::NoMatch);
    assert_eq!(swept.charge_cents, 0);
    assert_eq!(engine.billing.check_balance(CALLER).await?, 100 - 22);

    // Completed jobs are not re-polled.
    let polls = engine.stub.poll_count();
    engine.bulk.poll(CALLER, &bulk_job_id).await?;
    assert_eq!(engine.stub.poll_count(), polls);
    Ok(())
}

#[tokio::test]
async fn duplicate_provider_rows_prefer_the_one_with_contact_data() -> Result<()> {
    let engine = spawn_engine(script_with_contacts(1..=2).duplicating(&street(1)), None).await?;
    engine.billing.credit(CALLER, 100, "seed").await?;
    let response = submit_and_complete(&engine, requests(1..=2)).await?;
    let bulk_job_id = response
        .bulk_job_id
        .ok_or_else(|| anyhow!("expected a bulk job"))?;

    let records = engine.bulk.records(CALLER, &bulk_job_id).await?;
    assert!(
        records
            .iter()
            .all(|record| record.status == TraceStatus::Success)
    );
    let debits = engine
        .billing
        .ledger(CALLER, 50)
        .await?
        .into_iter()
        .filter(|entry| entry.trace_id.is_some())
        .count();
    assert_eq!(debits, 2);
    Ok(())
}

#[tokio::test]
async fn invalid_rows_are_rejected_individually() -> Result<()> {
    let engine = spawn_engine(script_with_contacts(1..=2), None).await?;
    engine.billing.credit(CALLER, 100, "seed").await?;
    let mut records = requests(1..=2);
    let mut bad_zip = austin_request(&street(3));
    bad_zip.zip = "ABCDE".to_string();
    records.push(bad_zip);
    records.push(austin_request("   "));

    let response = engine
        .bulk
        .submit(CALLER, BulkSubmitRequest { records })
        .await?;
    assert_eq!(response.total_records, 4);
    assert_eq!(response.records_rejected, 2);
    assert_eq!(response.dedupe_removed, 0);
    assert_eq!(response.records_submitted, 2);
    let rejected = response
        .rejected
        .iter()
        .map(|row| (row.row_index, row.field.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(rejected, vec![(2, "zip"), (3, "address")]);
    Ok(())
}

#[tokio::test]
async fn oversize_and_empty_submissions_are_invalid() -> Result<()> {
    let engine = spawn_engine(StubScript::default(), None).await?;
    engine.billing.credit(CALLER, 1_000, "seed").await?;
    let small = BulkService::new(
        engine.store.clone(),
        engine.cache.clone(),
        engine.provider.clone(),
        engine.billing.clone(),
        engine.lifecycle.clone(),
        3,
    );
    assert!(matches!(
        small
            .submit(
                CALLER,
                BulkSubmitRequest {
                    records: requests(1..=4)
                }
            )
            .await,
        Err(TraceError::InvalidRequest(_))
    ));
    assert!(matches!(
        small
            .submit(CALLER, BulkSubmitRequest { records: vec![] })
            .await,
        Err(TraceError::InvalidRequest(_))
    ));
    assert_eq!(engine.stub.submission_count(), 0);
    Ok(())
}

#[tokio::test]
async fn funds_gate_covers_every_new_record() -> Result<()> {
    let engine = spawn_engine(StubScript::default(), None).await?;
    engine.billing.credit(CALLER, 21, "seed").await?;
    match engine
        .bulk
        .submit(
            CALLER,
            BulkSubmitRequest {
                records: requests(1..=2),
            },
        )
        .await
    {
        Err(TraceError::InsufficientFunds {
            required_cents,
            available_cents,
        }) => {
            assert_eq!(required_cents, 22);
            assert_eq!(available_cents, 21);
        }
        other => return Err(anyhow!("expected insufficient funds, got {other:?}")),
    }
    assert_eq!(engine.stub.submission_count(), 0);
    assert!(engine.store.list_processing_bulk_jobs().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn rejected_batch_marks_job_failed_and_creates_no_records() -> Result<()> {
    let engine = spawn_engine(
        StubScript {
            submit_status: Some(502),
            ..StubScript::default()
        },
        None,
    )
    .await?;
    engine.billing.credit(CALLER, 100, "seed").await?;
    assert!(matches!(
        engine
            .bulk
            .submit(
                CALLER,
                BulkSubmitRequest {
                    records: requests(1..=2)
                }
            )
            .await,
        Err(TraceError::Submission(_))
    ));
    assert!(engine.store.list_processing_bulk_jobs().await?.is_empty());
    let fingerprint =
        crate::address::canonicalize(&austin_request(&street(1)).address_input()).fingerprint;
    assert!(engine.store.find_active(CALLER, &fingerprint).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn supervisor_drives_job_to_completion() -> Result<()> {
    let engine = spawn_engine(
        script_with_contacts(1..=3),
        Some(BulkPollPolicy {
            interval: Duration::from_millis(20),
            max_attempts: 100,
        }),
    )
    .await?;
    engine.billing.credit(CALLER, 100, "seed").await?;
    let response = engine
        .bulk
        .submit(
            CALLER,
            BulkSubmitRequest {
                records: requests(1..=3),
            },
        )
        .await?;
    let bulk_job_id = response
        .bulk_job_id
        .ok_or_else(|| anyhow!("expected a bulk job"))?;
    let supervisor = engine
        .bulk
        .supervisor()
        .ok_or_else(|| anyhow!("expected supervisor"))?
        .clone();

    let mut completed = false;
    for _ in 0..100 {
        let job = engine
            .store
            .get_bulk_job(&bulk_job_id)
            .await?
            .ok_or_else(|| anyhow!("missing job"))?;
        if job.status == BulkJobStatus::Completed {
            assert_eq!(job.records_matched, 3);
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(completed, "supervisor never completed the job");

    for _ in 0..50 {
        if supervisor.watched().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(supervisor.watched().await.is_empty());
    assert_eq!(engine.billing.check_balance(CALLER).await?, 100 - 33);
    Ok(())
}

#[tokio::test]
async fn supervisor_resumes_processing_jobs_and_can_be_cancelled() -> Result<()> {
    let engine = spawn_engine(
        script_with_contacts(1..=2).with_phases(&[crate::test_support::StubPhase::Pending; 200]),
        None,
    )
    .await?;
    engine.billing.credit(CALLER, 100, "seed").await?;
    engine
        .bulk
        .submit(
            CALLER,
            BulkSubmitRequest {
                records: requests(1..=2),
            },
        )
        .await?;

    let supervised = engine
        .bulk
        .clone()
        .with_supervisor(super::BulkSupervisor::new(BulkPollPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 1_000,
        }));
    assert_eq!(supervised.resume_supervision().await?, 1);
    let supervisor = supervised
        .supervisor()
        .ok_or_else(|| anyhow!("expected supervisor"))?;
    let watched = supervisor.watched().await;
    assert_eq!(watched.len(), 1);
    assert_eq!(supervised.resume_supervision().await?, 0);

    assert!(supervisor.cancel(&watched[0]).await);
    assert!(supervisor.watched().await.is_empty());
    let job = engine
        .store
        .get_bulk_job(&watched[0])
        .await?
        .ok_or_else(|| anyhow!("missing job"))?;
    assert_eq!(job.status, BulkJobStatus::Processing);
    Ok(())
}

#[tokio::test]
async fn dropped_bulk_request_still_attaches_records_to_the_job() -> Result<()> {
    let engine = spawn_engine(script_with_contacts(1..=2).delaying_submissions(200), None).await?;
    engine.billing.credit(CALLER, 100, "seed").await?;

    let dropped = tokio::time::timeout(
        Duration::from_millis(50),
        engine.bulk.submit(
            CALLER,
            BulkSubmitRequest {
                records: requests(1..=2),
            },
        ),
    )
    .await;
    assert!(dropped.is_err());

    let mut jobs = Vec::new();
    for _ in 0..50 {
        jobs = engine.store.list_processing_bulk_jobs().await?;
        if !jobs.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let job = jobs.first().ok_or_else(|| anyhow!("expected a processing job"))?;
    let open = engine
        .store
        .list_for_bulk(&job.bulk_job_id, Some(TraceStatus::Processing))
        .await?;
    assert_eq!(open.len(), 2);
    assert!(
        open.iter()
            .all(|record| record.provider_job_id == job.provider_job_id)
    );

    let completed = engine.bulk.poll(CALLER, &job.bulk_job_id).await?;
    assert_eq!(completed.status, BulkJobStatus::Completed);
    assert_eq!(completed.records_matched, 2);
    Ok(())
}

fn pending_job(at: DateTime<Utc>) -> BulkJob {
    BulkJob {
        bulk_job_id: format!("bulk_{}", uuid::Uuid::now_v7()),
        caller_id: CALLER.to_string(),
        status: BulkJobStatus::Pending,
        provider_job_id: None,
        total_records: 2,
        dedupe_removed: 0,
        records_submitted: 2,
        records_matched: 0,
        records_rejected: 0,
        error_message: None,
        created_at: at,
        updated_at: at,
        completed_at: None,
    }
}

#[tokio::test]
async fn abandoned_pending_bulk_jobs_are_failed() -> Result<()> {
    let engine = spawn_engine(StubScript::default(), None).await?;
    let long_ago = Utc::now() - chrono::Duration::minutes(5);
    let read_back = engine.store.insert_bulk_job(pending_job(long_ago)).await?;
    let left_over = engine.store.insert_bulk_job(pending_job(long_ago)).await?;
    let in_flight = engine.store.insert_bulk_job(pending_job(Utc::now())).await?;

    let job = engine.bulk.get_job(CALLER, &in_flight.bulk_job_id).await?;
    assert_eq!(job.status, BulkJobStatus::Pending);

    let job = engine.bulk.get_job(CALLER, &read_back.bulk_job_id).await?;
    assert_eq!(job.status, BulkJobStatus::Failed);
    assert!(job.completed_at.is_some());

    assert_eq!(engine.bulk.resume_supervision().await?, 0);
    let job = engine
        .store
        .get_bulk_job(&left_over.bulk_job_id)
        .await?
        .ok_or_else(|| anyhow!("missing job"))?;
    assert_eq!(job.status, BulkJobStatus::Failed);
    let job = engine
        .store
        .get_bulk_job(&in_flight.bulk_job_id)
        .await?
        .ok_or_else(|| anyhow!("missing job"))?;
    assert_eq!(job.status, BulkJobStatus::Pending);
    Ok(())
}
