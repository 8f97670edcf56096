use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};

use crate::bulk::service::BulkService;
use crate::trace::TraceError;

#[derive(Debug, Clone)]
pub struct BulkPollPolicy {
    pub interval: Duration,
    /// Job-level timeout, counted in polls.
    pub max_attempts: u32,
}

impl Default for BulkPollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(15_000),
            max_attempts: 480,
        }
    }
}

/// One poll task per outstanding bulk job, each cancellable through a oneshot.
#[derive(Clone)]
pub struct BulkSupervisor {
    policy: BulkPollPolicy,
    handles: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl BulkSupervisor {
    pub fn new(policy: BulkPollPolicy) -> Self {
        Self {
            policy,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts polling `bulk_job_id`. Returns false if it is already watched.
    pub async fn watch(&self, service: BulkService, caller_id: &str, bulk_job_id: &str) -> bool {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        {
            let mut handles = self.handles.lock().await;
            if handles.contains_key(bulk_job_id) {
                return false;
            }
            handles.insert(bulk_job_id.to_string(), cancel_tx);
        }

        let policy = self.policy.clone();
        let handles = self.handles.clone();
        let caller_id = caller_id.to_string();
        let bulk_job_id = bulk_job_id.to_string();
        tokio::spawn(async move {
            let mut delay = policy.interval;
            for attempt in 1..=policy.max_attempts {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        tracing::debug!(bulk_job_id, "bulk poller stopped");
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                delay = policy.interval;
                match service.poll(&caller_id, &bulk_job_id).await {
                    Ok(job) if job.status.is_terminal() => {
                        handles.lock().await.remove(&bulk_job_id);
                        return;
                    }
                    Ok(_) => {}
                    Err(TraceError::RateLimited { retry_after_ms }) => {
                        delay = delay.max(Duration::from_millis(retry_after_ms));
                        tracing::info!(bulk_job_id, attempt, retry_after_ms, "bulk poll rate limited");
                    }
                    Err(TraceError::NotFound) => {
                        handles.lock().await.remove(&bulk_job_id);
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(bulk_job_id, attempt, reason = %error, "bulk poll failed");
                    }
                }
            }
            tracing::warn!(
                caller_id,
                bulk_job_id,
                attempts = policy.max_attempts,
                "bulk job stalled; poller giving up with job still processing"
            );
            handles.lock().await.remove(&bulk_job_id);
        });
        true
    }

    /// Stops the poller for `bulk_job_id`, if any.
    pub async fn cancel(&self, bulk_job_id: &str) -> bool {
        let Some(cancel) = self.handles.lock().await.remove(bulk_job_id) else {
            return false;
        };
        let _ = cancel.send(());
        true
    }

    pub async fn watched(&self) -> Vec<String> {
        let mut ids = self
            .handles
            .lock()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub async fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for (_, cancel) in handles {
            let _ = cancel.send(());
        }
    }
}
