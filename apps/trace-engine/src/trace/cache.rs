use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::trace::store::{TraceStore, TraceStoreError};
use crate::trace::types::TraceRecord;

pub const DEFAULT_WINDOW_DAYS: i64 = 90;

/// Anything keyed by an address fingerprint.
pub trait Fingerprinted {
    fn fingerprint(&self) -> &str;
}

impl Fingerprinted for String {
    fn fingerprint(&self) -> &str {
        self
    }
}

#[derive(Debug)]
pub struct BatchPartition<T> {
    /// Items with a usable prior result, paired with that result.
    pub cached: Vec<(T, TraceRecord)>,
    pub new: Vec<T>,
}

/// Prior successful traces within a trailing window.
#[derive(Clone)]
pub struct DedupCache {
    store: Arc<dyn TraceStore>,
    window: Duration,
}

impl DedupCache {
    pub fn new(store: Arc<dyn TraceStore>, window_days: i64) -> Self {
        Self {
            store,
            window: Duration::days(window_days.max(1)),
        }
    }

    pub async fn lookup_single(
        &self,
        caller_id: &str,
        fingerprint: &str,
    ) -> Result<Option<TraceRecord>, TraceStoreError> {
        let hits = self
            .usable_hits(caller_id, &[fingerprint.to_string()])
            .await?;
        Ok(hits.into_values().next())
    }

    pub async fn lookup_batch<T: Fingerprinted>(
        &self,
        caller_id: &str,
        items: Vec<T>,
    ) -> Result<BatchPartition<T>, TraceStoreError> {
        let fingerprints = items
            .iter()
            .map(|item| item.fingerprint().to_string())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let hits = self.usable_hits(caller_id, &fingerprints).await?;

        let mut partition = BatchPartition {
            cached: Vec::new(),
            new: Vec::new(),
        };
        for item in items {
            match hits.get(item.fingerprint()) {
                Some(record) => partition.cached.push((item, record.clone())),
                None => partition.new.push(item),
            }
        }
        Ok(partition)
    }

    /// Newest usable success per fingerprint. Successes without any phone or
    /// email are deleted on the way through.
    async fn usable_hits(
        &self,
        caller_id: &str,
        fingerprints: &[String],
    ) -> Result<HashMap<String, TraceRecord>, TraceStoreError> {
        if fingerprints.is_empty() {
            return Ok(HashMap::new());
        }
        let since = Utc::now() - self.window;
        let successes = self
            .store
            .list_successes(caller_id, fingerprints, since)
            .await?;

        let mut hits = HashMap::new();
        for record in successes {
            if !record.is_successful() {
                tracing::info!(
                    caller_id,
                    trace_id = %record.trace_id,
                    "removing empty cached trace"
                );
                self.store.delete(&record.trace_id).await?;
                continue;
            }
            hits.entry(record.address_fingerprint.clone())
                .or_insert(record);
        }
        Ok(hits)
    }
}

/// Collapses items sharing a fingerprint, keeping the first. Returns the kept
/// items and how many were dropped.
pub fn remove_internal_duplicates<T: Fingerprinted>(items: Vec<T>) -> (Vec<T>, usize) {
    let mut seen = HashSet::new();
    let total = items.len();
    let kept = items
        .into_iter()
        .filter(|item| seen.insert(item.fingerprint().to_string()))
        .collect::<Vec<_>>();
    let removed = total - kept.len();
    (kept, removed)
}
