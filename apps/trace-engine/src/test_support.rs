use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};

use crate::address::normalize_street;
use crate::billing::types::{LedgerEntry, WalletAccount};
use crate::billing::{self, BillingService};
use crate::bulk::{BulkPollPolicy, BulkService, BulkSupervisor};
use crate::hooks::TraceHooks;
use crate::provider::{self, ProviderSettings, TraceProvider};
use crate::trace::cache::DedupCache;
use crate::trace::lifecycle::TraceLifecycle;
use crate::trace::service::PollPolicy;
use crate::trace::store::{self, TraceStore};
use crate::trace::types::{TraceRecord, TraceRequest};
use crate::trace::TraceService;

/// What the stub answers on successive polls of a job, before it reports results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubPhase {
    Pending,
    EmptyReady,
    PaddingOnly,
    Malformed,
    Status(u16),
}

#[derive(Debug, Clone, Default)]
pub struct StubScript {
    /// Answer every submission with this status instead of accepting it.
    pub submit_status: Option<u16>,
    pub phases: Vec<StubPhase>,
    /// Extra result fields keyed by normalized street.
    pub contacts: HashMap<String, Value>,
    /// Streets the provider silently drops from its results.
    pub drop_streets: HashSet<String>,
    /// Streets that come back twice, the first time without contact data.
    pub duplicate_streets: HashSet<String>,
    /// Hold every submission this long before answering.
    pub submit_delay: Option<Duration>,
}

impl StubScript {
    pub fn with_contact(mut self, street: &str, fields: Value) -> Self {
        self.contacts.insert(normalize_street(street), fields);
        self
    }

    pub fn dropping(mut self, street: &str) -> Self {
        self.drop_streets.insert(normalize_street(street));
        self
    }

    pub fn duplicating(mut self, street: &str) -> Self {
        self.duplicate_streets.insert(normalize_street(street));
        self
    }

    pub fn delaying_submissions(mut self, delay_ms: u64) -> Self {
        self.submit_delay = Some(Duration::from_millis(delay_ms));
        self
    }

    pub fn with_phases(mut self, phases: &[StubPhase]) -> Self {
        self.phases = phases.to_vec();
        self
    }
}

#[derive(Clone)]
struct ProviderStubState {
    script: Arc<Mutex<StubScript>>,
    jobs: Arc<Mutex<HashMap<String, Vec<HashMap<String, String>>>>>,
    job_polls: Arc<Mutex<HashMap<String, usize>>>,
    submissions: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
}

pub struct ProviderStubHandle {
    pub base_url: String,
    pub submissions: Arc<AtomicUsize>,
    pub polls: Arc<AtomicUsize>,
    jobs: Arc<Mutex<HashMap<String, Vec<HashMap<String, String>>>>>,
    script: Arc<Mutex<StubScript>>,
    pub shutdown: oneshot::Sender<()>,
}

impl ProviderStubHandle {
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::Relaxed)
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }

    /// CSV rows received for `provider_job_id`, as header-keyed maps.
    pub async fn uploaded_rows(&self, provider_job_id: &str) -> Vec<HashMap<String, String>> {
        self.jobs
            .lock()
            .await
            .get(provider_job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn replace_script(&self, script: StubScript) {
        *self.script.lock().await = script;
    }
}

pub async fn spawn_http_server(
    app: axum::Router,
) -> Result<(std::net::SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });
    Ok((addr, shutdown_tx))
}

pub async fn spawn_provider_stub(script: StubScript) -> Result<ProviderStubHandle> {
    async fn submit(State(state): State<ProviderStubState>, mut multipart: Multipart) -> Response {
        let delay = state.script.lock().await.submit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = state.script.lock().await.submit_status {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = (status, "rejected").into_response();
            if status == StatusCode::TOO_MANY_REQUESTS {
                response
                    .headers_mut()
                    .insert("retry-after", axum::http::HeaderValue::from_static("0"));
            }
            return response;
        }

        let mut rows = Vec::new();
        while let Ok(Some(field)) = multipart.next_field().await {
            if field.name() != Some("file") {
                continue;
            }
            let Ok(bytes) = field.bytes().await else {
                return (StatusCode::BAD_REQUEST, "unreadable upload").into_response();
            };
            let mut reader = csv::Reader::from_reader(bytes.as_ref());
            for record in reader.deserialize::<HashMap<String, String>>() {
                match record {
                    Ok(row) => rows.push(row),
                    Err(_) => return (StatusCode::BAD_REQUEST, "bad csv").into_response(),
                }
            }
        }
        if rows.is_empty() {
            return (StatusCode::BAD_REQUEST, "missing file").into_response();
        }

        let index = state.submissions.fetch_add(1, Ordering::Relaxed) + 1;
        let job_id = format!("stubjob_{index}");
        state.jobs.lock().await.insert(job_id.clone(), rows);
        axum::Json(json!({ "job_id": job_id })).into_response()
    }

    async fn poll(State(state): State<ProviderStubState>, Path(job_id): Path<String>) -> Response {
        state.polls.fetch_add(1, Ordering::Relaxed);
        let Some(rows) = state.jobs.lock().await.get(&job_id).cloned() else {
            return (StatusCode::NOT_FOUND, "unknown job").into_response();
        };
        let attempt = {
            let mut job_polls = state.job_polls.lock().await;
            let counter = job_polls.entry(job_id).or_insert(0);
            *counter += 1;
            *counter - 1
        };
        let script = state.script.lock().await.clone();

        match script.phases.get(attempt).copied() {
            Some(StubPhase::Pending) => axum::Json(json!({ "pending": true })).into_response(),
            Some(StubPhase::EmptyReady) => axum::Json(json!([])).into_response(),
            Some(StubPhase::PaddingOnly) => {
                let padding = rows
                    .iter()
                    .filter(|row| row.get("address").is_some_and(|a| a.contains("PADDING")))
                    .map(|row| echo(row, None))
                    .collect::<Vec<_>>();
                axum::Json(Value::Array(padding)).into_response()
            }
            Some(StubPhase::Malformed) => {
                axum::Json(json!({ "unexpected": "shape" })).into_response()
            }
            Some(StubPhase::Status(status)) => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                let mut response = (status, "poll failed").into_response();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    response
                        .headers_mut()
                        .insert("retry-after", axum::http::HeaderValue::from_static("0"));
                }
                response
            }
            None => {
                let mut results = Vec::new();
                for row in &rows {
                    let street = normalize_street(row.get("address").map_or("", String::as_str));
                    if script.drop_streets.contains(&street) {
                        continue;
                    }
                    if script.duplicate_streets.contains(&street) {
                        results.push(echo(row, None));
                    }
                    results.push(echo(row, script.contacts.get(&street)));
                }
                axum::Json(Value::Array(results)).into_response()
            }
        }
    }

    fn echo(row: &HashMap<String, String>, contacts: Option<&Value>) -> Value {
        let mut out = Map::new();
        for key in ["address", "city", "state"] {
            out.insert(
                key.to_string(),
                Value::String(row.get(key).cloned().unwrap_or_default()),
            );
        }
        if let Some(Value::Object(fields)) = contacts {
            for (key, value) in fields {
                out.insert(key.clone(), value.clone());
            }
        }
        Value::Object(out)
    }

    let state = ProviderStubState {
        script: Arc::new(Mutex::new(script)),
        jobs: Arc::new(Mutex::new(HashMap::new())),
        job_polls: Arc::new(Mutex::new(HashMap::new())),
        submissions: Arc::new(AtomicUsize::new(0)),
        polls: Arc::new(AtomicUsize::new(0)),
    };
    let app = axum::Router::new()
        .route("/batches", axum::routing::post(submit))
        .route("/batches/:job_id", axum::routing::get(poll))
        .with_state(state.clone());
    let (addr, shutdown) = spawn_http_server(app)
        .await
        .context("spawn provider stub")?;

    Ok(ProviderStubHandle {
        base_url: format!("http://{addr}"),
        submissions: state.submissions,
        polls: state.polls,
        jobs: state.jobs,
        script: state.script,
        shutdown,
    })
}

/// Hooks that remember what fired, for assertions.
#[derive(Default)]
pub struct RecordingHooks {
    pub succeeded: std::sync::Mutex<Vec<String>>,
    pub low_balance: std::sync::Mutex<Vec<(String, i64)>>,
}

impl TraceHooks for RecordingHooks {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn trace_succeeded(&self, record: &TraceRecord) {
        if let Ok(mut succeeded) = self.succeeded.lock() {
            succeeded.push(record.trace_id.clone());
        }
    }

    fn low_balance(&self, account: &WalletAccount, _entry: &LedgerEntry) {
        if let Ok(mut low_balance) = self.low_balance.lock() {
            low_balance.push((account.caller_id.clone(), account.balance_cents));
        }
    }
}

pub fn phone_fields(number: &str) -> Value {
    json!({ "phone": number, "first_name": "JANE", "last_name": "DOE" })
}

/// In-memory engine wired against a provider stub, with short poll timings.
pub struct TestEngine {
    pub traces: TraceService,
    pub bulk: BulkService,
    pub billing: BillingService,
    pub store: Arc<dyn TraceStore>,
    pub cache: DedupCache,
    pub provider: Arc<dyn TraceProvider>,
    pub lifecycle: TraceLifecycle,
    pub hooks: Arc<RecordingHooks>,
    pub stub: ProviderStubHandle,
}

pub fn fast_poll_policy(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        initial_delay: Duration::from_millis(0),
        interval: Duration::from_millis(10),
        max_attempts,
    }
}

pub async fn spawn_engine(
    script: StubScript,
    bulk_polling: Option<BulkPollPolicy>,
) -> Result<TestEngine> {
    let stub = spawn_provider_stub(script).await?;
    let hooks = Arc::new(RecordingHooks::default());
    let trace_store = store::memory();
    let billing = BillingService::new(billing::store::memory(), hooks.clone());
    let provider = provider::client::http(ProviderSettings {
        base_url: Some(stub.base_url.clone()),
        api_key: None,
        timeout_ms: 2_000,
        min_batch_size: 2,
    });
    let cache = DedupCache::new(trace_store.clone(), 90);
    let lifecycle = TraceLifecycle::new(trace_store.clone(), billing.clone(), hooks.clone());
    let traces = TraceService::new_with_polling(
        trace_store.clone(),
        cache.clone(),
        provider.clone(),
        billing.clone(),
        lifecycle.clone(),
        fast_poll_policy(5),
    );
    let mut bulk = BulkService::new(
        trace_store.clone(),
        cache.clone(),
        provider.clone(),
        billing.clone(),
        lifecycle.clone(),
        crate::bulk::service::DEFAULT_MAX_RECORDS,
    );
    if let Some(policy) = bulk_polling {
        bulk = bulk.with_supervisor(BulkSupervisor::new(policy));
    }
    Ok(TestEngine {
        traces,
        bulk,
        billing,
        store: trace_store,
        cache,
        provider,
        lifecycle,
        hooks,
        stub,
    })
}

pub fn austin_request(address: &str) -> TraceRequest {
    TraceRequest {
        address: address.to_string(),
        city: "Austin".to_string(),
        state: "TX".to_string(),
        zip: "78701".to_string(),
        owner_first_name: None,
        owner_last_name: None,
    }
}
