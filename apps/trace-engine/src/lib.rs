#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    billing::BillingService,
    bulk::{BulkService, BulkSupervisor},
    config::Config,
    db::TraceDb,
    server::{AppState, build_router},
    trace::{TraceService, cache::DedupCache, lifecycle::TraceLifecycle},
};

pub mod address;
pub mod billing;
pub mod bulk;
pub mod config;
pub mod db;
pub mod hooks;
pub mod provider;
pub mod server;
pub mod trace;

#[cfg(test)]
pub(crate) mod test_support;

/// Wires stores, provider, billing and hooks from config. Postgres backs the
/// stores when a database url is set; otherwise everything lives in memory.
pub async fn build_state(config: Config) -> Result<AppState> {
    let (trace_store, wallet_store) = match config.db_url.clone() {
        Some(url) => {
            let db = Arc::new(TraceDb::connect(url.as_str()).await?);
            db.migrate().await?;
            (
                trace::store::postgres(db.clone()),
                billing::store::postgres(db),
            )
        }
        None => (trace::store::memory(), billing::store::memory()),
    };

    let hooks = hooks::from_webhook_url(config.webhook_url.clone(), config.provider_timeout_ms);
    tracing::info!(hooks = hooks.name(), "trace hooks configured");
    let billing =
        BillingService::new_with_pricing(wallet_store, hooks.clone(), config.pricing.clone());
    let provider = provider::client::http(config.provider_settings());
    let cache = DedupCache::new(trace_store.clone(), config.dedup_window_days);
    let lifecycle = TraceLifecycle::new(trace_store.clone(), billing.clone(), hooks);

    let traces = TraceService::new_with_polling(
        trace_store.clone(),
        cache.clone(),
        provider.clone(),
        billing.clone(),
        lifecycle.clone(),
        config.single_poll_policy(),
    )
    .with_pending_timeout(config.pending_timeout());
    let mut bulk = BulkService::new(
        trace_store,
        cache,
        provider,
        billing.clone(),
        lifecycle,
        config.bulk_max_records,
    )
    .with_pending_timeout(config.pending_timeout());
    if config.bulk_supervisor_enabled {
        bulk = bulk.with_supervisor(BulkSupervisor::new(config.bulk_poll_policy()));
    }

    Ok(AppState::new(config, traces, bulk, billing))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "trace engine listening"
    );
    let state = build_state(config).await?;
    match state.bulk.resume_supervision().await {
        Ok(resumed) if resumed > 0 => info!(resumed, "resumed bulk job pollers"),
        Ok(_) => {}
        Err(error) => tracing::warn!(reason = %error, "could not resume bulk job pollers"),
    }
    let bulk = state.bulk.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    if let Some(supervisor) = bulk.supervisor() {
        supervisor.shutdown().await;
    }
    Ok(())
}
