use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::billing::types::{LedgerEntry, WalletAccount};
use crate::trace::types::TraceRecord;

/// Out-of-band notifications. Implementations must not block and must never
/// report failure back into the trace or billing flow.
pub trait TraceHooks: Send + Sync {
    fn name(&self) -> &'static str;

    fn trace_succeeded(&self, record: &TraceRecord);

    fn low_balance(&self, account: &WalletAccount, entry: &LedgerEntry);
}

pub struct NoopHooks;

impl TraceHooks for NoopHooks {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn trace_succeeded(&self, _record: &TraceRecord) {}

    fn low_balance(&self, _account: &WalletAccount, _entry: &LedgerEntry) {}
}

pub fn noop() -> Arc<dyn TraceHooks> {
    Arc::new(NoopHooks)
}

pub fn from_webhook_url(url: Option<String>, timeout_ms: u64) -> Arc<dyn TraceHooks> {
    match url.map(|value| value.trim().to_string()) {
        Some(url) if !url.is_empty() => Arc::new(WebhookHooks {
            client: reqwest::Client::new(),
            url,
            timeout_ms,
        }),
        _ => noop(),
    }
}

/// Posts each event as JSON from a detached task.
pub struct WebhookHooks {
    client: reqwest::Client,
    url: String,
    timeout_ms: u64,
}

impl WebhookHooks {
    /// Spawns the POST; the task resolves to whether the receiver accepted it.
    fn deliver(&self, event: &'static str, payload: Value) -> Option<JoinHandle<bool>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(event, "webhook skipped outside runtime");
            return None;
        };
        let request = self
            .client
            .post(self.url.as_str())
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(&json!({ "event": event, "data": payload }));
        Some(handle.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => true,
                Ok(resp) => {
                    tracing::warn!(event, status = resp.status().as_u16(), "webhook delivery rejected");
                    false
                }
                Err(error) => {
                    tracing::warn!(event, reason = %error, "webhook delivery failed");
                    false
                }
            }
        }))
    }
}

impl TraceHooks for WebhookHooks {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn trace_succeeded(&self, record: &TraceRecord) {
        let _ = self.deliver(
            "trace.succeeded",
            json!({
                "trace_id": record.trace_id,
                "caller_id": record.caller_id,
                "canonical_address": record.canonical_address,
                "result": record.result,
                "charge_cents": record.charge_cents,
            }),
        );
    }

    fn low_balance(&self, account: &WalletAccount, entry: &LedgerEntry) {
        let _ = self.deliver(
            "wallet.low_balance",
            json!({
                "caller_id": account.caller_id,
                "balance_cents": account.balance_cents,
                "low_balance_threshold_cents": account.low_balance_threshold_cents,
                "auto_rebill_enabled": account.auto_rebill_enabled,
                "auto_rebill_amount_cents": account.auto_rebill_amount_cents,
                "entry_id": entry.entry_id,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use chrono::Utc;

    use super::*;
    use crate::billing::types::LedgerKind;
    use crate::test_support::spawn_http_server;

    #[tokio::test]
    async fn webhook_posts_low_balance_event() -> Result<()> {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::<Value>::new()));
        let app = {
            let hits = hits.clone();
            let seen = seen.clone();
            axum::Router::new().route(
                "/hook",
                axum::routing::post(move |axum::Json(body): axum::Json<Value>| {
                    let hits = hits.clone();
                    let seen = seen.clone();
                    async move {
                        hits.fetch_add(1, Ordering::Relaxed);
                        seen.lock().await.push(body);
                        axum::http::StatusCode::NO_CONTENT
                    }
                }),
            )
        };
        let (addr, shutdown) = spawn_http_server(app).await?;

        let hooks = from_webhook_url(Some(format!("http://{addr}/hook")), 2_000);
        let now = Utc::now();
        let mut account = WalletAccount::empty("caller_a", now);
        account.balance_cents = 3;
        account.low_balance_threshold_cents = 50;
        let entry = LedgerEntry {
            entry_id: "led_1".to_string(),
            caller_id: "caller_a".to_string(),
            kind: LedgerKind::Debit,
            amount_cents: 11,
            balance_before_cents: 14,
            balance_after_cents: 3,
            reason: "trace".to_string(),
            trace_id: Some("trc_1".to_string()),
            created_at: now,
        };
        hooks.low_balance(&account, &entry);

        for _ in 0..50 {
            if hits.load(Ordering::Relaxed) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        let seen = seen.lock().await;
        assert_eq!(seen[0]["event"], "wallet.low_balance");
        assert_eq!(seen[0]["data"]["balance_cents"], 3);
        let _ = shutdown.send(());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed() -> Result<()> {
        let hooks = WebhookHooks {
            client: reqwest::Client::new(),
            url: "http://127.0.0.1:9/hook".to_string(),
            timeout_ms: 200,
        };
        let delivery = hooks
            .deliver("wallet.low_balance", json!({ "caller_id": "caller_a" }))
            .ok_or_else(|| anyhow::anyhow!("expected a delivery task"))?;
        assert!(!delivery.await?);

        let now = Utc::now();
        let account = WalletAccount::empty("caller_a", now);
        let entry = LedgerEntry {
            entry_id: "led_2".to_string(),
            caller_id: "caller_a".to_string(),
            kind: LedgerKind::Debit,
            amount_cents: 11,
            balance_before_cents: 11,
            balance_after_cents: 0,
            reason: "trace".to_string(),
            trace_id: None,
            created_at: now,
        };
        hooks.low_balance(&account, &entry);
        Ok(())
    }

    #[test]
    fn delivery_outside_runtime_is_skipped() {
        let hooks = WebhookHooks {
            client: reqwest::Client::new(),
            url: "http://127.0.0.1:9/hook".to_string(),
            timeout_ms: 200,
        };
        assert!(hooks.deliver("trace.succeeded", json!({})).is_none());
    }

    #[test]
    fn blank_or_missing_url_selects_noop() {
        assert_eq!(from_webhook_url(Some("  ".to_string()), 100).name(), "noop");
        assert_eq!(from_webhook_url(None, 100).name(), "noop");
        assert_eq!(
            from_webhook_url(Some("http://127.0.0.1:9/hook".to_string()), 100).name(),
            "webhook"
        );
    }
}
