use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::billing::types::{CallerTier, LedgerEntry, LedgerKind, WalletAccount, WalletSettings};
use crate::db::TraceDb;

#[derive(Debug, thiserror::Error)]
pub enum WalletStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// One balance movement. Amount is always positive; `kind` decides the sign.
#[derive(Debug, Clone)]
pub struct LedgerMutation {
    pub entry_id: String,
    pub caller_id: String,
    pub amount_cents: i64,
    pub reason: String,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitOutcome {
    Debited {
        entry: LedgerEntry,
        account: WalletAccount,
    },
    AlreadyDebited(LedgerEntry),
    InsufficientFunds {
        balance_cents: i64,
    },
}

/// The only writer of wallet balances. Every balance change lands together with
/// its ledger entry, under a per-caller lock.
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get_account(&self, caller_id: &str)
    -> Result<Option<WalletAccount>, WalletStoreError>;

    async fn put_settings(
        &self,
        caller_id: &str,
        settings: WalletSettings,
        now: DateTime<Utc>,
    ) -> Result<WalletAccount, WalletStoreError>;

    async fn debit(&self, mutation: LedgerMutation) -> Result<DebitOutcome, WalletStoreError>;

    async fn credit(
        &self,
        mutation: LedgerMutation,
    ) -> Result<(LedgerEntry, WalletAccount), WalletStoreError>;

    async fn debit_for_trace(
        &self,
        trace_id: &str,
    ) -> Result<Option<LedgerEntry>, WalletStoreError>;

    async fn list_ledger(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, WalletStoreError>;
}

pub fn memory() -> Arc<dyn WalletStore> {
    Arc::new(MemoryWalletStore::default())
}

pub fn postgres(db: Arc<TraceDb>) -> Arc<dyn WalletStore> {
    Arc::new(PostgresWalletStore { db })
}

#[derive(Default)]
struct MemoryWalletStore {
    inner: Mutex<MemoryWalletStoreInner>,
}

#[derive(Default)]
struct MemoryWalletStoreInner {
    accounts: HashMap<String, WalletAccount>,
    ledger: Vec<LedgerEntry>,
}

impl MemoryWalletStoreInner {
    fn account_mut(&mut self, caller_id: &str, now: DateTime<Utc>) -> &mut WalletAccount {
        self.accounts
            .entry(caller_id.to_string())
            .or_insert_with(|| WalletAccount::empty(caller_id, now))
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn get_account(
        &self,
        caller_id: &str,
    ) -> Result<Option<WalletAccount>, WalletStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.get(caller_id).cloned())
    }

    async fn put_settings(
        &self,
        caller_id: &str,
        settings: WalletSettings,
        now: DateTime<Utc>,
    ) -> Result<WalletAccount, WalletStoreError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_mut(caller_id, now);
        account.tier = settings.tier;
        account.low_balance_threshold_cents = settings.low_balance_threshold_cents;
        account.auto_rebill_enabled = settings.auto_rebill_enabled;
        account.auto_rebill_amount_cents = settings.auto_rebill_amount_cents;
        account.updated_at = now;
        Ok(account.clone())
    }

    async fn debit(&self, mutation: LedgerMutation) -> Result<DebitOutcome, WalletStoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(trace_id) = mutation.trace_id.as_deref()
            && let Some(existing) = inner.ledger.iter().find(|entry| {
                entry.kind == LedgerKind::Debit && entry.trace_id.as_deref() == Some(trace_id)
            })
        {
            return Ok(DebitOutcome::AlreadyDebited(existing.clone()));
        }

        let balance_cents = inner
            .accounts
            .get(&mutation.caller_id)
            .map_or(0, |account| account.balance_cents);
        if balance_cents < mutation.amount_cents {
            return Ok(DebitOutcome::InsufficientFunds { balance_cents });
        }

        let account = inner.account_mut(&mutation.caller_id, mutation.created_at);
        let before = account.balance_cents;
        account.balance_cents -= mutation.amount_cents;
        account.updated_at = mutation.created_at;
        let account = account.clone();
        let entry = ledger_entry(LedgerKind::Debit, mutation, before, account.balance_cents);
        inner.ledger.push(entry.clone());
        Ok(DebitOutcome::Debited { entry, account })
    }

    async fn credit(
        &self,
        mutation: LedgerMutation,
    ) -> Result<(LedgerEntry, WalletAccount), WalletStoreError> {
        let mut inner = self.inner.lock().await;
        let account = inner.account_mut(&mutation.caller_id, mutation.created_at);
        let before = account.balance_cents;
        account.balance_cents += mutation.amount_cents;
        account.updated_at = mutation.created_at;
        let account = account.clone();
        let entry = ledger_entry(LedgerKind::Credit, mutation, before, account.balance_cents);
        inner.ledger.push(entry.clone());
        Ok((entry, account))
    }

    async fn debit_for_trace(
        &self,
        trace_id: &str,
    ) -> Result<Option<LedgerEntry>, WalletStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .iter()
            .find(|entry| entry.kind == LedgerKind::Debit && entry.trace_id.as_deref() == Some(trace_id))
            .cloned())
    }

    async fn list_ledger(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, WalletStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .iter()
            .rev()
            .filter(|entry| entry.caller_id == caller_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

fn ledger_entry(
    kind: LedgerKind,
    mutation: LedgerMutation,
    balance_before_cents: i64,
    balance_after_cents: i64,
) -> LedgerEntry {
    LedgerEntry {
        entry_id: mutation.entry_id,
        caller_id: mutation.caller_id,
        kind,
        amount_cents: mutation.amount_cents,
        balance_before_cents,
        balance_after_cents,
        reason: mutation.reason,
        trace_id: mutation.trace_id,
        created_at: mutation.created_at,
    }
}

struct PostgresWalletStore {
    db: Arc<TraceDb>,
}

const ACCOUNT_COLUMNS: &str = "caller_id, balance_cents, tier, low_balance_threshold_cents, \
     auto_rebill_enabled, auto_rebill_amount_cents, updated_at";

const LEDGER_COLUMNS: &str = "entry_id, caller_id, kind, amount_cents, balance_before_cents, \
     balance_after_cents, reason, trace_id, created_at";

#[async_trait]
impl WalletStore for PostgresWalletStore {
    async fn get_account(
        &self,
        caller_id: &str,
    ) -> Result<Option<WalletAccount>, WalletStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!("SELECT {ACCOUNT_COLUMNS} FROM trace.wallet_accounts WHERE caller_id = $1").as_str(),
                &[&caller_id],
            )
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_account_row)
            .transpose()
            .map_err(WalletStoreError::Db)
    }

    async fn put_settings(
        &self,
        caller_id: &str,
        settings: WalletSettings,
        now: DateTime<Utc>,
    ) -> Result<WalletAccount, WalletStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                format!(
                    r#"
                    INSERT INTO trace.wallet_accounts (
                        caller_id, balance_cents, tier, low_balance_threshold_cents,
                        auto_rebill_enabled, auto_rebill_amount_cents, updated_at
                    ) VALUES ($1, 0, $2, $3, $4, $5, $6)
                    ON CONFLICT (caller_id) DO UPDATE
                       SET tier = EXCLUDED.tier,
                           low_balance_threshold_cents = EXCLUDED.low_balance_threshold_cents,
                           auto_rebill_enabled = EXCLUDED.auto_rebill_enabled,
                           auto_rebill_amount_cents = EXCLUDED.auto_rebill_amount_cents,
                           updated_at = EXCLUDED.updated_at
                    RETURNING {ACCOUNT_COLUMNS}
                    "#
                ).as_str(),
                &[
                    &caller_id,
                    &settings.tier.as_str(),
                    &settings.low_balance_threshold_cents,
                    &settings.auto_rebill_enabled,
                    &settings.auto_rebill_amount_cents,
                    &now,
                ],
            )
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;
        map_account_row(&row).map_err(WalletStoreError::Db)
    }

    async fn debit(&self, mutation: LedgerMutation) -> Result<DebitOutcome, WalletStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;

        let account_row = tx
            .query_opt(
                format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM trace.wallet_accounts WHERE caller_id = $1 FOR UPDATE"
                ).as_str(),
                &[&mutation.caller_id],
            )
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;
        let Some(account_row) = account_row else {
            return Ok(DebitOutcome::InsufficientFunds { balance_cents: 0 });
        };
        let account = map_account_row(&account_row).map_err(WalletStoreError::Db)?;

        if let Some(trace_id) = mutation.trace_id.as_deref() {
            let existing = tx
                .query_opt(
                    format!(
                        "SELECT {LEDGER_COLUMNS} FROM trace.wallet_ledger \
                         WHERE trace_id = $1 AND kind = 'debit'"
                    ).as_str(),
                    &[&trace_id],
                )
                .await
                .map_err(|error| WalletStoreError::Db(error.to_string()))?;
            if let Some(row) = existing {
                let entry = map_ledger_row(&row).map_err(WalletStoreError::Db)?;
                tx.commit()
                    .await
                    .map_err(|error| WalletStoreError::Db(error.to_string()))?;
                return Ok(DebitOutcome::AlreadyDebited(entry));
            }
        }

        if account.balance_cents < mutation.amount_cents {
            return Ok(DebitOutcome::InsufficientFunds {
                balance_cents: account.balance_cents,
            });
        }

        let before = account.balance_cents;
        let after = before - mutation.amount_cents;
        let account_row = tx
            .query_one(
                format!(
                    r#"
                    UPDATE trace.wallet_accounts
                       SET balance_cents = $2, updated_at = $3
                     WHERE caller_id = $1
                    RETURNING {ACCOUNT_COLUMNS}
                    "#
                ).as_str(),
                &[&mutation.caller_id, &after, &mutation.created_at],
            )
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;
        let account = map_account_row(&account_row).map_err(WalletStoreError::Db)?;
        let entry = ledger_entry(LedgerKind::Debit, mutation, before, after);
        insert_ledger_entry(&tx, &entry).await?;

        tx.commit()
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;
        Ok(DebitOutcome::Debited { entry, account })
    }

    async fn credit(
        &self,
        mutation: LedgerMutation,
    ) -> Result<(LedgerEntry, WalletAccount), WalletStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;

        tx.execute(
            r#"
            INSERT INTO trace.wallet_accounts (caller_id, balance_cents, tier, updated_at)
            VALUES ($1, 0, 'standard', $2)
            ON CONFLICT (caller_id) DO NOTHING
            "#,
            &[&mutation.caller_id, &mutation.created_at],
        )
        .await
        .map_err(|error| WalletStoreError::Db(error.to_string()))?;

        let before: i64 = tx
            .query_one(
                "SELECT balance_cents FROM trace.wallet_accounts WHERE caller_id = $1 FOR UPDATE",
                &[&mutation.caller_id],
            )
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?
            .try_get("balance_cents")
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;
        let after = before + mutation.amount_cents;

        let account_row = tx
            .query_one(
                format!(
                    r#"
                    UPDATE trace.wallet_accounts
                       SET balance_cents = $2, updated_at = $3
                     WHERE caller_id = $1
                    RETURNING {ACCOUNT_COLUMNS}
                    "#
                ).as_str(),
                &[&mutation.caller_id, &after, &mutation.created_at],
            )
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;
        let account = map_account_row(&account_row).map_err(WalletStoreError::Db)?;
        let entry = ledger_entry(LedgerKind::Credit, mutation, before, after);
        insert_ledger_entry(&tx, &entry).await?;

        tx.commit()
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;
        Ok((entry, account))
    }

    async fn debit_for_trace(
        &self,
        trace_id: &str,
    ) -> Result<Option<LedgerEntry>, WalletStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!(
                    "SELECT {LEDGER_COLUMNS} FROM trace.wallet_ledger \
                     WHERE trace_id = $1 AND kind = 'debit'"
                ).as_str(),
                &[&trace_id],
            )
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_ledger_row)
            .transpose()
            .map_err(WalletStoreError::Db)
    }

    async fn list_ledger(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, WalletStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client
            .query(
                format!(
                    "SELECT {LEDGER_COLUMNS} FROM trace.wallet_ledger \
                     WHERE caller_id = $1 ORDER BY created_at DESC, entry_id DESC LIMIT $2"
                ).as_str(),
                &[&caller_id, &limit],
            )
            .await
            .map_err(|error| WalletStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_ledger_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(WalletStoreError::Db)
    }
}

async fn insert_ledger_entry(
    tx: &tokio_postgres::Transaction<'_>,
    entry: &LedgerEntry,
) -> Result<(), WalletStoreError> {
    tx.execute(
        r#"
        INSERT INTO trace.wallet_ledger (
            entry_id, caller_id, kind, amount_cents, balance_before_cents,
            balance_after_cents, reason, trace_id, created_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
        "#,
        &[
            &entry.entry_id,
            &entry.caller_id,
            &entry.kind.as_str(),
            &entry.amount_cents,
            &entry.balance_before_cents,
            &entry.balance_after_cents,
            &entry.reason,
            &entry.trace_id,
            &entry.created_at,
        ],
    )
    .await
    .map_err(|error| {
        if error.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
            WalletStoreError::Conflict("trace already debited".to_string())
        } else {
            WalletStoreError::Db(error.to_string())
        }
    })?;
    Ok(())
}

fn map_account_row(row: &tokio_postgres::Row) -> Result<WalletAccount, String> {
    let tier: String = row.try_get("tier").map_err(|e| e.to_string())?;
    Ok(WalletAccount {
        caller_id: row.try_get("caller_id").map_err(|e| e.to_string())?,
        balance_cents: row.try_get("balance_cents").map_err(|e| e.to_string())?,
        tier: CallerTier::parse(&tier).ok_or_else(|| format!("unknown tier {tier}"))?,
        low_balance_threshold_cents: row
            .try_get("low_balance_threshold_cents")
            .map_err(|e| e.to_string())?,
        auto_rebill_enabled: row
            .try_get("auto_rebill_enabled")
            .map_err(|e| e.to_string())?,
        auto_rebill_amount_cents: row
            .try_get("auto_rebill_amount_cents")
            .map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}

fn map_ledger_row(row: &tokio_postgres::Row) -> Result<LedgerEntry, String> {
    let kind: String = row.try_get("kind").map_err(|e| e.to_string())?;
    Ok(LedgerEntry {
        entry_id: row.try_get("entry_id").map_err(|e| e.to_string())?,
        caller_id: row.try_get("caller_id").map_err(|e| e.to_string())?,
        kind: LedgerKind::parse(&kind).ok_or_else(|| format!("unknown ledger kind {kind}"))?,
        amount_cents: row.try_get("amount_cents").map_err(|e| e.to_string())?,
        balance_before_cents: row
            .try_get("balance_before_cents")
            .map_err(|e| e.to_string())?,
        balance_after_cents: row
            .try_get("balance_after_cents")
            .map_err(|e| e.to_string())?,
        reason: row.try_get("reason").map_err(|e| e.to_string())?,
        trace_id: row.try_get("trace_id").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
    })
}
