//! Storage: the sole owner of durable state (spec §4.1). Grounded on the
//! teacher's `vault/vault_db.rs` for the `Arc<tokio::sync::Mutex<Connection>>`
//! wrapper and WAL pragma setup, and on `original_source/src/hyperliquid/storage/db.py` for
//! every table, key, and operation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::storage::audit::AuditEntry;
use crate::storage::schema::{CREATE_TABLES_SQL, DB_SCHEMA_VERSION};
use crate::types::{CorrId, Ms, Px, Qty, Sym};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderIntent {
    pub correlation_id: CorrId,
    pub client_order_id: Option<String>,
    pub symbol: Sym,
    pub side: String,
    pub order_type: String,
    pub qty: Qty,
    pub price: Option<Px>,
    pub reduce_only: bool,
    pub time_in_force: String,
    pub is_replay: bool,
    pub strategy_version: String,
    pub risk_notes: Option<String>,
    pub contract_version: String,
}

impl OrderIntent {
    /// Structural equality ignoring `client_order_id`, used by `ensure_intent`
    /// (spec §4.1: "verify structural equality (minus client_order_id)").
    pub fn structurally_eq(&self, other: &OrderIntent) -> bool {
        self.correlation_id == other.correlation_id
            && self.symbol == other.symbol
            && self.side == other.side
            && self.order_type == other.order_type
            && self.qty == other.qty
            && self.price == other.price
            && self.reduce_only == other.reduce_only
            && self.time_in_force == other.time_in_force
            && self.is_replay == other.is_replay
            && self.strategy_version == other.strategy_version
            && self.contract_version == other.contract_version
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResult {
    pub correlation_id: CorrId,
    pub exchange_order_id: Option<String>,
    pub status: String,
    pub filled_qty: Qty,
    pub avg_price: Option<Px>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub contract_version: String,
    pub created_at_ms: Ms,
    pub updated_at_ms: Ms,
}

#[derive(Debug, Clone)]
pub struct BaselineSnapshot {
    pub baseline_id: String,
    pub created_at_ms: Ms,
    pub operator: String,
    pub reason_message: String,
    pub positions: HashMap<Sym, Qty>,
}

fn event_key(timestamp_ms: Ms, event_index: i64, tx_hash: &str, symbol: &str) -> String {
    format!("{timestamp_ms}|{event_index}|{tx_hash}|{symbol}")
}

fn parse_event_key(key: &str) -> Option<(Ms, i64, String, String)> {
    let mut parts = key.splitn(4, '|');
    let ts: Ms = parts.next()?.parse().ok()?;
    let idx: i64 = parts.next()?.parse().ok()?;
    let tx = parts.next()?.to_string();
    let sym = parts.next()?.to_string();
    Some((ts, idx, tx, sym))
}

/// `(timestamp_ms, event_index, tx_hash, symbol)` tuple ordering per spec §3.
fn should_advance_cursor(
    current_key: Option<&str>,
    timestamp_ms: Ms,
    event_index: i64,
    tx_hash: &str,
    symbol: &str,
) -> bool {
    let Some(current_key) = current_key else {
        return true;
    };
    let Some((cur_ts, cur_idx, cur_tx, cur_sym)) = parse_event_key(current_key) else {
        return true;
    };
    (cur_ts, cur_idx, cur_tx.as_str(), cur_sym.as_str()) < (timestamp_ms, event_index, tx_hash, symbol)
}

#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl Storage {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("create db parent dir")?;
            }
        }
        let conn = rusqlite::Connection::open(db_path).context("open sqlite db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.execute_batch(CREATE_TABLES_SQL)
            .context("create tables")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Compares the stored `schema_version` against [`DB_SCHEMA_VERSION`].
    /// Bootstraps the value on first run; a mismatch is a hard failure the
    /// orchestrator must treat as a HALT condition (spec §4.1).
    pub async fn ensure_schema(&self) -> Result<(), PipelineError> {
        let conn = self.conn.lock().await;
        let existing = get_system_state(&conn, "schema_version")
            .map_err(|e| PipelineError::ConfigInvalid(e.to_string()))?;
        match existing {
            None => {
                set_system_state(&conn, "schema_version", DB_SCHEMA_VERSION)
                    .map_err(|e| PipelineError::ConfigInvalid(e.to_string()))?;
                Ok(())
            }
            Some(version) if version == DB_SCHEMA_VERSION => Ok(()),
            Some(_) => Err(PipelineError::SchemaMismatch),
        }
    }

    pub async fn get_system_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        get_system_state(&conn, key)
    }

    pub async fn set_system_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        set_system_state(&conn, key, value)
    }

    pub async fn has_processed(&self, tx_hash: &str, event_index: i64, symbol: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_txs WHERE tx_hash = ?1 AND event_index = ?2 AND symbol = ?3",
                params![tx_hash, event_index, symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Atomically records the processed-tx row and advances the cursor if the
    /// new tuple is strictly greater (spec §4.1/§4.3 step 6). Returns whether
    /// the cursor advanced.
    pub async fn record_processed_and_advance_cursor(
        &self,
        tx_hash: &str,
        event_index: i64,
        symbol: &str,
        timestamp_ms: Ms,
        is_replay: bool,
        now_ms: Ms,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO processed_txs(tx_hash, event_index, symbol, timestamp_ms, is_replay, created_at_ms) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![tx_hash, event_index, symbol, timestamp_ms, is_replay as i64, now_ms],
        )?;
        let current_key: Option<String> = tx
            .query_row(
                "SELECT value FROM system_state WHERE key = 'last_processed_event_key'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let advanced = should_advance_cursor(current_key.as_deref(), timestamp_ms, event_index, tx_hash, symbol);
        if advanced {
            let key = event_key(timestamp_ms, event_index, tx_hash, symbol);
            tx.execute(
                "INSERT INTO system_state(key, value, updated_at_ms) VALUES('last_processed_timestamp_ms', ?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
                params![timestamp_ms.to_string(), now_ms],
            )?;
            tx.execute(
                "INSERT INTO system_state(key, value, updated_at_ms) VALUES('last_processed_event_key', ?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
                params![key, now_ms],
            )?;
        }
        tx.commit()?;
        Ok(advanced)
    }

    /// Unconditionally stamps the cursor, bypassing the monotonic
    /// comparison `record_processed_and_advance_cursor` applies. Used only
    /// by the maintenance-skip path (spec §4.3 step 1), which is a
    /// deliberate forward jump past an enforced gap, not an admitted event.
    pub async fn force_set_cursor(&self, timestamp_ms: Ms, event_index: i64, tx_hash: &str, symbol: &str, now_ms: Ms) -> Result<()> {
        let conn = self.conn.lock().await;
        let key = event_key(timestamp_ms, event_index, tx_hash, symbol);
        conn.execute(
            "INSERT INTO system_state(key, value, updated_at_ms) VALUES('last_processed_timestamp_ms', ?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
            params![timestamp_ms.to_string(), now_ms],
        )?;
        conn.execute(
            "INSERT INTO system_state(key, value, updated_at_ms) VALUES('last_processed_event_key', ?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
            params![key, now_ms],
        )?;
        Ok(())
    }

    pub async fn cleanup_processed_txs(&self, dedup_ttl_seconds: i64, now_ms: Ms) -> Result<usize> {
        if dedup_ttl_seconds < 0 {
            anyhow::bail!("dedup_ttl_seconds must be >= 0");
        }
        let threshold_ms = now_ms - dedup_ttl_seconds * 1000;
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "DELETE FROM processed_txs WHERE created_at_ms < ?1",
            params![threshold_ms],
        )?;
        Ok(affected)
    }

    /// If an intent for `correlation_id` already exists, verifies structural
    /// equality (minus `client_order_id`) and backfills a missing
    /// `client_order_id` on either side. Otherwise inserts it fresh.
    pub async fn ensure_intent(&self, mut intent: OrderIntent, now_ms: Ms) -> Result<OrderIntent, PipelineError> {
        let conn = self.conn.lock().await;
        let existing_payload: Option<String> = conn
            .query_row(
                "SELECT intent_payload FROM order_intents WHERE correlation_id = ?1",
                params![intent.correlation_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| PipelineError::IntentMismatch(e.to_string()))?;

        if let Some(payload) = existing_payload {
            let mut existing: OrderIntent = serde_json::from_str(&payload)
                .map_err(|e| PipelineError::IntentMismatch(e.to_string()))?;
            if !existing.structurally_eq(&intent) {
                return Err(PipelineError::IntentMismatch(intent.correlation_id.clone()));
            }
            if existing.client_order_id.is_none() {
                existing.client_order_id = intent.client_order_id.clone();
                let payload = serde_json::to_string(&existing)
                    .map_err(|e| PipelineError::IntentMismatch(e.to_string()))?;
                conn.execute(
                    "UPDATE order_intents SET intent_payload = ?1 WHERE correlation_id = ?2",
                    params![payload, existing.correlation_id],
                )
                .map_err(|e| PipelineError::IntentMismatch(e.to_string()))?;
            } else if intent.client_order_id.is_none() {
                intent.client_order_id = existing.client_order_id.clone();
            }
            return Ok(existing);
        }

        let payload = serde_json::to_string(&intent).map_err(|e| PipelineError::IntentMismatch(e.to_string()))?;
        conn.execute(
            "INSERT INTO order_intents(correlation_id, intent_payload, created_at_ms) VALUES(?1, ?2, ?3)",
            params![intent.correlation_id, payload, now_ms],
        )
        .map_err(|e| PipelineError::IntentMismatch(e.to_string()))?;
        Ok(intent)
    }

    pub async fn get_result(&self, correlation_id: &str) -> Result<Option<OrderResult>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT correlation_id, exchange_order_id, status, filled_qty, avg_price, error_code, \
             error_message, contract_version, created_at_ms, updated_at_ms \
             FROM order_results WHERE correlation_id = ?1",
            params![correlation_id],
            row_to_order_result,
        )
        .optional()
        .context("get_result")
    }

    /// Idempotent upsert that preserves `created_at_ms` across updates.
    pub async fn upsert_result(&self, result: &OrderResult, now_ms: Ms) -> Result<()> {
        let conn = self.conn.lock().await;
        let existing_created_at: Option<i64> = conn
            .query_row(
                "SELECT created_at_ms FROM order_results WHERE correlation_id = ?1",
                params![result.correlation_id],
                |row| row.get(0),
            )
            .optional()?;
        let created_at_ms = existing_created_at.unwrap_or(result.created_at_ms.max(now_ms));
        conn.execute(
            "INSERT INTO order_results(correlation_id, exchange_order_id, status, filled_qty, avg_price, \
             error_code, error_message, contract_version, created_at_ms, updated_at_ms) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(correlation_id) DO UPDATE SET \
                exchange_order_id=excluded.exchange_order_id, \
                status=excluded.status, \
                filled_qty=excluded.filled_qty, \
                avg_price=excluded.avg_price, \
                error_code=excluded.error_code, \
                error_message=excluded.error_message, \
                contract_version=excluded.contract_version, \
                updated_at_ms=excluded.updated_at_ms",
            params![
                result.correlation_id,
                result.exchange_order_id,
                result.status,
                result.filled_qty.to_string(),
                result.avg_price.map(|p| p.to_string()),
                result.error_code,
                result.error_message,
                result.contract_version,
                created_at_ms,
                now_ms,
            ],
        )?;
        Ok(())
    }

    /// Records an audit entry. Never propagates failure to the caller — an
    /// audit write that fails is logged only (spec §7).
    pub async fn record_audit(&self, entry: &AuditEntry) {
        let conn = self.conn.lock().await;
        let metadata = entry.metadata.clone();
        let result = conn.execute(
            "INSERT INTO audit_log(timestamp_ms, category, entity_id, from_state, to_state, \
             reason_code, reason_message, event_id, metadata) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.timestamp_ms,
                entry.category,
                entry.entity_id,
                entry.from_state,
                entry.to_state,
                entry.reason_code,
                entry.reason_message,
                entry.event_id,
                metadata,
            ],
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, category = %entry.category, "audit write failed");
        }
    }

    /// Most recent audit rows, newest first. Used by the `doctor` CLI
    /// subcommand to show an operator what happened leading up to the
    /// current safety state.
    pub async fn recent_audit_entries(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT timestamp_ms, category, entity_id, from_state, to_state, reason_code, reason_message, event_id, metadata \
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(AuditEntry {
                    timestamp_ms: row.get(0)?,
                    category: row.get(1)?,
                    entity_id: row.get(2)?,
                    from_state: row.get(3)?,
                    to_state: row.get(4)?,
                    reason_code: row.get(5)?,
                    reason_message: row.get(6)?,
                    event_id: row.get(7)?,
                    metadata: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn get_active_baseline(&self) -> Result<Option<BaselineSnapshot>> {
        let conn = self.conn.lock().await;
        let row: Option<(String, i64, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT baseline_id, created_at_ms, operator, reason_message \
                 FROM baseline_snapshots WHERE active = 1 ORDER BY created_at_ms DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((baseline_id, created_at_ms, operator, reason_message)) = row else {
            return Ok(None);
        };
        let mut stmt = conn.prepare("SELECT symbol, qty FROM baseline_positions WHERE baseline_id = ?1")?;
        let positions = stmt
            .query_map(params![baseline_id], |row| {
                let symbol: String = row.get(0)?;
                let qty: String = row.get(1)?;
                Ok((symbol, qty))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(symbol, qty)| {
                let qty: Qty = qty.parse().unwrap_or_default();
                (Sym::new(symbol), qty)
            })
            .collect();
        Ok(Some(BaselineSnapshot {
            baseline_id,
            created_at_ms,
            operator: operator.unwrap_or_default(),
            reason_message: reason_message.unwrap_or_default(),
            positions,
        }))
    }

    /// Deactivates any existing active baseline and inserts a new one. Fails
    /// with `baseline_active_exists` if `replace` is false and one exists.
    pub async fn create_baseline(
        &self,
        positions: &HashMap<Sym, Qty>,
        operator: &str,
        reason_message: &str,
        replace: bool,
        now_ms: Ms,
    ) -> Result<BaselineSnapshot> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if !replace {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT baseline_id FROM baseline_snapshots WHERE active = 1 LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                anyhow::bail!("baseline_active_exists");
            }
        }
        tx.execute("UPDATE baseline_snapshots SET active = 0 WHERE active = 1", [])?;
        let baseline_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO baseline_snapshots(baseline_id, created_at_ms, operator, reason_message, active) \
             VALUES(?1, ?2, ?3, ?4, 1)",
            params![baseline_id, now_ms, operator, reason_message],
        )?;
        for (symbol, qty) in positions {
            tx.execute(
                "INSERT INTO baseline_positions(baseline_id, symbol, qty) VALUES(?1, ?2, ?3)",
                params![baseline_id, symbol.as_str(), qty.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(BaselineSnapshot {
            baseline_id,
            created_at_ms: now_ms,
            operator: operator.to_string(),
            reason_message: reason_message.to_string(),
            positions: positions.clone(),
        })
    }

    pub async fn deactivate_all_baselines(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE baseline_snapshots SET active = 0 WHERE active = 1", [])?;
        Ok(())
    }

    /// Local position snapshot for reconciliation and Decision inputs: sums
    /// filled quantities across every `order_results`/`order_intents` pair,
    /// signed by side, then folds in the active baseline (spec §4.6: "local
    /// snapshot (positions reconstructed from order_results filled_qty
    /// signed by side, plus the active baseline)").
    pub async fn reconstruct_local_positions(&self) -> Result<HashMap<Sym, Qty>> {
        let rows: Vec<(String, String)> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT oi.intent_payload, r.filled_qty FROM order_results r \
                 JOIN order_intents oi ON oi.correlation_id = r.correlation_id \
                 WHERE r.filled_qty != 0",
            )?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut positions: HashMap<Sym, Qty> = HashMap::new();
        for (payload, filled_qty) in rows {
            let Ok(intent) = serde_json::from_str::<OrderIntent>(&payload) else {
                continue;
            };
            let filled: Qty = filled_qty.parse().unwrap_or_default();
            let signed = if intent.side == "BUY" { filled } else { -filled };
            *positions.entry(intent.symbol).or_insert_with(Qty::default) += signed;
        }

        if let Some(baseline) = self.get_active_baseline().await? {
            for (symbol, qty) in baseline.positions {
                *positions.entry(symbol).or_insert_with(Qty::default) += qty;
            }
        }
        Ok(positions)
    }
}

fn get_system_state(conn: &rusqlite::Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM system_state WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .context("get_system_state")
}

fn set_system_state(conn: &rusqlite::Connection, key: &str, value: &str) -> Result<()> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO system_state(key, value, updated_at_ms) VALUES(?1, ?2, ?3) \
         ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
        params![key, value, now_ms],
    )?;
    Ok(())
}

fn row_to_order_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderResult> {
    let filled_qty: String = row.get(3)?;
    let avg_price: Option<String> = row.get(4)?;
    Ok(OrderResult {
        correlation_id: row.get(0)?,
        exchange_order_id: row.get(1)?,
        status: row.get(2)?,
        filled_qty: filled_qty.parse().unwrap_or_default(),
        avg_price: avg_price.and_then(|p| p.parse().ok()),
        error_code: row.get(5)?,
        error_message: row.get(6)?,
        contract_version: row.get(7)?,
        created_at_ms: row.get(8)?,
        updated_at_ms: row.get(9)?,
    })
}
