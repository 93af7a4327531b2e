//! DDL and schema-version bookkeeping, carried over verbatim in shape from
//! `storage/db.py::_create_tables` / `DB_SCHEMA_VERSION`.

pub const DB_SCHEMA_VERSION: &str = "4";

pub const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS processed_txs (
    tx_hash TEXT NOT NULL,
    event_index INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    is_replay INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    PRIMARY KEY (tx_hash, event_index, symbol)
);

CREATE INDEX IF NOT EXISTS idx_processed_txs_created_at_ms
    ON processed_txs(created_at_ms);
CREATE INDEX IF NOT EXISTS idx_processed_txs_timestamp_ms
    ON processed_txs(timestamp_ms);

CREATE TABLE IF NOT EXISTS trade_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    price REAL NOT NULL,
    pnl REAL,
    status TEXT NOT NULL,
    exchange_order_id TEXT,
    tx_hash TEXT,
    created_at_ms INTEGER NOT NULL,
    UNIQUE (correlation_id)
);

CREATE INDEX IF NOT EXISTS idx_trade_history_correlation_id
    ON trade_history(correlation_id);
CREATE INDEX IF NOT EXISTS idx_trade_history_tx_hash
    ON trade_history(tx_hash);
CREATE INDEX IF NOT EXISTS idx_trade_history_exchange_order_id
    ON trade_history(exchange_order_id);

CREATE TABLE IF NOT EXISTS system_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS order_intents (
    correlation_id TEXT PRIMARY KEY,
    intent_payload TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS order_results (
    correlation_id TEXT PRIMARY KEY,
    exchange_order_id TEXT,
    status TEXT NOT NULL,
    filled_qty REAL NOT NULL,
    avg_price REAL,
    error_code TEXT,
    error_message TEXT,
    contract_version TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_order_results_status
    ON order_results(status);
CREATE INDEX IF NOT EXISTS idx_order_results_exchange_order_id
    ON order_results(exchange_order_id);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp_ms INTEGER NOT NULL,
    category TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    from_state TEXT,
    to_state TEXT,
    reason_code TEXT,
    reason_message TEXT,
    event_id TEXT,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_log_category
    ON audit_log(category);
CREATE INDEX IF NOT EXISTS idx_audit_log_entity_id
    ON audit_log(entity_id);
CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp_ms
    ON audit_log(timestamp_ms);

CREATE TABLE IF NOT EXISTS baseline_snapshots (
    baseline_id TEXT PRIMARY KEY,
    created_at_ms INTEGER NOT NULL,
    operator TEXT,
    reason_message TEXT,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS baseline_positions (
    baseline_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    qty REAL NOT NULL,
    PRIMARY KEY (baseline_id, symbol)
);

CREATE INDEX IF NOT EXISTS idx_baseline_snapshots_active
    ON baseline_snapshots(active, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_baseline_positions_baseline_id
    ON baseline_positions(baseline_id);
"#;
