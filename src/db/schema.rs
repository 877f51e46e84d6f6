//! Versioned schema for the durable local store.
//!
//! Migrations run in order and are recorded in `PRAGMA user_version`. A
//! migration may add tables or indexes but must never drop `records` rows:
//! the pending-operation log lives there.

/// `(version, sql)` pairs, applied in ascending order.
pub const MIGRATIONS: &[(i32, &str)] = &[(1, V1_RECORDS), (2, V2_LEASES)];

/// Latest schema version.
pub fn latest_version() -> i32 {
  MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}

const V1_RECORDS: &str = r#"
-- Every collection shares one table; seq preserves insertion order
CREATE TABLE IF NOT EXISTS records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    record_key TEXT NOT NULL,
    data TEXT NOT NULL,
    UNIQUE (collection, record_key)
);

-- Secondary index values, rewritten on every put
CREATE TABLE IF NOT EXISTS record_indexes (
    collection TEXT NOT NULL,
    index_name TEXT NOT NULL,
    index_value TEXT NOT NULL,
    record_key TEXT NOT NULL,
    PRIMARY KEY (collection, index_name, record_key)
);

CREATE INDEX IF NOT EXISTS idx_record_indexes_lookup
    ON record_indexes(collection, index_name, index_value);

-- Autoincrement counters per collection
CREATE TABLE IF NOT EXISTS sequences (
    collection TEXT PRIMARY KEY,
    next_value INTEGER NOT NULL
);
"#;

const V2_LEASES: &str = r#"
-- Named leases shared by every process using this database
CREATE TABLE IF NOT EXISTS leases (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;
