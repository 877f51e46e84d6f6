//! Durable local store.
//!
//! A persistent, multi-collection record store over SQLite. Records are JSON
//! objects keyed by a per-collection primary key field; each collection
//! declares secondary indexes that are maintained on every `put`.

pub mod schema;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{OfflineError, Result};

/// Named collections of the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  /// Pending-operation log
  OfflineData,
  Properties,
  RentEntries,
  ExpenseEntries,
  Tags,
  /// Persisted read-cache entries
  CacheEntries,
}

impl Collection {
  pub fn name(&self) -> &'static str {
    match self {
      Collection::OfflineData => "offlineData",
      Collection::Properties => "properties",
      Collection::RentEntries => "rentEntries",
      Collection::ExpenseEntries => "expenseEntries",
      Collection::Tags => "tags",
      Collection::CacheEntries => "cacheEntries",
    }
  }

  /// Field holding the primary key.
  pub fn key_field(&self) -> &'static str {
    match self {
      Collection::CacheEntries => "key",
      _ => "id",
    }
  }

  /// Secondary indexes maintained for this collection.
  pub fn indexes(&self) -> &'static [&'static str] {
    match self {
      Collection::OfflineData => &["tableName", "recordId", "timestamp", "synced"],
      Collection::Properties => &["name"],
      Collection::RentEntries => &["propertyId", "date"],
      Collection::ExpenseEntries => &["propertyId", "date", "category"],
      Collection::Tags => &["name"],
      Collection::CacheEntries => &[],
    }
  }

  fn key_of(&self, record: &Value) -> Result<String> {
    record
      .get(self.key_field())
      .and_then(index_value)
      .ok_or_else(|| {
        OfflineError::InvalidRecord(format!(
          "record for '{}' is missing its '{}' key",
          self.name(),
          self.key_field()
        ))
      })
  }

  fn check_index(&self, index: &str) -> Result<()> {
    if self.indexes().contains(&index) {
      Ok(())
    } else {
      Err(OfflineError::InvalidRecord(format!(
        "collection '{}' has no index '{}'",
        self.name(),
        index
      )))
    }
  }
}

/// Text form of a key or index value; `None` for values that are not indexed.
fn index_value(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

/// Trait for durable store backends.
pub trait LocalStore: Send + Sync {
  /// Upsert a record by its primary key.
  fn put(&self, collection: Collection, record: &Value) -> Result<()>;

  /// Replace the whole contents of a collection in one step.
  fn replace_all(&self, collection: Collection, records: &[Value]) -> Result<()>;

  fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>>;

  /// All records in insertion order.
  fn get_all(&self, collection: Collection) -> Result<Vec<Value>>;

  /// Records whose `index` field equals `value`, in insertion order.
  fn get_by_index(&self, collection: Collection, index: &str, value: &Value) -> Result<Vec<Value>>;

  fn delete(&self, collection: Collection, key: &str) -> Result<()>;

  fn clear(&self, collection: Collection) -> Result<()>;

  fn count(&self, collection: Collection) -> Result<usize>;

  /// Next value of the collection's autoincrement counter, starting at 1.
  fn next_id(&self, collection: Collection) -> Result<i64>;

  /// Take or renew the named lease. Returns false if another owner holds an
  /// unexpired lease.
  fn acquire_lease(&self, name: &str, owner: &str, now_ms: i64, ttl_ms: i64) -> Result<bool>;

  fn release_lease(&self, name: &str, owner: &str) -> Result<()>;

  fn is_available(&self) -> bool {
    true
  }
}

/// Store used when persistence cannot be opened.
/// Every operation fails with `StorageUnavailable`.
pub struct UnavailableStore {
  reason: String,
}

impl UnavailableStore {
  pub fn new(reason: impl Into<String>) -> Self {
    Self {
      reason: reason.into(),
    }
  }

  fn fail<T>(&self) -> Result<T> {
    Err(OfflineError::StorageUnavailable(self.reason.clone()))
  }
}

impl LocalStore for UnavailableStore {
  fn put(&self, _collection: Collection, _record: &Value) -> Result<()> {
    self.fail()
  }

  fn replace_all(&self, _collection: Collection, _records: &[Value]) -> Result<()> {
    self.fail()
  }

  fn get(&self, _collection: Collection, _key: &str) -> Result<Option<Value>> {
    self.fail()
  }

  fn get_all(&self, _collection: Collection) -> Result<Vec<Value>> {
    self.fail()
  }

  fn get_by_index(&self, _collection: Collection, _index: &str, _value: &Value) -> Result<Vec<Value>> {
    self.fail()
  }

  fn delete(&self, _collection: Collection, _key: &str) -> Result<()> {
    self.fail()
  }

  fn clear(&self, _collection: Collection) -> Result<()> {
    self.fail()
  }

  fn count(&self, _collection: Collection) -> Result<usize> {
    self.fail()
  }

  fn next_id(&self, _collection: Collection) -> Result<i64> {
    self.fail()
  }

  fn acquire_lease(&self, _name: &str, _owner: &str, _now_ms: i64, _ttl_ms: i64) -> Result<bool> {
    self.fail()
  }

  fn release_lease(&self, _name: &str, _owner: &str) -> Result<()> {
    self.fail()
  }

  fn is_available(&self) -> bool {
    false
  }
}

/// SQLite-backed durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at `path`, running pending migrations.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        OfflineError::StorageUnavailable(format!("Failed to create data directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      OfflineError::StorageUnavailable(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|d| d.join("rentsync").join("offline.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| OfflineError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  /// Current `user_version` of the database.
  pub fn schema_version(&self) -> Result<i32> {
    let conn = self.lock()?;
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
  }

  fn run_migrations(&self) -> Result<()> {
    let mut conn = self.lock()?;
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (version, sql) in schema::MIGRATIONS {
      if *version <= current {
        continue;
      }
      let tx = conn.transaction()?;
      tx.execute_batch(sql)
        .map_err(|e| OfflineError::StorageUnavailable(format!("Migration {} failed: {}", version, e)))?;
      tx.pragma_update(None, "user_version", version)?;
      tx.commit()?;
      info!(version, "Applied local store migration");
    }

    Ok(())
  }

  fn write_record(tx: &rusqlite::Transaction<'_>, collection: Collection, record: &Value) -> Result<()> {
    let key = collection.key_of(record)?;
    let data = serde_json::to_string(record)?;

    tx.execute(
      "INSERT INTO records (collection, record_key, data) VALUES (?1, ?2, ?3)
       ON CONFLICT(collection, record_key) DO UPDATE SET data = excluded.data",
      params![collection.name(), key, data],
    )?;

    tx.execute(
      "DELETE FROM record_indexes WHERE collection = ?1 AND record_key = ?2",
      params![collection.name(), key],
    )?;

    for index in collection.indexes() {
      if let Some(value) = record.get(*index).and_then(index_value) {
        tx.execute(
          "INSERT INTO record_indexes (collection, index_name, index_value, record_key)
           VALUES (?1, ?2, ?3, ?4)",
          params![collection.name(), index, value, key],
        )?;
      }
    }

    Ok(())
  }

  fn clear_in(tx: &rusqlite::Transaction<'_>, collection: Collection) -> Result<()> {
    tx.execute(
      "DELETE FROM records WHERE collection = ?1",
      params![collection.name()],
    )?;
    tx.execute(
      "DELETE FROM record_indexes WHERE collection = ?1",
      params![collection.name()],
    )?;
    Ok(())
  }
}

fn decode_rows(rows: Vec<String>) -> Result<Vec<Value>> {
  rows
    .into_iter()
    .map(|data| serde_json::from_str(&data).map_err(OfflineError::from))
    .collect()
}

impl LocalStore for SqliteStore {
  fn put(&self, collection: Collection, record: &Value) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    Self::write_record(&tx, collection, record)?;
    tx.commit()?;
    Ok(())
  }

  fn replace_all(&self, collection: Collection, records: &[Value]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    Self::clear_in(&tx, collection)?;
    for record in records {
      Self::write_record(&tx, collection, record)?;
    }
    tx.commit()?;
    debug!(collection = collection.name(), count = records.len(), "Replaced collection");
    Ok(())
  }

  fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
    let conn = self.lock()?;
    let data: Option<String> = conn
      .query_row(
        "SELECT data FROM records WHERE collection = ?1 AND record_key = ?2",
        params![collection.name(), key],
        |row| row.get(0),
      )
      .optional()?;

    match data {
      Some(d) => Ok(Some(serde_json::from_str(&d)?)),
      None => Ok(None),
    }
  }

  fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT data FROM records WHERE collection = ?1 ORDER BY seq")?;
    let rows = stmt
      .query_map(params![collection.name()], |row| row.get::<_, String>(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    decode_rows(rows)
  }

  fn get_by_index(&self, collection: Collection, index: &str, value: &Value) -> Result<Vec<Value>> {
    collection.check_index(index)?;
    let Some(value) = index_value(value) else {
      return Ok(Vec::new());
    };

    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT r.data FROM records r
       INNER JOIN record_indexes i
         ON i.collection = r.collection AND i.record_key = r.record_key
       WHERE i.collection = ?1 AND i.index_name = ?2 AND i.index_value = ?3
       ORDER BY r.seq",
    )?;
    let rows = stmt
      .query_map(params![collection.name(), index, value], |row| {
        row.get::<_, String>(0)
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    decode_rows(rows)
  }

  fn delete(&self, collection: Collection, key: &str) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM records WHERE collection = ?1 AND record_key = ?2",
      params![collection.name(), key],
    )?;
    tx.execute(
      "DELETE FROM record_indexes WHERE collection = ?1 AND record_key = ?2",
      params![collection.name(), key],
    )?;
    tx.commit()?;
    Ok(())
  }

  fn clear(&self, collection: Collection) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    Self::clear_in(&tx, collection)?;
    tx.commit()?;
    Ok(())
  }

  fn count(&self, collection: Collection) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM records WHERE collection = ?1",
      params![collection.name()],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  fn next_id(&self, collection: Collection) -> Result<i64> {
    let conn = self.lock()?;
    Ok(conn.query_row(
      "INSERT INTO sequences (collection, next_value) VALUES (?1, 1)
       ON CONFLICT(collection) DO UPDATE SET next_value = next_value + 1
       RETURNING next_value",
      params![collection.name()],
      |row| row.get(0),
    )?)
  }

  fn acquire_lease(&self, name: &str, owner: &str, now_ms: i64, ttl_ms: i64) -> Result<bool> {
    let conn = self.lock()?;
    let changed = conn.execute(
      "INSERT INTO leases (name, owner, expires_at) VALUES (?1, ?2, ?3)
       ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
       WHERE leases.owner = excluded.owner OR leases.expires_at <= ?4",
      params![name, owner, now_ms + ttl_ms, now_ms],
    )?;
    Ok(changed > 0)
  }

  fn release_lease(&self, name: &str, owner: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM leases WHERE name = ?1 AND owner = ?2",
      params![name, owner],
    )?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store() -> SqliteStore {
    SqliteStore::open_in_memory().unwrap()
  }

  #[test]
  fn test_put_overwrites_and_keeps_order() {
    let store = store();
    store.put(Collection::Properties, &json!({"id": "a", "name": "First"})).unwrap();
    store.put(Collection::Properties, &json!({"id": "b", "name": "Second"})).unwrap();
    store.put(Collection::Properties, &json!({"id": "a", "name": "Renamed"})).unwrap();

    let all = store.get_all(Collection::Properties).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0]["name"], "Renamed");
    assert_eq!(all[1]["id"], "b");
  }

  #[test]
  fn test_get_by_index_tracks_updates() {
    let store = store();
    store
      .put(Collection::OfflineData, &json!({"id": 1, "tableName": "tags", "synced": false}))
      .unwrap();
    store
      .put(Collection::OfflineData, &json!({"id": 2, "tableName": "tags", "synced": false}))
      .unwrap();
    store
      .put(Collection::OfflineData, &json!({"id": 1, "tableName": "tags", "synced": true}))
      .unwrap();

    let unsynced = store
      .get_by_index(Collection::OfflineData, "synced", &json!(false))
      .unwrap();
    assert_eq!(unsynced.len(), 1);
    assert_eq!(unsynced[0]["id"], 2);

    let synced = store
      .get_by_index(Collection::OfflineData, "synced", &json!(true))
      .unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0]["id"], 1);
  }

  #[test]
  fn test_unknown_index_is_rejected() {
    let store = store();
    let result = store.get_by_index(Collection::Tags, "propertyId", &json!("p1"));
    assert!(matches!(result, Err(OfflineError::InvalidRecord(_))));
  }

  #[test]
  fn test_missing_key_is_rejected() {
    let store = store();
    let result = store.put(Collection::Tags, &json!({"name": "no id"}));
    assert!(matches!(result, Err(OfflineError::InvalidRecord(_))));
  }

  #[test]
  fn test_collections_are_isolated() {
    let store = store();
    store.put(Collection::Tags, &json!({"id": "1", "name": "t"})).unwrap();
    store.put(Collection::Properties, &json!({"id": "1", "name": "p"})).unwrap();

    store.clear(Collection::Tags).unwrap();
    assert_eq!(store.count(Collection::Tags).unwrap(), 0);
    assert_eq!(store.count(Collection::Properties).unwrap(), 1);
  }

  #[test]
  fn test_delete_and_get() {
    let store = store();
    store.put(Collection::Tags, &json!({"id": "1", "name": "t"})).unwrap();
    assert!(store.get(Collection::Tags, "1").unwrap().is_some());
    store.delete(Collection::Tags, "1").unwrap();
    assert!(store.get(Collection::Tags, "1").unwrap().is_none());
    // Deleting again is fine
    store.delete(Collection::Tags, "1").unwrap();
  }

  #[test]
  fn test_replace_all() {
    let store = store();
    store.put(Collection::RentEntries, &json!({"id": "old", "propertyId": "p1"})).unwrap();
    store
      .replace_all(
        Collection::RentEntries,
        &[json!({"id": "n1", "propertyId": "p1"}), json!({"id": "n2", "propertyId": "p2"})],
      )
      .unwrap();

    assert!(store.get(Collection::RentEntries, "old").unwrap().is_none());
    let for_p1 = store
      .get_by_index(Collection::RentEntries, "propertyId", &json!("p1"))
      .unwrap();
    assert_eq!(for_p1.len(), 1);
    assert_eq!(for_p1[0]["id"], "n1");
  }

  #[test]
  fn test_next_id_is_per_collection() {
    let store = store();
    assert_eq!(store.next_id(Collection::OfflineData).unwrap(), 1);
    assert_eq!(store.next_id(Collection::OfflineData).unwrap(), 2);
    assert_eq!(store.next_id(Collection::CacheEntries).unwrap(), 1);
  }

  #[test]
  fn test_lease_exclusion_and_expiry() {
    let store = store();
    assert!(store.acquire_lease("sync", "tab-a", 1_000, 500).unwrap());
    assert!(!store.acquire_lease("sync", "tab-b", 1_200, 500).unwrap());
    // Owner can renew
    assert!(store.acquire_lease("sync", "tab-a", 1_300, 500).unwrap());
    // Expired lease can be taken over
    assert!(store.acquire_lease("sync", "tab-b", 1_800, 500).unwrap());

    store.release_lease("sync", "tab-a").unwrap();
    assert!(!store.acquire_lease("sync", "tab-a", 1_900, 500).unwrap());
    store.release_lease("sync", "tab-b").unwrap();
    assert!(store.acquire_lease("sync", "tab-a", 1_900, 500).unwrap());
  }

  #[test]
  fn test_unavailable_store_fails_every_call() {
    let store = UnavailableStore::new("storage disabled");
    assert!(!store.is_available());
    assert!(matches!(
      store.get_all(Collection::Tags),
      Err(OfflineError::StorageUnavailable(_))
    ));
    assert!(matches!(
      store.put(Collection::Tags, &json!({"id": "1"})),
      Err(OfflineError::StorageUnavailable(_))
    ));
  }

  #[test]
  fn test_migration_preserves_pending_log() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("offline.db");

    // Build a version 1 database by hand
    {
      let conn = Connection::open(&path).unwrap();
      conn.execute_batch(schema::MIGRATIONS[0].1).unwrap();
      conn.pragma_update(None, "user_version", 1).unwrap();
      conn
        .execute(
          "INSERT INTO records (collection, record_key, data) VALUES ('offlineData', '1', ?1)",
          params![json!({"id": 1, "synced": false}).to_string()],
        )
        .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.schema_version().unwrap(), schema::latest_version());
    let pending = store.get_all(Collection::OfflineData).unwrap();
    assert_eq!(pending.len(), 1);
    assert!(store.acquire_lease("sync", "owner", 0, 10).unwrap());
  }

  #[test]
  fn test_reopen_keeps_records() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nested").join("offline.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.put(Collection::Tags, &json!({"id": "1", "name": "keep"})).unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.get(Collection::Tags, "1").unwrap().unwrap()["name"], "keep");
  }
}
