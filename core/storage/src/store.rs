//! Record store adapter trait definition.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use offsync_common::{Error, Result};

/// Payload field carrying the version the client observed at capture time.
pub const VERSION_FIELD: &str = "version";

/// An authoritative record as held by a record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Identifier within the owning table.
    pub record_id: String,
    /// Record fields, without the version.
    pub data: Value,
    /// Optimistic-concurrency version, incremented on every write.
    pub version: u64,
    /// Time of the last successful write.
    pub updated_at: DateTime<Utc>,
}

/// Per-table capability the reconciliation engine reads and writes through.
///
/// Every method receives the connection of a transaction the caller has
/// already opened; implementations must not commit or begin transactions of
/// their own, so the caller can make "detect + apply + mark" atomic.
pub trait RecordStore: Send + Sync {
    /// Table name this store is registered under.
    fn table_name(&self) -> &str;

    /// Create whatever backing schema the store needs.
    fn ensure_schema(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Look up a record.
    ///
    /// # Returns
    /// `None` when no record exists under `record_id`.
    fn get(&self, conn: &Connection, record_id: &str) -> Result<Option<StoredRecord>>;

    /// Create a record at version 1.
    ///
    /// # Errors
    /// - `AlreadyExists` if the identifier is taken
    fn insert(&self, conn: &Connection, record_id: &str, payload: &Value) -> Result<StoredRecord>;

    /// Replace a record's fields and advance its version.
    ///
    /// # Errors
    /// - `NotFound` if the record is absent
    fn update(&self, conn: &Connection, record_id: &str, payload: &Value) -> Result<StoredRecord>;

    /// Delete a record.
    ///
    /// # Errors
    /// - `NotFound` if the record is absent
    fn delete(&self, conn: &Connection, record_id: &str) -> Result<()>;
}

/// Read the client's version hint from a payload.
///
/// A missing payload or missing field counts as version 0.
///
/// # Errors
/// - `InvalidInput` if the field is present but not a non-negative integer
pub fn version_hint(payload: Option<&Value>) -> Result<u64> {
    match payload.and_then(|p| p.get(VERSION_FIELD)) {
        None | Some(Value::Null) => Ok(0),
        Some(v) => v.as_u64().ok_or_else(|| {
            Error::InvalidInput(format!(
                "Payload field '{}' must be a non-negative integer, got {}",
                VERSION_FIELD, v
            ))
        }),
    }
}

/// Strip the version hint, leaving only the fields to write.
///
/// # Errors
/// - `InvalidInput` if the payload is not a JSON object
pub fn record_fields(payload: &Value) -> Result<Value> {
    let Value::Object(map) = payload else {
        return Err(Error::InvalidInput("Payload must be a JSON object".to_string()));
    };
    let mut fields = map.clone();
    fields.remove(VERSION_FIELD);
    Ok(Value::Object(fields))
}
