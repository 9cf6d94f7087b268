//! SQLite-backed record store holding one JSON document per record.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::debug;

use offsync_common::{from_micros, now, to_micros, Error, Result};

use crate::store::{record_fields, RecordStore, StoredRecord};

/// Table names owned by the reconciliation engine itself.
pub const RESERVED_TABLES: &[&str] = &["sync_queue", "sync_conflict"];

/// Check that `name` can be used as a record table name.
///
/// # Errors
/// - Name is empty, not an identifier, or reserved
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !valid {
        return Err(Error::InvalidInput(format!(
            "Table name '{}' must be an identifier",
            name
        )));
    }
    if RESERVED_TABLES.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(Error::InvalidInput(format!("Table name '{}' is reserved", name)));
    }
    Ok(())
}

/// Record store for one table of JSON documents.
///
/// Every write is checked by deserializing the document into `T`, so a
/// payload that does not fit the table's record type is rejected before it
/// touches the database. Use `serde_json::Value` to accept any object.
pub struct DocumentTable<T = Value> {
    table: String,
    _record: PhantomData<fn() -> T>,
}

impl<T> DocumentTable<T> {
    /// Create a store for `table`.
    ///
    /// # Errors
    /// - Invalid or reserved table name
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            table,
            _record: PhantomData,
        })
    }
}

impl<T: DeserializeOwned> DocumentTable<T> {
    fn checked_fields(&self, payload: &Value) -> Result<Value> {
        let fields = record_fields(payload)?;
        serde_json::from_value::<T>(fields.clone()).map_err(|e| {
            Error::InvalidInput(format!("Payload does not match '{}' record: {}", self.table, e))
        })?;
        Ok(fields)
    }
}

impl<T> DocumentTable<T> {
    fn write_failed(&self, record_id: &str, err: rusqlite::Error) -> Error {
        Error::Adapter(format!("Write to {}/{} failed: {}", self.table, record_id, err))
    }

    fn not_found(&self, record_id: &str) -> Error {
        Error::NotFound(format!("Record '{}' not found in '{}'", record_id, self.table))
    }
}

/// Deleted records stay behind as tombstones (`data IS NULL`) so that a
/// record's version never goes backwards, even across delete and re-insert.
impl<T: DeserializeOwned> RecordStore for DocumentTable<T> {
    fn table_name(&self) -> &str {
        &self.table
    }

    fn ensure_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                record_id TEXT PRIMARY KEY,
                data TEXT,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
            self.table
        ))?;
        Ok(())
    }

    fn get(&self, conn: &Connection, record_id: &str) -> Result<Option<StoredRecord>> {
        let row = conn
            .query_row(
                &format!(
                    r#"SELECT data, version, updated_at FROM "{}" WHERE record_id = ?1 AND data IS NOT NULL"#,
                    self.table
                ),
                [record_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((data, version, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(StoredRecord {
            record_id: record_id.to_string(),
            data: serde_json::from_str(&data).map_err(|e| Error::Serialization(e.to_string()))?,
            version: u64::try_from(version).map_err(|_| {
                Error::Serialization(format!("Negative version stored for {}", record_id))
            })?,
            updated_at: from_micros(updated_at)?,
        }))
    }

    fn insert(&self, conn: &Connection, record_id: &str, payload: &Value) -> Result<StoredRecord> {
        let fields = self.checked_fields(payload)?;
        if self.get(conn, record_id)?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "Record '{}' already exists in '{}'",
                record_id, self.table
            )));
        }

        // A tombstone is revived one version past the deleted record.
        conn.execute(
            &format!(
                r#"
                INSERT INTO "{0}" (record_id, data, version, updated_at) VALUES (?1, ?2, 1, ?3)
                ON CONFLICT(record_id) DO UPDATE SET
                    data = excluded.data,
                    version = "{0}".version + 1,
                    updated_at = excluded.updated_at
                "#,
                self.table
            ),
            params![record_id, fields.to_string(), to_micros(now())],
        )
        .map_err(|e| self.write_failed(record_id, e))?;

        let record = self.get(conn, record_id)?.ok_or_else(|| {
            Error::Internal(format!("Record '{}' vanished after insert", record_id))
        })?;
        debug!("Inserted {}/{} at version {}", self.table, record_id, record.version);
        Ok(record)
    }

    fn update(&self, conn: &Connection, record_id: &str, payload: &Value) -> Result<StoredRecord> {
        let fields = self.checked_fields(payload)?;
        let changed = conn
            .execute(
                &format!(
                    r#"UPDATE "{}" SET data = ?1, version = version + 1, updated_at = ?2 WHERE record_id = ?3 AND data IS NOT NULL"#,
                    self.table
                ),
                params![fields.to_string(), to_micros(now()), record_id],
            )
            .map_err(|e| self.write_failed(record_id, e))?;
        if changed == 0 {
            return Err(self.not_found(record_id));
        }

        let record = self.get(conn, record_id)?.ok_or_else(|| {
            Error::Internal(format!("Record '{}' vanished after update", record_id))
        })?;
        debug!("Updated {}/{} to version {}", self.table, record_id, record.version);
        Ok(record)
    }

    fn delete(&self, conn: &Connection, record_id: &str) -> Result<()> {
        let changed = conn
            .execute(
                &format!(
                    r#"UPDATE "{}" SET data = NULL, version = version + 1, updated_at = ?1 WHERE record_id = ?2 AND data IS NOT NULL"#,
                    self.table
                ),
                params![to_micros(now()), record_id],
            )
            .map_err(|e| self.write_failed(record_id, e))?;
        if changed == 0 {
            return Err(self.not_found(record_id));
        }
        debug!("Deleted {}/{}", self.table, record_id);
        Ok(())
    }
}
