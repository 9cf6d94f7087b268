//! Durable conflict records awaiting a resolution decision.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use offsync_common::{from_micros, now, to_micros, ConflictId, Error, ItemId, Result};
use offsync_storage::StoredRecord;

use crate::detector::ConflictReason;
use crate::queue::{Operation, SyncQueueItem};

/// Resolution decision for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Overwrite the authoritative record with the client's data.
    ClientWins,
    /// Keep the authoritative record; discard the client's data.
    ServerWins,
    /// The caller fixed things out of band; only close the conflict.
    Manual,
}

impl Resolution {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::ClientWins => "client_wins",
            Resolution::ServerWins => "server_wins",
            Resolution::Manual => "manual",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "client_wins" | "client" => Ok(Resolution::ClientWins),
            "server_wins" | "server" => Ok(Resolution::ServerWins),
            "manual" => Ok(Resolution::Manual),
            other => Err(Error::InvalidInput(format!("Unknown resolution '{}'", other))),
        }
    }
}

impl ToSql for Resolution {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Resolution {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

/// A queue item whose replay was judged unsafe, with both sides' data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    /// Owning queue item (1:1).
    pub queue_item_id: ItemId,
    pub table_name: String,
    pub record_id: String,
    /// Operation the client tried to replay.
    pub operation: Operation,
    /// Why replay was refused.
    pub reason: ConflictReason,
    /// Payload as submitted by the client.
    pub client_data: Option<Value>,
    /// Authoritative record fields at detection time; `None` if absent.
    pub server_data: Option<Value>,
    /// Authoritative record version at detection time.
    pub server_version: Option<u64>,
    pub resolution: Option<Resolution>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    /// Snapshot both sides of a conflict detected for `item`.
    pub fn detected(
        item: &SyncQueueItem,
        current: Option<&StoredRecord>,
        reason: ConflictReason,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            queue_item_id: item.id,
            table_name: item.table_name.clone(),
            record_id: item.record_id.clone(),
            operation: item.operation,
            reason,
            client_data: item.payload.clone(),
            server_data: current.map(|record| record.data.clone()),
            server_version: current.map(|record| record.version),
            resolution: None,
            created_at: now(),
            resolved_at: None,
        }
    }

    /// Whether a resolution has been recorded.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

const CONFLICT_COLUMNS: &str = "c.id, c.queue_item_id, c.table_name, c.record_id, c.operation, \
                                c.reason, c.client_data, c.server_data, c.server_version, \
                                c.resolution, c.created_at, c.resolved_at";

/// Create the `sync_conflict` table.
pub(crate) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_conflict (
            id TEXT PRIMARY KEY,
            queue_item_id TEXT NOT NULL UNIQUE REFERENCES sync_queue(id),
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            reason TEXT NOT NULL,
            client_data TEXT,
            server_data TEXT,
            server_version INTEGER,
            resolution TEXT,
            created_at INTEGER NOT NULL,
            resolved_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_sync_conflict_unresolved
            ON sync_conflict(resolution, created_at);
        "#,
    )?;
    Ok(())
}

fn conversion_error(idx: usize, ty: Type, err: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    row.get::<_, Option<String>>(idx)?
        .map(|text| {
            serde_json::from_str(&text)
                .map_err(|e| conversion_error(idx, Type::Text, Error::Serialization(e.to_string())))
        })
        .transpose()
}

fn read_conflict(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    let reason = json_column(row, 5)?.ok_or_else(|| {
        conversion_error(5, Type::Null, Error::Serialization("Missing conflict reason".to_string()))
    })?;
    let created_at =
        from_micros(row.get(10)?).map_err(|e| conversion_error(10, Type::Integer, e))?;
    let resolved_at = row
        .get::<_, Option<i64>>(11)?
        .map(|micros| from_micros(micros).map_err(|e| conversion_error(11, Type::Integer, e)))
        .transpose()?;

    Ok(ConflictRecord {
        id: row.get(0)?,
        queue_item_id: row.get(1)?,
        table_name: row.get(2)?,
        record_id: row.get(3)?,
        operation: row.get(4)?,
        reason,
        client_data: json_column(row, 6)?,
        server_data: json_column(row, 7)?,
        server_version: row
            .get::<_, Option<i64>>(8)?
            .map(|v| u64::try_from(v).unwrap_or(0)),
        resolution: row.get(9)?,
        created_at,
        resolved_at,
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Persist a new conflict.
pub(crate) fn insert_conflict(conn: &Connection, conflict: &ConflictRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO sync_conflict (
            id, queue_item_id, table_name, record_id, operation, reason,
            client_data, server_data, server_version, resolution, created_at, resolved_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            conflict.id,
            conflict.queue_item_id,
            conflict.table_name,
            conflict.record_id,
            conflict.operation,
            to_json(&conflict.reason)?,
            conflict.client_data.as_ref().map(Value::to_string),
            conflict.server_data.as_ref().map(Value::to_string),
            conflict.server_version.map(|v| i64::try_from(v).unwrap_or(i64::MAX)),
            conflict.resolution,
            to_micros(conflict.created_at),
            conflict.resolved_at.map(to_micros),
        ],
    )?;
    Ok(())
}

/// Fetch a conflict by id.
pub(crate) fn get_conflict(conn: &Connection, id: ConflictId) -> Result<Option<ConflictRecord>> {
    let conflict = conn
        .query_row(
            &format!("SELECT {} FROM sync_conflict c WHERE c.id = ?1", CONFLICT_COLUMNS),
            [id],
            read_conflict,
        )
        .optional()?;
    Ok(conflict)
}

/// Fetch the conflict owned by a queue item.
pub(crate) fn conflict_for_item(conn: &Connection, item_id: ItemId) -> Result<Option<ConflictRecord>> {
    let conflict = conn
        .query_row(
            &format!(
                "SELECT {} FROM sync_conflict c WHERE c.queue_item_id = ?1",
                CONFLICT_COLUMNS
            ),
            [item_id],
            read_conflict,
        )
        .optional()?;
    Ok(conflict)
}

/// Unresolved conflicts whose queue item belongs to `owner_id`, oldest first.
pub(crate) fn list_unresolved(conn: &Connection, owner_id: &str) -> Result<Vec<ConflictRecord>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {} FROM sync_conflict c
        JOIN sync_queue q ON q.id = c.queue_item_id
        WHERE q.owner_id = ?1 AND c.resolution IS NULL
        ORDER BY c.created_at ASC, c.rowid ASC
        "#,
        CONFLICT_COLUMNS
    ))?;
    let conflicts = stmt
        .query_map([owner_id], read_conflict)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(conflicts)
}

/// Record a resolution, guarded so a conflict is resolved at most once.
///
/// # Errors
/// - `NotFound` if the conflict does not exist
/// - `AlreadyResolved` if a resolution was already recorded
pub(crate) fn mark_resolved(
    conn: &Connection,
    id: ConflictId,
    resolution: Resolution,
    at: DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        r#"
        UPDATE sync_conflict SET resolution = ?2, resolved_at = ?3
        WHERE id = ?1 AND resolution IS NULL
        "#,
        params![id, resolution, to_micros(at)],
    )?;
    if changed == 0 {
        return match get_conflict(conn, id)? {
            Some(_) => Err(Error::AlreadyResolved(id.to_string())),
            None => Err(Error::NotFound(format!("Conflict {}", id))),
        };
    }
    Ok(())
}
