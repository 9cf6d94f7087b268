//! Append-only sync queue of client mutation intents.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use offsync_common::{from_micros, now, to_micros, Error, ItemId, Result};
use offsync_storage::{version_hint, VERSION_FIELD};

use crate::state::ItemStatus;

/// Kind of mutation a client recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create a new record.
    Insert,
    /// Overwrite an existing record.
    Update,
    /// Remove a record.
    Delete,
}

impl Operation {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Whether the operation carries fields to write.
    pub fn requires_payload(&self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::InvalidInput(format!("Unknown operation '{}'", other))),
        }
    }
}

impl ToSql for Operation {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Operation {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

/// One durably recorded mutation intent awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Identifier assigned at enqueue time.
    pub id: ItemId,
    /// Originating client or user.
    pub owner_id: String,
    /// Table whose record store applies the mutation.
    pub table_name: String,
    /// Target record within the table.
    pub record_id: String,
    /// Mutation kind.
    pub operation: Operation,
    /// Fields to write plus the optional version hint; deletes carry only the hint.
    pub payload: Option<Value>,
    /// Current lifecycle status.
    pub status: ItemStatus,
    /// Client capture time; defines FIFO order.
    pub created_at: DateTime<Utc>,
    /// When the item was last claimed.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the item reached its current settled state.
    pub processed_at: Option<DateTime<Utc>>,
    /// Number of claims so far.
    pub attempts: u32,
    /// Error detail of the last failed or timed-out attempt.
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    /// Version the client observed when it made the change.
    pub fn client_version(&self) -> u64 {
        // Hints are validated at enqueue time.
        version_hint(self.payload.as_ref()).unwrap_or(0)
    }
}

/// A deferred client write, as reported to the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationIntent {
    pub owner_id: String,
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub payload: Option<Value>,
    /// Client capture time; the enqueue time is used when absent.
    pub captured_at: Option<DateTime<Utc>>,
}

impl MutationIntent {
    /// Create an intent for any operation.
    pub fn new(
        owner_id: impl Into<String>,
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        operation: Operation,
        payload: Option<Value>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            table_name: table_name.into(),
            record_id: record_id.into(),
            operation,
            payload,
            captured_at: None,
        }
    }

    /// Intent to create a record.
    pub fn insert(
        owner_id: impl Into<String>,
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(owner_id, table_name, record_id, Operation::Insert, Some(payload))
    }

    /// Intent to overwrite a record; `payload` should carry the observed `version`.
    pub fn update(
        owner_id: impl Into<String>,
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(owner_id, table_name, record_id, Operation::Update, Some(payload))
    }

    /// Intent to remove a record; add the observed version with [`Self::with_version`].
    pub fn delete(
        owner_id: impl Into<String>,
        table_name: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self::new(owner_id, table_name, record_id, Operation::Delete, None)
    }

    /// Record the version the client observed, creating a payload if needed.
    pub fn with_version(mut self, version: u64) -> Self {
        let mut payload = match self.payload.take() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        payload.insert(VERSION_FIELD.to_string(), Value::from(version));
        self.payload = Some(Value::Object(payload));
        self
    }

    /// Set the client capture time.
    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }

    /// Validate the intent and turn it into a pending queue item.
    ///
    /// # Errors
    /// - Empty owner, table or record identifier
    /// - Missing payload for inserts and updates
    /// - Non-object payload
    /// - Malformed version hint
    pub fn into_item(self) -> Result<SyncQueueItem> {
        for (field, value) in [
            ("owner_id", &self.owner_id),
            ("table_name", &self.table_name),
            ("record_id", &self.record_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidInput(format!("{} cannot be empty", field)));
            }
        }

        let payload = match self.payload {
            Some(Value::Null) | None if !self.operation.requires_payload() => None,
            Some(payload @ Value::Object(_)) => {
                version_hint(Some(&payload))?;
                Some(payload)
            }
            Some(_) => {
                return Err(Error::InvalidInput(
                    "Payload must be a JSON object".to_string(),
                ))
            }
            None => {
                return Err(Error::InvalidInput(format!(
                    "{} requires a payload",
                    self.operation
                )))
            }
        };

        let created_at = match self.captured_at {
            Some(at) => from_micros(to_micros(at))?,
            None => now(),
        };

        Ok(SyncQueueItem {
            id: ItemId::new(),
            owner_id: self.owner_id,
            table_name: self.table_name,
            record_id: self.record_id,
            operation: self.operation,
            payload,
            status: ItemStatus::Pending,
            created_at,
            claimed_at: None,
            processed_at: None,
            attempts: 0,
            last_error: None,
        })
    }
}

const ITEM_COLUMNS: &str = "id, owner_id, table_name, record_id, operation, payload, status, \
                            created_at, claimed_at, processed_at, attempts, last_error";

/// Create the `sync_queue` table.
pub(crate) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            claimed_at INTEGER,
            processed_at INTEGER,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status_created
            ON sync_queue(status, created_at);
        "#,
    )?;
    Ok(())
}

fn conversion_error(idx: usize, ty: Type, err: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_micros(row.get(idx)?).map_err(|e| conversion_error(idx, Type::Integer, e))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|micros| from_micros(micros).map_err(|e| conversion_error(idx, Type::Integer, e)))
        .transpose()
}

fn read_item(row: &Row<'_>) -> rusqlite::Result<SyncQueueItem> {
    let payload = row
        .get::<_, Option<String>>(5)?
        .map(|text| {
            serde_json::from_str(&text)
                .map_err(|e| conversion_error(5, Type::Text, Error::Serialization(e.to_string())))
        })
        .transpose()?;

    Ok(SyncQueueItem {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        table_name: row.get(2)?,
        record_id: row.get(3)?,
        operation: row.get(4)?,
        payload,
        status: row.get(6)?,
        created_at: timestamp(row, 7)?,
        claimed_at: optional_timestamp(row, 8)?,
        processed_at: optional_timestamp(row, 9)?,
        attempts: row.get(10)?,
        last_error: row.get(11)?,
    })
}

/// Append an item.
pub(crate) fn insert_item(conn: &Connection, item: &SyncQueueItem) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO sync_queue ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            ITEM_COLUMNS
        ),
        params![
            item.id,
            item.owner_id,
            item.table_name,
            item.record_id,
            item.operation,
            item.payload.as_ref().map(Value::to_string),
            item.status,
            to_micros(item.created_at),
            item.claimed_at.map(to_micros),
            item.processed_at.map(to_micros),
            item.attempts,
            item.last_error,
        ],
    )?;
    Ok(())
}

/// Fetch an item by id.
pub(crate) fn get_item(conn: &Connection, id: ItemId) -> Result<Option<SyncQueueItem>> {
    let item = conn
        .query_row(
            &format!("SELECT {} FROM sync_queue WHERE id = ?1", ITEM_COLUMNS),
            [id],
            read_item,
        )
        .optional()?;
    Ok(item)
}

/// Ids of the oldest pending items, oldest first.
pub(crate) fn pending_ids(conn: &Connection, limit: usize) -> Result<Vec<ItemId>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(
        r#"
        SELECT id FROM sync_queue
        WHERE status = 'pending'
        ORDER BY created_at ASC, rowid ASC
        LIMIT ?1
        "#,
    )?;
    let ids = stmt
        .query_map([limit], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<ItemId>>>()?;
    Ok(ids)
}

/// List items, optionally filtered by status, oldest first.
pub(crate) fn list_items(
    conn: &Connection,
    status: Option<ItemStatus>,
    limit: usize,
) -> Result<Vec<SyncQueueItem>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {} FROM sync_queue
        WHERE ?1 IS NULL OR status = ?1
        ORDER BY created_at ASC, rowid ASC
        LIMIT ?2
        "#,
        ITEM_COLUMNS
    ))?;
    let items = stmt
        .query_map(params![status, limit], read_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

/// Claim a pending item: compare-and-swap `Pending -> Processing`.
///
/// # Returns
/// `false` when the item was no longer pending.
pub(crate) fn claim(conn: &Connection, id: ItemId, at: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        r#"
        UPDATE sync_queue
        SET status = 'processing', claimed_at = ?2, attempts = attempts + 1, last_error = NULL
        WHERE id = ?1 AND status = 'pending'
        "#,
        params![id, to_micros(at)],
    )?;
    Ok(changed == 1)
}

/// Park a pending item in `Processing` after its unit of work ran out of time.
///
/// The item stays there until [`reclaim_stale`] re-arms it.
pub(crate) fn park(conn: &Connection, id: ItemId, at: DateTime<Utc>, reason: &str) -> Result<bool> {
    let changed = conn.execute(
        r#"
        UPDATE sync_queue
        SET status = 'processing', claimed_at = ?2, attempts = attempts + 1, last_error = ?3
        WHERE id = ?1 AND status = 'pending'
        "#,
        params![id, to_micros(at), reason],
    )?;
    Ok(changed == 1)
}

/// Move an item from `from` to `to`, guarded on its current status.
///
/// # Errors
/// - `InvalidTransition` if the state machine forbids the move, or the item
///   is not currently in `from`
/// - `NotFound` if the item does not exist
pub(crate) fn transition(
    conn: &Connection,
    id: ItemId,
    from: ItemStatus,
    to: ItemStatus,
    processed_at: Option<DateTime<Utc>>,
    error: Option<&str>,
) -> Result<()> {
    from.transition(to)?;

    let changed = conn.execute(
        r#"
        UPDATE sync_queue
        SET status = ?3, processed_at = COALESCE(?4, processed_at), last_error = ?5
        WHERE id = ?1 AND status = ?2
        "#,
        params![id, from, to, processed_at.map(to_micros), error],
    )?;

    if changed == 0 {
        let actual = get_item(conn, id)?
            .ok_or_else(|| Error::NotFound(format!("Queue item {}", id)))?
            .status;
        return Err(Error::InvalidTransition {
            from: actual.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

/// Re-arm `Processing` items claimed before `cutoff`.
///
/// # Returns
/// Number of items moved back to `Pending`.
pub(crate) fn reclaim_stale(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let changed = conn.execute(
        r#"
        UPDATE sync_queue
        SET status = 'pending', claimed_at = NULL
        WHERE status = 'processing' AND claimed_at < ?1
        "#,
        [to_micros(cutoff)],
    )?;
    Ok(changed)
}

/// Count items by status.
pub(crate) fn count_by_status(conn: &Connection) -> Result<HashMap<ItemStatus, usize>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, ItemStatus>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = HashMap::new();
    for row in rows {
        let (status, count) = row?;
        counts.insert(status, usize::try_from(count).unwrap_or(0));
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn enqueue(conn: &Connection, intent: MutationIntent) -> SyncQueueItem {
        let item = intent.into_item().unwrap();
        insert_item(conn, &item).unwrap();
        item
    }

    #[test]
    fn test_intent_validation() {
        let item = MutationIntent::update("u1", "animal", "a-1", json!({"name": "Bella", "version": 3}))
            .into_item()
            .unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.client_version(), 3);

        assert!(MutationIntent::insert("", "animal", "a-1", json!({}))
            .into_item()
            .is_err());
        assert!(MutationIntent::insert("u1", "animal", "a-1", json!([1]))
            .into_item()
            .is_err());
        assert!(MutationIntent::new("u1", "animal", "a-1", Operation::Update, None)
            .into_item()
            .is_err());
        assert!(MutationIntent::update("u1", "animal", "a-1", json!({"version": "two"}))
            .into_item()
            .is_err());
    }

    #[test]
    fn test_delete_version_hint() {
        let item = MutationIntent::delete("u1", "animal", "a-1")
            .into_item()
            .unwrap();
        assert!(item.payload.is_none());
        assert_eq!(item.client_version(), 0);

        let item = MutationIntent::delete("u1", "animal", "a-1")
            .with_version(4)
            .into_item()
            .unwrap();
        assert_eq!(item.payload, Some(json!({"version": 4})));
        assert_eq!(item.client_version(), 4);

        let mut intent = MutationIntent::delete("u1", "animal", "a-1");
        intent.payload = Some(json!("gone"));
        assert!(intent.into_item().is_err());
    }

    #[test]
    fn test_with_version_keeps_fields() {
        let intent = MutationIntent::update("u1", "animal", "a-1", json!({"name": "Bella"}))
            .with_version(2);
        assert_eq!(intent.payload, Some(json!({"name": "Bella", "version": 2})));
    }

    #[test]
    fn test_insert_and_get() {
        let conn = setup();
        let item = enqueue(
            &conn,
            MutationIntent::insert("u1", "animal", "a-1", json!({"name": "Bella"})),
        );

        let fetched = get_item(&conn, item.id).unwrap().unwrap();
        assert_eq!(fetched, item);
        assert!(get_item(&conn, ItemId::new()).unwrap().is_none());
    }

    #[test]
    fn test_pending_ids_fifo() {
        let conn = setup();
        let base = now();
        let newest = enqueue(
            &conn,
            MutationIntent::delete("u1", "animal", "a-3").captured_at(base + Duration::seconds(2)),
        );
        let oldest = enqueue(
            &conn,
            MutationIntent::delete("u1", "animal", "a-1").captured_at(base),
        );
        let middle = enqueue(
            &conn,
            MutationIntent::delete("u1", "animal", "a-2").captured_at(base + Duration::seconds(1)),
        );

        assert_eq!(pending_ids(&conn, 2).unwrap(), vec![oldest.id, middle.id]);
        assert_eq!(
            pending_ids(&conn, 10).unwrap(),
            vec![oldest.id, middle.id, newest.id]
        );
    }

    #[test]
    fn test_claim_is_compare_and_swap() {
        let conn = setup();
        let item = enqueue(&conn, MutationIntent::delete("u1", "animal", "a-1"));

        assert!(claim(&conn, item.id, now()).unwrap());
        assert!(!claim(&conn, item.id, now()).unwrap());

        let claimed = get_item(&conn, item.id).unwrap().unwrap();
        assert_eq!(claimed.status, ItemStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.claimed_at.is_some());
        assert!(pending_ids(&conn, 10).unwrap().is_empty());
    }

    #[test]
    fn test_transition_guards() {
        let conn = setup();
        let item = enqueue(&conn, MutationIntent::delete("u1", "animal", "a-1"));

        // Not claimed yet
        let err = transition(
            &conn,
            item.id,
            ItemStatus::Processing,
            ItemStatus::Completed,
            Some(now()),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { ref from, .. } if from == "pending"));

        claim(&conn, item.id, now()).unwrap();
        transition(
            &conn,
            item.id,
            ItemStatus::Processing,
            ItemStatus::Failed,
            Some(now()),
            Some("boom"),
        )
        .unwrap();

        let failed = get_item(&conn, item.id).unwrap().unwrap();
        assert_eq!(failed.status, ItemStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        assert!(failed.processed_at.is_some());

        // Failed is terminal
        assert!(transition(&conn, item.id, ItemStatus::Failed, ItemStatus::Pending, None, None).is_err());
        assert!(matches!(
            transition(&conn, ItemId::new(), ItemStatus::Processing, ItemStatus::Failed, None, None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_park_and_reclaim() {
        let conn = setup();
        let item = enqueue(&conn, MutationIntent::delete("u1", "animal", "a-1"));
        let parked_at = now() - Duration::minutes(10);

        assert!(park(&conn, item.id, parked_at, "timed out").unwrap());
        let parked = get_item(&conn, item.id).unwrap().unwrap();
        assert_eq!(parked.status, ItemStatus::Processing);
        assert_eq!(parked.last_error.as_deref(), Some("timed out"));

        // Claimed after the cutoff: untouched
        assert_eq!(reclaim_stale(&conn, parked_at - Duration::minutes(1)).unwrap(), 0);
        assert_eq!(reclaim_stale(&conn, now()).unwrap(), 1);

        let reclaimed = get_item(&conn, item.id).unwrap().unwrap();
        assert_eq!(reclaimed.status, ItemStatus::Pending);
        assert!(reclaimed.claimed_at.is_none());
    }

    #[test]
    fn test_count_and_list() {
        let conn = setup();
        let a = enqueue(&conn, MutationIntent::delete("u1", "animal", "a-1"));
        enqueue(&conn, MutationIntent::delete("u1", "animal", "a-2"));
        claim(&conn, a.id, now()).unwrap();

        let counts = count_by_status(&conn).unwrap();
        assert_eq!(counts.get(&ItemStatus::Pending), Some(&1));
        assert_eq!(counts.get(&ItemStatus::Processing), Some(&1));

        assert_eq!(list_items(&conn, None, 10).unwrap().len(), 2);
        let processing = list_items(&conn, Some(ItemStatus::Processing), 10).unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, a.id);
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!("Insert".parse::<Operation>().unwrap(), Operation::Insert);
        assert_eq!("delete".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("upsert".parse::<Operation>().is_err());
    }
}
