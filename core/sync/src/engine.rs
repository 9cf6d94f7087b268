//! Reconciliation engine: batch replay of queued mutations.

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use offsync_common::{now, ConflictId, Error, ItemId, Result};
use offsync_storage::{Database, RecordStore, StoredRecord, TableRegistry};

use crate::config::EngineConfig;
use crate::conflict::{self, ConflictRecord, Resolution};
use crate::detector::{detect, Verdict};
use crate::notify::ConflictNotifier;
use crate::queue::{self, MutationIntent, Operation, SyncQueueItem};
use crate::scheduler::SyncRequest;
use crate::state::ItemStatus;

/// Extra time the async side waits past an item's deadline, so the unit of
/// work's own verdict (committed, or rolled back and parked) is what gets
/// reported.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

fn outer_timeout(item_timeout: Duration) -> Duration {
    item_timeout + DEADLINE_GRACE
}

/// Aggregate result of one batch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Items replayed and completed.
    pub applied: usize,
    /// Items parked as conflicts.
    pub conflicted: usize,
    /// Items that failed, or whose unit of work could not run.
    pub failed: usize,
    /// Items claimed by someone else first.
    pub skipped: usize,
    /// Items whose unit of work ran out of time.
    pub timed_out: usize,
    /// Stuck items re-armed before the batch started.
    pub reclaimed: usize,
    /// Wall-clock time of the pass.
    pub duration: Duration,
}

impl BatchReport {
    /// Number of items that reached a settled status in this pass.
    pub fn settled(&self) -> usize {
        self.applied + self.conflicted + self.failed
    }

    fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Applied => self.applied += 1,
            ItemOutcome::Conflicted(_) => self.conflicted += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::TimedOut => self.timed_out += 1,
        }
    }
}

/// Queue item counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflicted: usize,
}

/// Result of one item's unit of work.
#[derive(Debug)]
enum ItemOutcome {
    Applied,
    Conflicted(ConflictRecord),
    Failed,
    Skipped,
    TimedOut,
}

/// Reconciliation engine.
///
/// Construct once at startup and share by cloning; clones use the same
/// database handle and table registry. The engine keeps no state of its own
/// between batches.
#[derive(Clone)]
pub struct SyncEngine {
    db: Database,
    registry: Arc<TableRegistry>,
    notifier: Option<Arc<dyn ConflictNotifier>>,
    config: EngineConfig,
}

impl SyncEngine {
    /// Create a new engine, creating the queue, conflict and record tables.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Schema creation failure
    pub async fn new(db: Database, registry: TableRegistry, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(registry);

        let tables = Arc::clone(&registry);
        db.run(move |conn| {
            let tx = conn.transaction()?;
            queue::ensure_schema(&tx)?;
            conflict::ensure_schema(&tx)?;
            tables.ensure_schema(&tx)?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        info!(
            "Sync engine ready with tables [{}]",
            registry.tables().join(", ")
        );

        Ok(Self {
            db,
            registry,
            notifier: None,
            config,
        })
    }

    /// Attach a conflict notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn ConflictNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the table registry.
    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// Get the database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Record a deferred client mutation.
    ///
    /// The table name is not checked here; items for unregistered tables fail
    /// when processed.
    pub async fn enqueue(&self, intent: MutationIntent) -> Result<SyncQueueItem> {
        let item = intent.into_item()?;
        let stored = item.clone();
        self.db
            .run(move |conn| queue::insert_item(conn, &stored))
            .await?;

        debug!(
            "Enqueued {} {} {}/{} for {}",
            item.id, item.operation, item.table_name, item.record_id, item.owner_id
        );
        Ok(item)
    }

    /// Replay up to `batch_size` pending items, oldest first.
    ///
    /// Each item runs in its own transaction; one item's failure never rolls
    /// back another. Stuck claims older than the configured threshold are
    /// re-armed first.
    ///
    /// # Errors
    /// Only infrastructure failures (reclaim or batch read).
    pub async fn process_batch(&self, batch_size: usize) -> Result<BatchReport> {
        let start = Instant::now();
        let mut report = BatchReport {
            reclaimed: self.reclaim_stale().await?,
            ..BatchReport::default()
        };

        let ids = self
            .db
            .run(move |conn| queue::pending_ids(conn, batch_size))
            .await?;

        info!("Starting batch of {} pending items", ids.len());

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("Worker pool closed: {}", e)))?;
            let engine = self.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = engine.run_item(id).await;
                drop(permit);
                outcome
            }));
        }

        for task in futures::future::join_all(tasks).await {
            match task {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!("Worker task panicked: {}", e);
                    report.failed += 1;
                }
            }
        }

        report.duration = start.elapsed();
        info!(
            "Batch completed in {:?}: {} applied, {} conflicted, {} failed, {} skipped, {} timed out",
            report.duration,
            report.applied,
            report.conflicted,
            report.failed,
            report.skipped,
            report.timed_out
        );
        Ok(report)
    }

    /// Run one item's unit of work under the per-item deadline.
    async fn run_item(&self, id: ItemId) -> ItemOutcome {
        let timeout = self.config.item_timeout();
        let deadline = Instant::now() + timeout;
        let registry = Arc::clone(&self.registry);
        let work = self
            .db
            .run(move |conn| process_item(conn, &registry, id, deadline));

        let outcome = match tokio::time::timeout(outer_timeout(timeout), work).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                // Rolled back: the item is still pending.
                error!("Unit of work for item {} failed: {}", id, e);
                ItemOutcome::Failed
            }
            Err(_) => {
                // Still running on its blocking thread; it rolls back and parks itself.
                warn!("Item {} exceeded {:?}; left for reclaim", id, timeout);
                ItemOutcome::TimedOut
            }
        };

        if let ItemOutcome::Conflicted(conflict) = &outcome {
            self.notify(conflict).await;
        }
        outcome
    }

    async fn notify(&self, conflict: &ConflictRecord) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(e) = notifier.conflict_detected(conflict).await {
            warn!("Conflict notification for {} failed: {}", conflict.id, e);
        }
    }

    /// Re-arm `Processing` items claimed longer ago than the configured threshold.
    pub async fn reclaim_stale(&self) -> Result<usize> {
        self.reclaim_older_than(self.config.stale_after()).await
    }

    /// Re-arm `Processing` items claimed longer ago than `max_age`.
    pub async fn reclaim_older_than(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| Error::InvalidInput(format!("Reclaim age out of range: {}", e)))?;
        let cutoff = now() - max_age;

        let reclaimed = self
            .db
            .run(move |conn| queue::reclaim_stale(conn, cutoff))
            .await?;
        if reclaimed > 0 {
            info!("Reclaimed {} stuck items claimed before {}", reclaimed, cutoff);
        }
        Ok(reclaimed)
    }

    /// Unresolved conflicts belonging to `owner_id`.
    pub async fn list_conflicts(&self, owner_id: &str) -> Result<Vec<ConflictRecord>> {
        let owner_id = owner_id.to_string();
        self.db
            .run(move |conn| conflict::list_unresolved(conn, &owner_id))
            .await
    }

    /// Fetch a conflict.
    ///
    /// # Errors
    /// - `NotFound` if no such conflict exists
    pub async fn get_conflict(&self, id: ConflictId) -> Result<ConflictRecord> {
        self.db
            .run(move |conn| conflict::get_conflict(conn, id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("Conflict {}", id)))
    }

    /// Conflict raised for a queue item, if any.
    pub async fn conflict_for_item(&self, item_id: ItemId) -> Result<Option<ConflictRecord>> {
        self.db
            .run(move |conn| conflict::conflict_for_item(conn, item_id))
            .await
    }

    /// Fetch a queue item.
    ///
    /// # Errors
    /// - `NotFound` if no such item exists
    pub async fn get_item(&self, id: ItemId) -> Result<SyncQueueItem> {
        self.db
            .run(move |conn| queue::get_item(conn, id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("Queue item {}", id)))
    }

    /// List queue items, optionally filtered by status, oldest first.
    pub async fn list_items(
        &self,
        status: Option<ItemStatus>,
        limit: usize,
    ) -> Result<Vec<SyncQueueItem>> {
        self.db
            .run(move |conn| queue::list_items(conn, status, limit))
            .await
    }

    /// Count queue items by status.
    pub async fn stats(&self) -> Result<QueueStats> {
        let counts = self
            .db
            .run(|conn| queue::count_by_status(conn))
            .await?;
        let count = |status| counts.get(&status).copied().unwrap_or(0);
        Ok(QueueStats {
            pending: count(ItemStatus::Pending),
            processing: count(ItemStatus::Processing),
            completed: count(ItemStatus::Completed),
            failed: count(ItemStatus::Failed),
            conflicted: count(ItemStatus::Conflicted),
        })
    }

    /// Close a conflict and settle its queue item as `Completed`.
    ///
    /// `ClientWins` writes the client's data straight to the record store,
    /// bypassing the detector. `ServerWins` and `Manual` write nothing.
    ///
    /// # Errors
    /// - `NotFound` if the conflict does not exist
    /// - `AlreadyResolved` if it was resolved before
    /// - `UnknownTable` or adapter errors while applying `ClientWins`
    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution: Resolution,
    ) -> Result<ConflictRecord> {
        let registry = Arc::clone(&self.registry);
        let resolved = self
            .db
            .run(move |conn| resolve_in_transaction(conn, &registry, id, resolution))
            .await?;

        info!(
            "Resolved conflict {} on {}/{} as {}",
            id, resolved.table_name, resolved.record_id, resolution
        );
        Ok(resolved)
    }

    /// Handle a scheduler request.
    pub async fn process_request(&self, request: SyncRequest) -> Result<BatchReport> {
        match request {
            SyncRequest::Batch(size) => {
                self.process_batch(size.unwrap_or(self.config.batch_size))
                    .await
            }
            SyncRequest::Reclaim => Ok(BatchReport {
                reclaimed: self.reclaim_stale().await?,
                ..BatchReport::default()
            }),
            SyncRequest::Shutdown => Ok(BatchReport::default()),
        }
    }
}

/// One item's unit of work: claim, detect, apply or park, settle.
fn process_item(
    conn: &mut Connection,
    registry: &TableRegistry,
    id: ItemId,
    deadline: Instant,
) -> Result<ItemOutcome> {
    if Instant::now() >= deadline {
        return Ok(ItemOutcome::TimedOut);
    }

    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(item) = queue::get_item(&tx, id)? else {
        return Ok(ItemOutcome::Skipped);
    };
    if item.status != ItemStatus::Pending || !queue::claim(&tx, id, now())? {
        debug!("Item {} is {}; skipping", id, item.status);
        return Ok(ItemOutcome::Skipped);
    }

    let outcome = replay(&mut tx, registry, &item)?;

    if Instant::now() >= deadline {
        tx.rollback()?;
        let reason = Error::Timeout(format!("item {} ran past its deadline", id));
        queue::park(conn, id, now(), &reason.to_string())?;
        warn!("Item {} ran past its deadline; parked for reclaim", id);
        return Ok(ItemOutcome::TimedOut);
    }

    tx.commit()?;
    Ok(outcome)
}

/// Detect and apply a claimed item inside the caller's transaction.
fn replay(
    tx: &mut rusqlite::Transaction<'_>,
    registry: &TableRegistry,
    item: &SyncQueueItem,
) -> Result<ItemOutcome> {
    let store = match registry.resolve(&item.table_name) {
        Ok(store) => store,
        Err(e) => return fail(tx, item, &e),
    };

    let current = match store.get(tx, &item.record_id) {
        Ok(current) => current,
        Err(e) => return fail(tx, item, &e),
    };

    match detect(item, current.as_ref()) {
        Verdict::Safe => {
            let savepoint = tx.savepoint()?;
            match apply(&savepoint, store.as_ref(), item, current.as_ref()) {
                Ok(()) => savepoint.commit()?,
                Err(e) => {
                    // Dropping the savepoint rolls back any partial write.
                    drop(savepoint);
                    return fail(tx, item, &e);
                }
            }

            queue::transition(
                tx,
                item.id,
                ItemStatus::Processing,
                ItemStatus::Completed,
                Some(now()),
                None,
            )?;
            debug!(
                "Applied {} {} {}/{}",
                item.id, item.operation, item.table_name, item.record_id
            );
            Ok(ItemOutcome::Applied)
        }
        Verdict::Conflict(reason) => {
            let record = ConflictRecord::detected(item, current.as_ref(), reason);
            conflict::insert_conflict(tx, &record)?;
            queue::transition(
                tx,
                item.id,
                ItemStatus::Processing,
                ItemStatus::Conflicted,
                Some(now()),
                None,
            )?;
            info!(
                "Conflict on {}/{} for item {}: {}",
                item.table_name, item.record_id, item.id, reason
            );
            Ok(ItemOutcome::Conflicted(record))
        }
    }
}

fn fail(conn: &Connection, item: &SyncQueueItem, err: &Error) -> Result<ItemOutcome> {
    let detail = err.to_string();
    queue::transition(
        conn,
        item.id,
        ItemStatus::Processing,
        ItemStatus::Failed,
        Some(now()),
        Some(&detail),
    )?;
    warn!(
        "Item {} ({} {}/{}) failed: {}",
        item.id, item.operation, item.table_name, item.record_id, detail
    );
    Ok(ItemOutcome::Failed)
}

fn required_payload(item: &SyncQueueItem) -> Result<&serde_json::Value> {
    item.payload
        .as_ref()
        .ok_or_else(|| Error::InvalidInput(format!("{} without payload", item.operation)))
}

/// Apply a safe item through its record store.
fn apply(
    conn: &Connection,
    store: &dyn RecordStore,
    item: &SyncQueueItem,
    current: Option<&StoredRecord>,
) -> Result<()> {
    match item.operation {
        Operation::Insert => {
            store.insert(conn, &item.record_id, required_payload(item)?)?;
        }
        Operation::Update => {
            store.update(conn, &item.record_id, required_payload(item)?)?;
        }
        Operation::Delete => {
            if current.is_none() {
                debug!("{}/{} already absent", item.table_name, item.record_id);
                return Ok(());
            }
            match store.delete(conn, &item.record_id) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

fn resolve_in_transaction(
    conn: &mut Connection,
    registry: &TableRegistry,
    id: ConflictId,
    resolution: Resolution,
) -> Result<ConflictRecord> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut record = conflict::get_conflict(&tx, id)?
        .ok_or_else(|| Error::NotFound(format!("Conflict {}", id)))?;
    if let Some(previous) = record.resolution {
        return Err(Error::AlreadyResolved(format!("{} ({})", id, previous)));
    }

    if resolution == Resolution::ClientWins {
        let store = registry.resolve(&record.table_name)?;
        overwrite(&tx, store.as_ref(), &record)?;
    }

    let resolved_at = now();
    conflict::mark_resolved(&tx, id, resolution, resolved_at)?;
    queue::transition(
        &tx,
        record.queue_item_id,
        ItemStatus::Conflicted,
        ItemStatus::Completed,
        Some(resolved_at),
        None,
    )?;
    tx.commit()?;

    record.resolution = Some(resolution);
    record.resolved_at = Some(resolved_at);
    Ok(record)
}

/// Force the client's side of a conflict onto the record store.
fn overwrite(conn: &Connection, store: &dyn RecordStore, record: &ConflictRecord) -> Result<()> {
    let exists = store.get(conn, &record.record_id)?.is_some();
    match (record.operation, &record.client_data) {
        (Operation::Delete, _) => {
            if exists {
                store.delete(conn, &record.record_id)?;
            }
        }
        (_, Some(data)) => {
            if exists {
                store.update(conn, &record.record_id, data)?;
            } else {
                store.insert(conn, &record.record_id, data)?;
            }
        }
        (operation, None) => {
            return Err(Error::InvalidInput(format!(
                "Conflict {} has no client data for {}",
                record.id, operation
            )));
        }
    }
    Ok(())
}
