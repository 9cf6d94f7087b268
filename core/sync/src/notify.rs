//! Best-effort conflict notification side channel.

use async_trait::async_trait;
use tracing::info;

use offsync_common::Result;

use crate::conflict::ConflictRecord;

/// Receiver of newly persisted conflicts (push notifications, webhooks).
///
/// Called after the conflict has been committed. Failures are logged by the
/// engine and never affect the queue item.
#[async_trait]
pub trait ConflictNotifier: Send + Sync {
    async fn conflict_detected(&self, conflict: &ConflictRecord) -> Result<()>;
}

/// Notifier that only writes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl ConflictNotifier for LogNotifier {
    async fn conflict_detected(&self, conflict: &ConflictRecord) -> Result<()> {
        info!(
            "Conflict {} on {}/{}: {}",
            conflict.id, conflict.table_name, conflict.record_id, conflict.reason
        );
        Ok(())
    }
}
