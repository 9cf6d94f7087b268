//! Queue item state machine.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use offsync_common::{Error, Result};

/// Lifecycle status of a sync queue item.
///
/// ```text
/// Pending -> Processing -> Completed | Failed | Conflicted
/// Processing -> Pending          (stale claim reclaimed)
/// Conflicted -> Completed        (conflict resolved)
/// Conflicted -> Pending          (re-armed for replay)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be replayed.
    Pending,
    /// Claimed by a batch pass.
    Processing,
    /// Replayed or resolved; nothing left to do.
    Completed,
    /// Replay failed permanently.
    Failed,
    /// Replay was unsafe; a conflict record awaits resolution.
    Conflicted,
}

impl ItemStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [ItemStatus; 5] = [
        ItemStatus::Pending,
        ItemStatus::Processing,
        ItemStatus::Completed,
        ItemStatus::Failed,
        ItemStatus::Conflicted,
    ];

    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Conflicted => "conflicted",
        }
    }

    /// Whether no further transition can ever happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }

    /// Whether the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (*self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Conflicted)
                | (Processing, Pending)
                | (Conflicted, Completed)
                | (Conflicted, Pending)
        )
    }

    /// Check a transition, returning the new status.
    ///
    /// # Errors
    /// - `InvalidTransition` if the move is not allowed
    pub fn transition(self, next: ItemStatus) -> Result<ItemStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown item status '{}'", s)))
    }
}

impl ToSql for ItemStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ItemStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}
