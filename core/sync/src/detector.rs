//! Conflict detection for queued mutations.
//!
//! The detector is a pure decision over the queue item and the current
//! authoritative record; it never touches storage.

use serde::{Deserialize, Serialize};
use std::fmt;

use offsync_storage::StoredRecord;

use crate::queue::{Operation, SyncQueueItem};

/// Why replaying an item is unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictReason {
    /// Insert targets an identifier that is already taken.
    RecordExists { server_version: u64 },
    /// Update targets a record that was deleted or never existed.
    RecordMissing,
    /// The server advanced past the version the client observed.
    StaleVersion { server_version: u64, client_version: u64 },
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::RecordExists { server_version } => {
                write!(f, "record already exists at version {}", server_version)
            }
            ConflictReason::RecordMissing => write!(f, "record does not exist"),
            ConflictReason::StaleVersion {
                server_version,
                client_version,
            } => write!(
                f,
                "server version {} is ahead of client version {}",
                server_version, client_version
            ),
        }
    }
}

/// Outcome of conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The mutation can be applied without losing data.
    Safe,
    /// The mutation must be parked as a conflict.
    Conflict(ConflictReason),
}

impl Verdict {
    /// Whether the verdict allows replay.
    pub fn is_safe(&self) -> bool {
        matches!(self, Verdict::Safe)
    }
}

/// Decide whether `item` can be replayed against `current`.
pub fn detect(item: &SyncQueueItem, current: Option<&StoredRecord>) -> Verdict {
    decide(
        item.operation,
        item.client_version(),
        current.map(|record| record.version),
    )
}

/// Decision rule over plain values.
///
/// - Insert conflicts iff a record exists.
/// - Update conflicts iff the record is missing or the server version is
///   strictly ahead of the client's.
/// - Delete of a missing record is safe (it is already gone); otherwise it
///   follows the update rule.
pub fn decide(operation: Operation, client_version: u64, server_version: Option<u64>) -> Verdict {
    match (operation, server_version) {
        (Operation::Insert, None) => Verdict::Safe,
        (Operation::Insert, Some(server_version)) => {
            Verdict::Conflict(ConflictReason::RecordExists { server_version })
        }
        (Operation::Update, None) => Verdict::Conflict(ConflictReason::RecordMissing),
        (Operation::Delete, None) => Verdict::Safe,
        (Operation::Update | Operation::Delete, Some(server_version)) => {
            if server_version > client_version {
                Verdict::Conflict(ConflictReason::StaleVersion {
                    server_version,
                    client_version,
                })
            } else {
                Verdict::Safe
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MutationIntent;
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(version: u64) -> StoredRecord {
        StoredRecord {
            record_id: "a-1".to_string(),
            data: json!({"name": "Bella"}),
            version,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_rule() {
        let item = MutationIntent::insert("u1", "animal", "a-1", json!({"name": "Bella"}))
            .into_item()
            .unwrap();

        assert_eq!(detect(&item, None), Verdict::Safe);
        assert_eq!(
            detect(&item, Some(&record(1))),
            Verdict::Conflict(ConflictReason::RecordExists { server_version: 1 })
        );
    }

    #[test]
    fn test_update_rule() {
        let item = MutationIntent::update("u1", "animal", "a-1", json!({"name": "B", "version": 3}))
            .into_item()
            .unwrap();

        assert!(detect(&item, Some(&record(3))).is_safe());
        assert!(detect(&item, Some(&record(2))).is_safe());
        assert_eq!(
            detect(&item, Some(&record(4))),
            Verdict::Conflict(ConflictReason::StaleVersion {
                server_version: 4,
                client_version: 3
            })
        );
        assert_eq!(
            detect(&item, None),
            Verdict::Conflict(ConflictReason::RecordMissing)
        );
    }

    #[test]
    fn test_missing_version_hint_is_zero() {
        let item = MutationIntent::update("u1", "animal", "a-1", json!({"name": "B"}))
            .into_item()
            .unwrap();
        assert!(!detect(&item, Some(&record(1))).is_safe());
    }

    #[test]
    fn test_delete_rule() {
        let item = MutationIntent::delete("u1", "animal", "a-1").into_item().unwrap();

        assert!(detect(&item, None).is_safe());
        // No payload means version 0, so any existing record is ahead.
        assert!(!detect(&item, Some(&record(1))).is_safe());
    }

    #[test]
    fn test_reason_display() {
        let reason = ConflictReason::StaleVersion {
            server_version: 3,
            client_version: 2,
        };
        assert_eq!(reason.to_string(), "server version 3 is ahead of client version 2");
    }

    proptest! {
        #[test]
        fn prop_versioned_ops_conflict_iff_server_ahead(
            client in 0u64..1_000,
            server in 0u64..1_000,
            is_delete in any::<bool>(),
        ) {
            let op = if is_delete { Operation::Delete } else { Operation::Update };
            let verdict = decide(op, client, Some(server));
            prop_assert_eq!(verdict.is_safe(), server <= client);
        }

        #[test]
        fn prop_insert_ignores_versions(client in any::<u64>(), server in proptest::option::of(any::<u64>())) {
            let verdict = decide(Operation::Insert, client, server);
            prop_assert_eq!(verdict.is_safe(), server.is_none());
        }
    }
}
