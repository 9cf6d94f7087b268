//! Offsync reconciliation engine
//!
//! Replays mutations that clients captured while offline against the
//! authoritative record tables:
//! - Durable FIFO queue of pending mutations
//! - Optimistic-concurrency conflict detection
//! - Per-item atomic apply-or-park
//! - Conflict store with client-wins, server-wins and manual resolution
//! - Stuck-item reclaim and batch scheduling

pub mod config;
pub mod conflict;
pub mod detector;
pub mod engine;
pub mod notify;
pub mod queue;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use config::EngineConfig;
pub use conflict::{ConflictRecord, Resolution};
pub use detector::{decide, detect, ConflictReason, Verdict};
pub use engine::{BatchReport, QueueStats, SyncEngine};
pub use notify::{ConflictNotifier, LogNotifier};
pub use queue::{MutationIntent, Operation, SyncQueueItem};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::ItemStatus;
