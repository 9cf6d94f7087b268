//! Record store abstraction for offsync.
//!
//! This crate provides the narrow per-table interface the reconciliation
//! engine reads and writes authoritative records through, a registry that
//! resolves stores by table name, and a SQLite document store.
//!
//! # Design Principles
//! - Caller-owned transactions: stores run inside the engine's unit of work
//! - Adapter-owned versions: every successful write advances `version`
//! - Static dispatch targets: tables are registered once at startup

pub mod database;
pub mod document;
pub mod registry;
pub mod store;

pub use database::Database;
pub use document::{validate_table_name, DocumentTable, RESERVED_TABLES};
pub use registry::TableRegistry;
pub use store::{record_fields, version_hint, RecordStore, StoredRecord, VERSION_FIELD};
