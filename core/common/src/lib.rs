//! Common utilities and types shared across offsync crates.
//!
//! This crate provides the error type, identifier newtypes and timestamp
//! helpers used by the storage layer and the reconciliation engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{from_micros, now, to_micros, ConflictId, ItemId};
