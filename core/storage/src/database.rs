//! Shared SQLite connection handle.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use offsync_common::{Error, Result};

/// Handle to the authoritative SQLite database.
///
/// The queue, the conflict store and every registered record table live in
/// the same database, so one SQLite transaction spans a whole unit of work.
/// Cloning the handle shares the underlying connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file.
    ///
    /// # Errors
    /// - Database file cannot be opened
    /// - Pragmas cannot be applied
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        info!("Opened database at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        debug!("Opened in-memory database");
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection on the current thread.
    ///
    /// A panic in an earlier caller poisons the lock but leaves the
    /// connection usable: its open transaction was rolled back on unwind.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering database connection after a panicked unit of work");
            self.conn.clear_poison();
            poisoned.into_inner()
        });
        f(&mut conn)
    }

    /// Run `f` with exclusive access to the connection on a blocking thread.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| Error::Internal(format!("Database task failed: {}", e)))?
    }
}
