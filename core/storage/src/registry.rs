//! Table registry for resolving record stores by table name.

use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use offsync_common::{Error, Result};

use crate::document::DocumentTable;
use crate::store::RecordStore;

/// Mapping from table name to record store, fixed at configuration time.
///
/// Queue items carry a table name string; the engine resolves it here.
/// An unregistered name is a permanent failure, never retried.
pub struct TableRegistry {
    stores: HashMap<String, Arc<dyn RecordStore>>,
}

impl TableRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            stores: HashMap::new(),
        }
    }

    /// Register a record store under its own table name.
    ///
    /// # Errors
    /// - Returns error if the table name is already registered
    pub fn register(&mut self, store: Arc<dyn RecordStore>) -> Result<()> {
        let name = store.table_name().to_string();
        if self.stores.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Table '{}' is already registered",
                name
            )));
        }
        debug!("Registered record store for table '{}'", name);
        self.stores.insert(name, store);
        Ok(())
    }

    /// Register an untyped JSON document table for each name.
    ///
    /// # Errors
    /// - Invalid or duplicate table name
    pub fn with_document_tables<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for name in names {
            registry.register(Arc::new(DocumentTable::<serde_json::Value>::new(name)?))?;
        }
        Ok(registry)
    }

    /// Resolve the record store for a table.
    ///
    /// # Errors
    /// - `UnknownTable` if nothing is registered under `name`
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn RecordStore>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// Get the sorted list of registered table names.
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a table is registered.
    pub fn has_table(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    /// Create the backing schema of every registered store.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<()> {
        for store in self.stores.values() {
            store.ensure_schema(conn)?;
        }
        Ok(())
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document(name: &str) -> Arc<dyn RecordStore> {
        Arc::new(DocumentTable::<serde_json::Value>::new(name).unwrap())
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = TableRegistry::new();
        registry.register(document("animal")).unwrap();

        let store = registry.resolve("animal").unwrap();
        assert_eq!(store.table_name(), "animal");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = TableRegistry::new();
        registry.register(document("animal")).unwrap();

        let result = registry.register(document("animal"));
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = TableRegistry::new();
        let result = registry.resolve("kennel");
        assert!(matches!(result, Err(Error::UnknownTable(name)) if name == "kennel"));
    }

    #[test]
    fn test_tables_list() {
        let registry = TableRegistry::with_document_tables(["show", "animal"]).unwrap();
        assert_eq!(registry.tables(), vec!["animal".to_string(), "show".to_string()]);
        assert!(registry.has_table("show"));
        assert!(!registry.has_table("profile"));
    }

    #[test]
    fn test_ensure_schema_creates_tables() {
        let registry = TableRegistry::with_document_tables(["animal", "evaluation"]).unwrap();
        let conn = Connection::open_in_memory().unwrap();
        registry.ensure_schema(&conn).unwrap();

        let store = registry.resolve("evaluation").unwrap();
        store.insert(&conn, "e-1", &json!({"score": 91})).unwrap();
        assert_eq!(store.get(&conn, "e-1").unwrap().unwrap().version, 1);
    }
}
