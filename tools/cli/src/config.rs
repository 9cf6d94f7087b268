//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use offsync_storage::{Database, TableRegistry};
use offsync_sync::{EngineConfig, LogNotifier, SyncEngine};

/// Tables registered when the config file names none.
pub const DEFAULT_TABLES: [&str; 4] = ["animal", "evaluation", "show", "profile"];

/// Settings for one `offsync` installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// SQLite database holding the queue, conflicts and record tables.
    pub database: PathBuf,
    /// Record tables to register as JSON document tables.
    pub tables: Vec<String>,
    pub engine: EngineConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            tables: DEFAULT_TABLES.iter().map(|t| t.to_string()).collect(),
            engine: EngineConfig::default(),
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("offsync")
        .join("offsync.db")
}

impl CliConfig {
    /// Load from a JSON file, or use defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.engine.validate().context("Invalid engine settings")?;
        Ok(config)
    }

    /// Open the database and build an engine over the configured tables.
    pub async fn open_engine(&self) -> Result<SyncEngine> {
        let db = Database::open(&self.database)
            .with_context(|| format!("Failed to open {}", self.database.display()))?;
        let registry =
            TableRegistry::with_document_tables(&self.tables).context("Invalid table list")?;

        let engine = SyncEngine::new(db, registry, self.engine.clone())
            .await
            .context("Failed to start sync engine")?;
        Ok(engine.with_notifier(Arc::new(LogNotifier)))
    }
}
