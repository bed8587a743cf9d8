//! Storage engine - top-level coordinator

use super::database::DatabaseMeta;
use super::{Database, DatabaseStats, StorageConfig};
use crate::{BlockConfig, Point, Result, TallyError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// TallyDB storage engine
pub struct StorageEngine {
    config: StorageConfig,
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl StorageEngine {
    /// Create a new storage engine, loading every database in the data directory
    pub fn new(config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let engine = Self {
            config,
            databases: RwLock::new(HashMap::new()),
        };

        engine.load_databases()?;

        Ok(engine)
    }

    /// Engine configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Create a new database with the engine's segment size
    pub fn create_database(&self, name: &str, record_size: usize) -> Result<Arc<Database>> {
        self.create_database_with_config(name, record_size, &self.config.block_config())
    }

    /// Create a new database with its own block configuration
    pub fn create_database_with_config(
        &self,
        name: &str,
        record_size: usize,
        config: &BlockConfig,
    ) -> Result<Arc<Database>> {
        validate_name(name)?;
        let mut databases = self.databases.write();

        if databases.contains_key(name) {
            return Err(TallyError::Config(format!("Database {} already exists", name)));
        }

        let db = Database::create(name, &self.config.data_dir, record_size, config)?;

        let db = Arc::new(db);
        databases.insert(name.to_string(), db.clone());

        Ok(db)
    }

    /// Get a database by name
    pub fn get_database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.read().get(name).cloned()
    }

    /// Get a database by name, failing if it is not loaded
    pub fn database(&self, name: &str) -> Result<Arc<Database>> {
        self.get_database(name)
            .ok_or_else(|| TallyError::DatabaseNotFound(name.to_string()))
    }

    /// Drop a database and delete its files
    pub fn drop_database(&self, name: &str) -> Result<()> {
        let mut databases = self.databases.write();

        let db = databases
            .remove(name)
            .ok_or_else(|| TallyError::DatabaseNotFound(name.to_string()))?;

        if db.dir().exists() {
            std::fs::remove_dir_all(db.dir())?;
        }

        info!("Dropped database: {}", name);

        Ok(())
    }

    /// List all databases, sorted by name
    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Accumulate into one point of a database
    pub fn track(
        &self,
        database: &str,
        record: usize,
        point: usize,
        total: f64,
        count: u64,
    ) -> Result<()> {
        self.database(database)?.track(record, point, total, count)
    }

    /// Copy records `[from, to)` out of a database
    pub fn fetch(&self, database: &str, from: usize, to: usize) -> Result<Vec<Vec<Point>>> {
        self.database(database)?.fetch(from, to)
    }

    /// Sync every database.
    ///
    /// Every database is attempted even if an earlier one fails; the first
    /// error is returned.
    pub fn sync_all(&self) -> Result<()> {
        let databases: Vec<Arc<Database>> = self.databases.read().values().cloned().collect();

        let mut first_error = None;
        for db in databases {
            if let Err(e) = db.sync() {
                warn!("Error while syncing database {}: {}", db.name(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let databases = self.databases.read();
        let mut db_stats: Vec<_> = databases.values().map(|db| db.stats()).collect();
        db_stats.sort_by(|a, b| a.name.cmp(&b.name));

        EngineStats {
            database_count: databases.len(),
            total_records: db_stats.iter().map(|s| s.records).sum(),
            total_mapped_bytes: db_stats.iter().map(|s| s.mapped_bytes).sum(),
            databases: db_stats,
        }
    }

    fn load_databases(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();

            // Skip hidden directories
            if name.starts_with('.') {
                continue;
            }

            if !DatabaseMeta::exists(&entry.path()) {
                debug!("Skipping {:?}: no database metadata", entry.path());
                continue;
            }

            match Database::open(&name, &self.config.data_dir) {
                Ok(db) => {
                    let mut databases = self.databases.write();
                    databases.insert(name.clone(), Arc::new(db));
                    info!("Loaded database: {}", name);
                }
                Err(e) => {
                    warn!("Failed to load database {}: {}", name, e);
                }
            }
        }

        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(TallyError::Config(format!("Invalid database name: {:?}", name)))
    }
}

/// Storage engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub database_count: usize,
    pub total_records: usize,
    pub total_mapped_bytes: u64,
    pub databases: Vec<DatabaseStats>,
}
