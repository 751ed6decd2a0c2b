pub mod backfill;
pub mod catalog;
pub mod changeset;
pub mod config;
pub mod db;
pub mod driver;
pub mod entity;
pub mod errors;
pub mod events;
pub mod legacy;
pub mod mapping;
pub mod migration;
pub mod models;
pub mod relational;
pub mod store;

use crate::backfill::{Backfill, BackfillDriver};
use crate::catalog::Catalog;
use crate::config::{Backend, StorageConfig};
use crate::db::Database;
use crate::driver::Driver;
use crate::errors::Result;
use crate::events::{EventBus, LogListener};
use crate::legacy::LegacyStore;
use crate::mapping::EntityType;
use crate::migration::{Migrate, MigrationDriver};
use crate::relational::RelationalStore;
use crate::store::EntityStore;
use std::sync::Arc;

/// The main entry point for the `ordertables` library.
///
/// `OrderTables` wires together everything needed to keep orders and refunds
/// in two storage representations:
/// - A legacy entity registry with key/value metadata (`LegacyStore`).
/// - Dedicated relational tables, one row per entity (`RelationalStore`).
/// - A catalog (`Catalog`) holding migration cursors, failures and task logs.
/// - An event bus that dependent subsystems subscribe to (`EventBus`).
///
/// # Example
///
/// ```rust,no_run
/// use ordertables::{OrderTables, config::StorageConfig, mapping::EntityType};
/// use tempfile::tempdir;
///
/// let dir = tempdir().unwrap();
/// let tables = OrderTables::open(StorageConfig::new(dir.path())).unwrap();
///
/// let status = tables.migration(EntityType::Order).start(100).unwrap();
/// println!("{} migrated", status.counters.migrated);
/// let pending = tables.store().order_count("wc-pending").unwrap();
/// ```
pub struct OrderTables {
    pub config: StorageConfig,
    pub db: Database,
    pub events: EventBus,
    pub catalog: Arc<Catalog>,
    pub legacy: Arc<LegacyStore>,
    pub relational: Arc<RelationalStore>,
}

impl OrderTables {
    /// Opens the database file named in the config and creates any missing
    /// tables.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config)?;
        Self::with_database(config, db)
    }

    /// Same as [`OrderTables::open`] but backed by a private in-memory database.
    pub fn in_memory(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        Self::with_database(config, Database::open_in_memory()?)
    }

    fn with_database(config: StorageConfig, db: Database) -> Result<Self> {
        let events = EventBus::new();
        events.register(Arc::new(LogListener));

        let catalog = Arc::new(Catalog::new(db.clone()));
        catalog.initialize_schema()?;

        let legacy = Arc::new(LegacyStore::new(db.clone(), events.clone(), &config));
        legacy.initialize_schema()?;

        let relational = Arc::new(RelationalStore::new(
            db.clone(),
            Arc::clone(&legacy),
            events.clone(),
            &config,
        ));
        relational.initialize_schema()?;

        log::info!(
            "Opened order tables (backend: {:?}, prefix: {})",
            config.backend,
            config.table_prefix
        );
        Ok(Self {
            config,
            db,
            events,
            catalog,
            legacy,
            relational,
        })
    }

    /// The store selected by `config.backend`.
    pub fn store(&self) -> Arc<dyn EntityStore> {
        self.store_for(self.config.backend)
    }

    pub fn store_for(&self, backend: Backend) -> Arc<dyn EntityStore> {
        match backend {
            Backend::Relational => self.relational.clone(),
            Backend::Legacy => self.legacy.clone(),
        }
    }

    pub fn migration(&self, entity_type: EntityType) -> MigrationDriver {
        Driver::new(
            Migrate::new(
                entity_type,
                Arc::clone(&self.legacy),
                Arc::clone(&self.relational),
                Arc::clone(&self.catalog),
            ),
            Arc::clone(&self.catalog),
        )
    }

    pub fn backfill(&self, entity_type: EntityType) -> BackfillDriver {
        Driver::new(
            Backfill::new(entity_type, Arc::clone(&self.legacy), Arc::clone(&self.relational)),
            Arc::clone(&self.catalog),
        )
    }
}
