use crate::catalog::Catalog;
use crate::changeset::Changeset;
use crate::driver::{BatchWork, Driver, ItemOutcome};
use crate::errors::{Result, StorageError};
use crate::legacy::LegacyStore;
use crate::mapping::EntityType;
use crate::models::{JobKey, JobKind};
use crate::relational::RelationalStore;
use crate::store::EntityStore;
use std::sync::Arc;

/// Copies legacy entities of one type into their relational table.
pub struct Migrate {
    entity_type: EntityType,
    legacy: Arc<LegacyStore>,
    relational: Arc<RelationalStore>,
    catalog: Arc<Catalog>,
}

pub type MigrationDriver = Driver<Migrate>;

impl Migrate {
    pub fn new(
        entity_type: EntityType,
        legacy: Arc<LegacyStore>,
        relational: Arc<RelationalStore>,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            entity_type,
            legacy,
            relational,
            catalog,
        }
    }

    /// Legacy entities that have no relational row yet.
    pub fn pending_count(&self) -> Result<i64> {
        self.relational.pending_count(self.entity_type)
    }
}

impl BatchWork for Migrate {
    fn key(&self) -> JobKey {
        JobKey::new(JobKind::Migrate, self.entity_type)
    }

    fn preflight(&self) -> Result<()> {
        self.legacy.ensure_ready()?;
        self.relational.ensure_ready(self.entity_type)
    }

    fn next_ids(&self, cursor: i64, limit: usize) -> Result<Vec<i64>> {
        self.legacy.ids_after(self.entity_type, cursor, limit)
    }

    fn process(&self, id: i64) -> Result<ItemOutcome> {
        let entity = self
            .legacy
            .load(self.entity_type, id)?
            .ok_or_else(|| StorageError::NotFound(format!("legacy {} {}", self.entity_type, id)))?;
        // Dirty tracking is irrelevant here: every mapped field is copied.
        let changeset = Changeset::full(&entity)?;

        let current = self.relational.load(self.entity_type, id)?;
        let outcome = match current {
            Some(row) if Changeset::full(&row)? == changeset => ItemOutcome::Skipped,
            _ => {
                self.relational.upsert(self.entity_type, id, &changeset)?;
                ItemOutcome::Migrated
            }
        };
        self.catalog.mark_migrated(self.entity_type, id)?;
        Ok(outcome)
    }
}

impl MigrationDriver {
    pub fn pending_count(&self) -> Result<i64> {
        self.work().pending_count()
    }
}
