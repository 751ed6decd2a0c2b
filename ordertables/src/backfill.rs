use crate::driver::{BatchWork, Driver, ItemOutcome};
use crate::errors::{Result, StorageError};
use crate::legacy::{self, LegacyStore};
use crate::mapping::EntityType;
use crate::models::{JobKey, JobKind};
use crate::relational::RelationalStore;
use crate::store::EntityStore;
use std::sync::Arc;

/// Writes relational rows back into legacy metadata, e.g. before rolling
/// back to the legacy backend.
pub struct Backfill {
    entity_type: EntityType,
    legacy: Arc<LegacyStore>,
    relational: Arc<RelationalStore>,
}

pub type BackfillDriver = Driver<Backfill>;

impl Backfill {
    pub fn new(entity_type: EntityType, legacy: Arc<LegacyStore>, relational: Arc<RelationalStore>) -> Self {
        Self {
            entity_type,
            legacy,
            relational,
        }
    }
}

impl BatchWork for Backfill {
    fn key(&self) -> JobKey {
        JobKey::new(JobKind::Backfill, self.entity_type)
    }

    fn preflight(&self) -> Result<()> {
        self.relational.ensure_ready(self.entity_type)?;
        self.legacy.ensure_ready()
    }

    fn next_ids(&self, cursor: i64, limit: usize) -> Result<Vec<i64>> {
        self.relational.ids_after(self.entity_type, cursor, limit)
    }

    fn process(&self, id: i64) -> Result<ItemOutcome> {
        let entity = self
            .relational
            .load(self.entity_type, id)?
            .ok_or_else(|| StorageError::NotFound(format!("relational {} {}", self.entity_type, id)))?;

        let created = self.legacy.ensure_post(self.entity_type, id)?;
        let fields = entity
            .values()
            .map(|(mapping, value)| Ok((mapping, legacy::encode_field(mapping, value)?)))
            .collect::<Result<Vec<_>>>()?;
        // Current values are left alone; unset columns have no metadata key.
        let writes = self.legacy.write_fields(id, &fields)?;

        Ok(if created || writes > 0 {
            ItemOutcome::Migrated
        } else {
            ItemOutcome::Skipped
        })
    }
}
