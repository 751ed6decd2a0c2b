use crate::entity::{Entity, FieldValue};
use crate::errors::Result;
use crate::mapping::{self, EntityType};
use serde::Serialize;

/// Column/value pairs to persist in one upsert, in mapping order.
///
/// Only mapped columns can appear; the primary key travels separately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Changeset {
    entries: Vec<(&'static str, FieldValue)>,
}

impl Changeset {
    /// Full changeset for an entity without a stored row, dirty changeset otherwise.
    pub fn build(entity: &Entity, row_exists: bool) -> Result<Self> {
        if row_exists {
            Self::dirty(entity)
        } else {
            Self::full(entity)
        }
    }

    /// Every mapped column with its current value or default.
    pub fn full(entity: &Entity) -> Result<Self> {
        Self::collect(entity, |_| true)
    }

    /// Only the columns changed since the entity was loaded.
    pub fn dirty(entity: &Entity) -> Result<Self> {
        Self::collect(entity, |idx| entity.is_dirty(idx))
    }

    /// Builds a changeset from loose pairs, rejecting unmapped columns.
    pub fn from_pairs<'a, I>(entity_type: EntityType, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, FieldValue)>,
    {
        let mut indexed = Vec::new();
        for (name, value) in pairs {
            let (idx, column) = mapping::column(entity_type, name)?;
            indexed.push((idx, column.column, column.kind.normalize(column.column, &value)?));
        }
        indexed.sort_by_key(|(idx, _, _)| *idx);
        indexed.dedup_by_key(|(idx, _, _)| *idx);
        Ok(Self {
            entries: indexed.into_iter().map(|(_, name, value)| (name, value)).collect(),
        })
    }

    fn collect(entity: &Entity, include: impl Fn(usize) -> bool) -> Result<Self> {
        let mut entries = Vec::new();
        for (idx, (column, value)) in entity.values().enumerate() {
            if include(idx) {
                entries.push((column.column, column.kind.normalize(column.column, value)?));
            }
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> + '_ {
        self.entries.iter().map(|(name, value)| (*name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use crate::mapping::columns_for;

    #[test]
    fn absent_row_yields_every_mapped_column() {
        for et in EntityType::ALL {
            let mut entity = Entity::new(et);
            entity.set("total", "12.50").unwrap();
            let changeset = Changeset::build(&entity, false).unwrap();
            assert_eq!(changeset.len(), columns_for(et).len());
            assert_eq!(changeset.get("currency"), Some(&FieldValue::from("")));
        }
    }

    #[test]
    fn existing_row_yields_only_dirty_columns() {
        let mut refund = Entity::with_id(EntityType::Refund, 9);
        refund.set("reason", "damaged").unwrap();
        refund.set("refunded_by", 3i64).unwrap();
        let changeset = Changeset::build(&refund, true).unwrap();
        assert_eq!(changeset.columns().collect::<Vec<_>>(), vec!["reason", "refunded_by"]);
    }

    #[test]
    fn clean_existing_entity_is_a_no_op() {
        let refund = Entity::with_id(EntityType::Refund, 9);
        assert!(Changeset::build(&refund, true).unwrap().is_empty());
    }

    #[test]
    fn booleans_are_normalized() {
        let mut refund = Entity::with_id(EntityType::Refund, 4);
        refund.set("prices_include_tax", "yes").unwrap();
        refund.set("refunded_payment", 1i64).unwrap();
        let changeset = Changeset::dirty(&refund).unwrap();
        assert_eq!(changeset.get("prices_include_tax"), Some(&FieldValue::Bool(true)));
        assert_eq!(changeset.get("refunded_payment"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn from_pairs_orders_and_validates() {
        let changeset = Changeset::from_pairs(
            EntityType::Order,
            [("total", FieldValue::from("3.00")), ("status", FieldValue::from("wc-processing"))],
        )
        .unwrap();
        assert_eq!(changeset.columns().collect::<Vec<_>>(), vec!["status", "total"]);

        let err = Changeset::from_pairs(EntityType::Refund, [("status", FieldValue::Null)]).unwrap_err();
        assert!(matches!(err, StorageError::MappingGap { .. }));
    }
}
