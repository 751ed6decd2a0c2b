use crate::errors::Result;
use crate::mapping::{self, ColumnMapping, EntityType};
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Booleans bind as INTEGER 0/1, the relational store's canonical form.
impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            FieldValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(s.as_str().into()),
        })
    }
}

/// An order or refund held in memory.
///
/// Values are stored positionally, one per entry of
/// [`mapping::columns_for`], and columns changed since the last load or
/// persist are tracked so updates only touch what the caller modified.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    entity_type: EntityType,
    id: i64,
    values: Vec<FieldValue>,
    changes: BTreeSet<usize>,
}

impl Entity {
    /// A new, unsaved entity populated with column defaults.
    pub fn new(entity_type: EntityType) -> Self {
        Self::with_id(entity_type, 0)
    }

    pub fn with_id(entity_type: EntityType, id: i64) -> Self {
        let values = mapping::columns_for(entity_type)
            .iter()
            .map(|m| m.default.to_value())
            .collect();
        Self {
            entity_type,
            id,
            values,
            changes: BTreeSet::new(),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    pub fn get(&self, column: &str) -> Result<&FieldValue> {
        let (idx, _) = mapping::column(self.entity_type, column)?;
        Ok(&self.values[idx])
    }

    /// Sets a column, marking it dirty when the value differs.
    pub fn set(&mut self, column: &str, value: impl Into<FieldValue>) -> Result<()> {
        let (idx, _) = mapping::column(self.entity_type, column)?;
        let value = value.into();
        if self.values[idx] != value {
            self.values[idx] = value;
            self.changes.insert(idx);
        }
        Ok(())
    }

    /// Stores a value read from a backend without marking it dirty.
    pub(crate) fn load_value(&mut self, idx: usize, value: FieldValue) {
        self.values[idx] = value;
    }

    pub fn changes(&self) -> impl Iterator<Item = &'static str> + '_ {
        let columns = mapping::columns_for(self.entity_type);
        self.changes.iter().map(move |idx| columns[*idx].column)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub(crate) fn is_dirty(&self, idx: usize) -> bool {
        self.changes.contains(&idx)
    }

    /// Forgets tracked changes once they have been persisted.
    pub fn apply_changes(&mut self) {
        self.changes.clear();
    }

    pub fn values(&self) -> impl Iterator<Item = (&'static ColumnMapping, &FieldValue)> + '_ {
        mapping::columns_for(self.entity_type).iter().zip(self.values.iter())
    }

    pub fn status(&self) -> Option<&str> {
        self.get("status").ok().and_then(FieldValue::as_text)
    }

    pub fn total(&self) -> Option<&str> {
        self.get("total").ok().and_then(FieldValue::as_text)
    }

    pub fn currency(&self) -> Option<&str> {
        self.get("currency").ok().and_then(FieldValue::as_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;

    #[test]
    fn new_entity_has_defaults_and_no_changes() {
        let order = Entity::new(EntityType::Order);
        assert_eq!(order.id(), 0);
        assert_eq!(order.status(), Some("wc-pending"));
        assert_eq!(order.total(), Some("0"));
        assert_eq!(order.get("prices_include_tax").unwrap(), &FieldValue::Bool(false));
        assert!(!order.has_changes());
    }

    #[test]
    fn set_tracks_only_real_changes() {
        let mut refund = Entity::new(EntityType::Refund);
        refund.set("amount", "5.00").unwrap();
        refund.set("currency", "").unwrap();
        assert_eq!(refund.changes().collect::<Vec<_>>(), vec!["amount"]);

        refund.apply_changes();
        assert!(!refund.has_changes());
        assert_eq!(refund.get("amount").unwrap(), &FieldValue::from("5.00"));
    }

    #[test]
    fn unmapped_columns_are_rejected() {
        let mut refund = Entity::new(EntityType::Refund);
        assert!(matches!(
            refund.set("status", "wc-completed"),
            Err(StorageError::MappingGap { .. })
        ));
        assert!(refund.get("billing_email").is_err());
        assert_eq!(refund.status(), None);
    }

    #[test]
    fn field_values_serialize_untagged() {
        let values = vec![
            FieldValue::Null,
            FieldValue::Bool(true),
            FieldValue::Integer(3),
            FieldValue::from("USD"),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[null,true,3,"USD"]"#);
        let back: Vec<FieldValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }
}
