use crate::changeset::Changeset;
use crate::config::{Backend, StorageConfig};
use crate::db::Database;
use crate::entity::{Entity, FieldValue};
use crate::errors::{Result, StorageError};
use crate::events::{EventBus, StoreEvent};
use crate::legacy::{self, LegacyStore};
use crate::mapping::{self, EntityType, FieldKind, ORDER_SEARCH_COLUMNS, PENDING_STATUS};
use crate::store::{self, EntityStore, UpsertOutcome};
use rusqlite::types::ValueRef;
use rusqlite::{OptionalExtension, Row, ToSql, params};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Orders and refunds stored one row per entity in dedicated tables.
pub struct RelationalStore {
    db: Database,
    legacy: Arc<LegacyStore>,
    events: EventBus,
    prefix: String,
    search_meta_keys: Vec<String>,
}

impl RelationalStore {
    pub fn new(db: Database, legacy: Arc<LegacyStore>, events: EventBus, config: &StorageConfig) -> Self {
        Self {
            db,
            legacy,
            events,
            prefix: config.table_prefix.clone(),
            search_meta_keys: config.search_meta_keys.clone(),
        }
    }

    pub fn table_name(&self, entity_type: EntityType) -> String {
        format!("{}{}", self.prefix, entity_type.table_suffix())
    }

    pub fn create_table_sql(&self, entity_type: EntityType) -> String {
        let columns = mapping::columns_for(entity_type)
            .iter()
            .map(|m| format!(",\n    {} {}", m.column, m.kind.sql_type()))
            .collect::<String>();
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {} INTEGER PRIMARY KEY AUTOINCREMENT{}\n);",
            self.table_name(entity_type),
            entity_type.primary_key(),
            columns
        )
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let orders = self.table_name(EntityType::Order);
        let conn = self.db.lock()?;
        conn.execute_batch(&format!(
            "BEGIN;
            {}
            {}
            CREATE INDEX IF NOT EXISTS {orders}_status ON {orders} (status, date_modified);
            COMMIT;",
            self.create_table_sql(EntityType::Order),
            self.create_table_sql(EntityType::Refund),
        ))?;
        Ok(())
    }

    pub fn ensure_ready(&self, entity_type: EntityType) -> Result<()> {
        let table = self.table_name(entity_type);
        if self.db.table_exists(&table)? {
            Ok(())
        } else {
            Err(StorageError::StoreUnavailable(format!("relational table {table} is missing")))
        }
    }

    /// Whether a row exists for `id`. Unassigned IDs never exist.
    pub fn row_exists(&self, entity_type: EntityType, id: i64) -> Result<bool> {
        if id <= 0 {
            return Ok(false);
        }
        let conn = self.db.lock()?;
        let found = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE {} = ?1",
                    self.table_name(entity_type),
                    entity_type.primary_key()
                ),
                params![id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn build_changeset(&self, entity: &Entity) -> Result<Changeset> {
        let exists = self.row_exists(entity.entity_type(), entity.id())?;
        Changeset::build(entity, exists)
    }

    /// Inserts or updates the row keyed by `id` and publishes exactly one
    /// `Persisted` event on success.
    ///
    /// Inserted keys always live in the legacy registry: an `id` of zero
    /// allocates a new registry entry, and a preassigned `id` is registered
    /// if missing (failing when the registry holds another post type there).
    /// The key is returned in [`UpsertOutcome::Inserted`].
    pub fn upsert(&self, entity_type: EntityType, id: i64, changeset: &Changeset) -> Result<UpsertOutcome> {
        if changeset.is_empty() {
            log::trace!("Empty changeset for {} {}; nothing to persist", entity_type, id);
            return Ok(UpsertOutcome::NoOp);
        }

        let outcome = if self.row_exists(entity_type, id)? {
            let rows = self.update(entity_type, id, changeset)?;
            UpsertOutcome::Updated { rows }
        } else {
            let id = if id > 0 {
                self.legacy.ensure_post(entity_type, id)?;
                id
            } else {
                self.legacy
                    .create_post(entity_type.post_type(), entity_type.initial_status())?
            };
            self.insert(entity_type, id, changeset)?;
            UpsertOutcome::Inserted { id }
        };

        let id = outcome.inserted_id().unwrap_or(id);
        log::debug!("Persisted {} {} ({:?})", entity_type, id, outcome);
        self.events.publish(&StoreEvent::Persisted {
            entity_type,
            id,
            changeset: changeset.clone(),
        });
        Ok(outcome)
    }

    fn insert(&self, entity_type: EntityType, id: i64, changeset: &Changeset) -> Result<()> {
        let mut columns: Vec<&str> = Vec::with_capacity(changeset.len() + 1);
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(changeset.len() + 1);
        columns.push(entity_type.primary_key());
        values.push(&id);
        for (column, value) in changeset.iter() {
            columns.push(column);
            values.push(value);
        }
        let placeholders = (1..=values.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        // A conflicting key affects zero rows and surfaces as InsertFailed.
        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            self.table_name(entity_type),
            columns.join(", "),
            placeholders
        );

        let conn = self.db.lock()?;
        let affected = conn.execute(&sql, values.as_slice())?;
        if affected != 1 {
            return Err(StorageError::InsertFailed {
                entity_type,
                id,
                affected,
            });
        }
        Ok(())
    }

    fn update(&self, entity_type: EntityType, id: i64, changeset: &Changeset) -> Result<usize> {
        let assignments = changeset
            .columns()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            self.table_name(entity_type),
            assignments,
            entity_type.primary_key(),
            changeset.len() + 1
        );
        let mut values: Vec<&dyn ToSql> = changeset.iter().map(|(_, value)| value as &dyn ToSql).collect();
        values.push(&id);

        let conn = self.db.lock()?;
        Ok(conn.execute(&sql, values.as_slice())?)
    }

    fn select_sql(&self, entity_type: EntityType) -> String {
        let columns = mapping::columns_for(entity_type)
            .iter()
            .map(|m| m.column)
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT {pk}, {columns} FROM {table} WHERE {pk} = ?1",
            pk = entity_type.primary_key(),
            table = self.table_name(entity_type)
        )
    }

    fn entity_from_row(entity_type: EntityType, row: &Row<'_>) -> Result<Entity> {
        let mut entity = Entity::with_id(entity_type, row.get(0)?);
        for (idx, column) in mapping::columns_for(entity_type).iter().enumerate() {
            let value = read_column(column.column, column.kind, row.get_ref(idx + 1)?)?;
            entity.load_value(idx, value);
        }
        Ok(entity)
    }

    /// IDs of stored rows above `cursor`, ascending.
    pub fn ids_after(&self, entity_type: EntityType, cursor: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {pk} FROM {table} WHERE {pk} > ?1 ORDER BY {pk} LIMIT ?2",
            pk = entity_type.primary_key(),
            table = self.table_name(entity_type)
        ))?;
        let rows = stmt.query_map(params![cursor, limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    pub fn count(&self, entity_type: EntityType) -> Result<i64> {
        let conn = self.db.lock()?;
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table_name(entity_type)), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Legacy entities that have no relational row yet.
    pub fn pending_count(&self, entity_type: EntityType) -> Result<i64> {
        let conn = self.db.lock()?;
        let count = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {posts} p LEFT JOIN {table} t ON t.{pk} = p.ID
                 WHERE p.post_type = ?1 AND t.{pk} IS NULL",
                posts = self.legacy.posts_table(),
                table = self.table_name(entity_type),
                pk = entity_type.primary_key()
            ),
            params![entity_type.post_type()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Drops both relational tables, e.g. after rolling back to the legacy store.
    pub fn drop_tables(&self) -> Result<()> {
        let conn = self.db.lock()?;
        for et in EntityType::ALL {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.table_name(et)))?;
        }
        Ok(())
    }
}

/// Reads a stored column back into the value shape its kind uses.
fn read_column(column: &'static str, kind: FieldKind, value: ValueRef<'_>) -> Result<FieldValue> {
    let invalid = |reason: String| StorageError::InvalidValue { column, reason };
    match (kind, value) {
        (_, ValueRef::Null) => Ok(FieldValue::Null),
        (FieldKind::Bool, ValueRef::Integer(i)) => Ok(FieldValue::Bool(i != 0)),
        (FieldKind::Integer | FieldKind::Timestamp, ValueRef::Integer(i)) => Ok(FieldValue::Integer(i)),
        (FieldKind::Decimal | FieldKind::Text, ValueRef::Integer(i)) => Ok(FieldValue::Text(i.to_string())),
        (FieldKind::Decimal | FieldKind::Text, ValueRef::Real(f)) => Ok(FieldValue::Text(f.to_string())),
        (_, ValueRef::Text(bytes)) => {
            let text = std::str::from_utf8(bytes).map_err(|err| invalid(err.to_string()))?;
            kind.normalize(column, &FieldValue::Text(text.to_string()))
        }
        (kind, other) => Err(invalid(format!("unexpected {:?} for a {kind:?} column", other.data_type()))),
    }
}

impl EntityStore for RelationalStore {
    fn backend(&self) -> Backend {
        Backend::Relational
    }

    fn load(&self, entity_type: EntityType, id: i64) -> Result<Option<Entity>> {
        if id <= 0 {
            return Ok(None);
        }
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&self.select_sql(entity_type))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::entity_from_row(entity_type, row)?)),
            None => Ok(None),
        }
    }

    fn save(&self, entity: &mut Entity) -> Result<UpsertOutcome> {
        let entity_type = entity.entity_type();
        legacy::stamp_dates(entity, chrono::Utc::now().timestamp())?;
        if entity.id() == 0 {
            // Keys come from the legacy registry so both representations share one ID space.
            let id = self
                .legacy
                .create_post(entity_type.post_type(), entity_type.initial_status())?;
            entity.set_id(id);
        }

        let changeset = self.build_changeset(entity)?;
        let outcome = self.upsert(entity_type, entity.id(), &changeset)?;
        entity.apply_changes();
        Ok(outcome)
    }

    fn delete(&self, entity_type: EntityType, id: i64) -> Result<bool> {
        let removed = {
            let conn = self.db.lock()?;
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    self.table_name(entity_type),
                    entity_type.primary_key()
                ),
                params![id],
            )? > 0
        };
        // The legacy registry entry goes with the row.
        let cleaned = if self.legacy.post_type(id)?.as_deref() == Some(entity_type.post_type()) {
            self.legacy.delete_entity(id)?
        } else {
            false
        };
        if removed || cleaned {
            self.events.publish(&StoreEvent::Deleted { entity_type, id });
        }
        Ok(removed || cleaned)
    }

    fn order_count(&self, status: &str) -> Result<i64> {
        let conn = self.db.lock()?;
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE status = ?1", self.table_name(EntityType::Order)),
            params![status],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn unpaid_orders(&self, before: i64) -> Result<Vec<i64>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT order_id FROM {} WHERE status = ?1 AND COALESCE(date_modified, date_created) < ?2 ORDER BY order_id",
            self.table_name(EntityType::Order)
        ))?;
        let rows = stmt.query_map(params![PENDING_STATUS, before], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    fn search_orders(&self, term: &str) -> Result<Vec<i64>> {
        let mut ids = BTreeSet::new();
        ids.extend(store::numeric_term(term));

        let term = term.trim();
        if !term.is_empty() {
            let conditions = ORDER_SEARCH_COLUMNS
                .iter()
                .map(|column| format!("{column} LIKE ?1 ESCAPE '\\'"))
                .collect::<Vec<_>>()
                .join(" OR ");
            let conn = self.db.lock()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT order_id FROM {} WHERE {conditions}",
                self.table_name(EntityType::Order)
            ))?;
            let rows = stmt.query_map(params![store::like_pattern(term)], |row| row.get::<_, i64>(0))?;
            for id in rows {
                ids.insert(id?);
            }
        }

        // Metadata is only searched when a collaborator configured keys.
        ids.extend(self.legacy.search_meta(&self.search_meta_keys, term)?);
        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StoreListener;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<StoreEvent>>);

    impl StoreListener for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn on_event(&self, event: &StoreEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn setup() -> (RelationalStore, Arc<Recorder>) {
        let db = Database::open_in_memory().unwrap();
        let config = StorageConfig::default();
        let events = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        events.register(recorder.clone());
        let legacy = Arc::new(LegacyStore::new(db.clone(), events.clone(), &config));
        legacy.initialize_schema().unwrap();
        let store = RelationalStore::new(db, legacy, events, &config);
        store.initialize_schema().unwrap();
        (store, recorder)
    }

    fn refund_changeset() -> Changeset {
        let mut refund = Entity::new(EntityType::Refund);
        refund.set("amount", "4.00").unwrap();
        refund.set("refunded_payment", true).unwrap();
        Changeset::full(&refund).unwrap()
    }

    #[test]
    fn unassigned_ids_never_exist() {
        let (store, _) = setup();
        assert!(!store.row_exists(EntityType::Order, 0).unwrap());
        assert!(!store.row_exists(EntityType::Order, -3).unwrap());
        assert!(!store.row_exists(EntityType::Order, 17).unwrap());
    }

    #[test]
    fn empty_changeset_is_a_silent_no_op() {
        let (store, recorder) = setup();
        let outcome = store.upsert(EntityType::Order, 5, &Changeset::default()).unwrap();
        assert_eq!(outcome, UpsertOutcome::NoOp);
        assert!(!store.row_exists(EntityType::Order, 5).unwrap());
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn inserts_with_preassigned_and_generated_keys() {
        let (store, recorder) = setup();
        let changeset = refund_changeset();

        assert_eq!(
            store.upsert(EntityType::Refund, 40, &changeset).unwrap(),
            UpsertOutcome::Inserted { id: 40 }
        );
        let generated = store.upsert(EntityType::Refund, 0, &changeset).unwrap();
        assert_eq!(generated, UpsertOutcome::Inserted { id: 41 });
        assert_eq!(store.count(EntityType::Refund).unwrap(), 2);
        for id in [40, 41] {
            assert_eq!(store.legacy.post_type(id).unwrap().as_deref(), Some("shop_order_refund"));
        }

        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].id(), 41);
    }

    #[test]
    fn insert_refuses_keys_owned_by_other_post_types() {
        let (store, recorder) = setup();
        let product = store.legacy.create_post("product", "publish").unwrap();
        let err = store.upsert(EntityType::Refund, product, &refund_changeset()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArg(_)));
        assert!(!store.row_exists(EntityType::Refund, product).unwrap());
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn losing_insert_race_reports_insert_failed() {
        let (store, recorder) = setup();
        let changeset = refund_changeset();
        store.upsert(EntityType::Refund, 8, &changeset).unwrap();

        // Simulates another writer inserting the same key after the existence check.
        let err = store.insert(EntityType::Refund, 8, &changeset).unwrap_err();
        assert!(matches!(err, StorageError::InsertFailed { id: 8, affected: 0, .. }));
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn repeated_update_is_idempotent() {
        let (store, recorder) = setup();
        store.upsert(EntityType::Refund, 3, &refund_changeset()).unwrap();

        let update = Changeset::from_pairs(EntityType::Refund, [("reason", FieldValue::from("late"))]).unwrap();
        let first = store.upsert(EntityType::Refund, 3, &update).unwrap();
        let after_first = store.load(EntityType::Refund, 3).unwrap();
        let second = store.upsert(EntityType::Refund, 3, &update).unwrap();
        let after_second = store.load(EntityType::Refund, 3).unwrap();

        assert!(matches!(first, UpsertOutcome::Updated { .. }));
        assert!(matches!(second, UpsertOutcome::Updated { .. }));
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.unwrap().get("reason").unwrap(), &FieldValue::from("late"));
        assert_eq!(recorder.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn update_touches_only_changed_columns() {
        let (store, _) = setup();
        let mut refund = Entity::new(EntityType::Refund);
        refund.set("amount", "9.99").unwrap();
        store.save(&mut refund).unwrap();

        // Another subsystem changes a column behind our back.
        {
            let conn = store.db.lock().unwrap();
            conn.execute(
                "UPDATE wp_woocommerce_refunds SET reason = 'external' WHERE refund_id = ?1",
                params![refund.id()],
            )
            .unwrap();
        }

        refund.set("amount", "1.00").unwrap();
        let changeset = store.build_changeset(&refund).unwrap();
        assert_eq!(changeset.columns().collect::<Vec<_>>(), vec!["amount"]);
        store.save(&mut refund).unwrap();

        let stored = store.load(EntityType::Refund, refund.id()).unwrap().unwrap();
        assert_eq!(stored.get("amount").unwrap(), &FieldValue::from("1.00"));
        assert_eq!(stored.get("reason").unwrap(), &FieldValue::from("external"));
    }

    #[test]
    fn booleans_are_stored_as_integers() {
        let (store, _) = setup();
        store.upsert(EntityType::Refund, 2, &refund_changeset()).unwrap();
        let conn = store.db.lock().unwrap();
        let (flag, tax): (i64, i64) = conn
            .query_row(
                "SELECT refunded_payment, prices_include_tax FROM wp_woocommerce_refunds WHERE refund_id = 2",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((flag, tax), (1, 0));
    }

    #[test]
    fn delete_removes_row_and_legacy_entry() {
        let (store, recorder) = setup();
        let mut order = Entity::new(EntityType::Order);
        order.set("total", "20.00").unwrap();
        store.save(&mut order).unwrap();
        let id = order.id();
        assert_eq!(store.legacy.post_type(id).unwrap().as_deref(), Some("shop_order"));

        assert!(store.delete(EntityType::Order, id).unwrap());
        assert!(store.load(EntityType::Order, id).unwrap().is_none());
        assert!(store.legacy.post_type(id).unwrap().is_none());
        assert!(!store.delete(EntityType::Order, id).unwrap());

        let events = recorder.0.lock().unwrap();
        assert_eq!(
            events.last(),
            Some(&StoreEvent::Deleted {
                entity_type: EntityType::Order,
                id
            })
        );
    }
}
