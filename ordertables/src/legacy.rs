//! The legacy representation: an entity registry (`posts`) plus free-form
//! key/value metadata (`postmeta`).
//!
//! Values are stored as strings using the legacy encodings: flags as
//! `yes`/`no`, meta timestamps as unix seconds, registry dates as
//! `YYYY-MM-DD HH:MM:SS` in UTC.

use crate::changeset::Changeset;
use crate::config::{Backend, StorageConfig};
use crate::db::Database;
use crate::entity::{Entity, FieldValue};
use crate::errors::{Result, StorageError};
use crate::events::{EventBus, StoreEvent};
use crate::mapping::{
    self, ColumnMapping, EntityType, FieldKind, LegacyField, ORDER_SEARCH_COLUMNS, PENDING_STATUS,
    PostColumn, bool_to_string,
};
use crate::store::{self, EntityStore, UpsertOutcome};
use chrono::{DateTime, NaiveDateTime};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::{BTreeSet, HashMap};

pub const ZERO_DATE: &str = "0000-00-00 00:00:00";
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_date(column: &'static str, timestamp: i64) -> Result<String> {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format(DATE_FORMAT).to_string())
        .ok_or_else(|| StorageError::InvalidValue {
            column,
            reason: format!("timestamp {timestamp} out of range"),
        })
}

pub fn parse_date(column: &'static str, raw: &str) -> Result<FieldValue> {
    let raw = raw.trim();
    if raw.is_empty() || raw == ZERO_DATE {
        return Ok(FieldValue::Null);
    }
    NaiveDateTime::parse_from_str(raw, DATE_FORMAT)
        .map(|dt| FieldValue::Integer(dt.and_utc().timestamp()))
        .map_err(|err| StorageError::InvalidValue {
            column,
            reason: format!("'{raw}' is not a date: {err}"),
        })
}

/// Encodes a value the way the legacy layer writes it.
pub fn encode(mapping: &ColumnMapping, value: &FieldValue) -> Result<String> {
    let value = mapping.kind.normalize(mapping.column, value)?;
    Ok(match (value, mapping.kind, mapping.legacy) {
        (FieldValue::Null, FieldKind::Timestamp, LegacyField::Post(_)) => ZERO_DATE.to_string(),
        (FieldValue::Null, _, LegacyField::Post(PostColumn::Parent)) => "0".to_string(),
        (FieldValue::Null, _, _) => String::new(),
        (FieldValue::Bool(b), _, _) => bool_to_string(b).to_string(),
        (FieldValue::Integer(ts), FieldKind::Timestamp, LegacyField::Post(_)) => {
            format_date(mapping.column, ts)?
        }
        (FieldValue::Integer(i), _, _) => i.to_string(),
        (FieldValue::Text(s), _, _) => s,
    })
}

/// Encodes a value for writing, or `None` when the metadata key should be
/// absent. Registry columns always have a value.
pub fn encode_field(mapping: &ColumnMapping, value: &FieldValue) -> Result<Option<String>> {
    match (mapping.kind.normalize(mapping.column, value)?, mapping.legacy) {
        (FieldValue::Null, LegacyField::Meta(_)) => Ok(None),
        (value, _) => encode(mapping, &value).map(Some),
    }
}

/// Decodes a raw legacy value.
///
/// A missing metadata key stays `Null` so writing the entity back leaves the
/// key missing; a missing registry value yields the column default.
pub fn decode(mapping: &ColumnMapping, raw: Option<&str>) -> Result<FieldValue> {
    let Some(raw) = raw else {
        return Ok(match mapping.legacy {
            LegacyField::Meta(_) => FieldValue::Null,
            LegacyField::Post(_) => mapping.default.to_value(),
        });
    };
    match (mapping.kind, mapping.legacy) {
        (FieldKind::Timestamp, LegacyField::Post(_)) => parse_date(mapping.column, raw),
        (kind, _) => kind.normalize(mapping.column, &FieldValue::Text(raw.to_string())),
    }
}

fn sql_to_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Sets new and changed entities' registry timestamps.
pub(crate) fn stamp_dates(entity: &mut Entity, now: i64) -> Result<()> {
    let dirty_modified = entity.changes().any(|c| c == "date_modified");
    if entity.id() == 0 && entity.get("date_created")?.is_null() {
        entity.set("date_created", now)?;
    }
    if entity.has_changes()
        && !dirty_modified
        && mapping::column_index(entity.entity_type(), "date_modified").is_some()
    {
        entity.set("date_modified", now)?;
    }
    Ok(())
}

pub struct LegacyStore {
    db: Database,
    events: EventBus,
    posts_table: String,
    meta_table: String,
    search_meta_keys: Vec<String>,
}

impl LegacyStore {
    pub fn new(db: Database, events: EventBus, config: &StorageConfig) -> Self {
        Self {
            db,
            events,
            posts_table: format!("{}posts", config.table_prefix),
            meta_table: format!("{}postmeta", config.table_prefix),
            search_meta_keys: config.search_meta_keys.clone(),
        }
    }

    pub fn posts_table(&self) -> &str {
        &self.posts_table
    }

    pub fn meta_table(&self) -> &str {
        &self.meta_table
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute_batch(&format!(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS {posts} (
                ID INTEGER PRIMARY KEY AUTOINCREMENT,
                post_type TEXT NOT NULL,
                post_status TEXT NOT NULL DEFAULT 'publish',
                post_date_gmt TEXT NOT NULL DEFAULT '{zero}',
                post_modified_gmt TEXT NOT NULL DEFAULT '{zero}',
                post_parent INTEGER NOT NULL DEFAULT 0,
                post_excerpt TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS {posts}_type_status ON {posts} (post_type, post_status);
            CREATE TABLE IF NOT EXISTS {meta} (
                meta_id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id INTEGER NOT NULL,
                meta_key TEXT,
                meta_value TEXT
            );
            CREATE INDEX IF NOT EXISTS {meta}_post_key ON {meta} (post_id, meta_key);
            COMMIT;",
            posts = self.posts_table,
            meta = self.meta_table,
            zero = ZERO_DATE,
        ))?;
        Ok(())
    }

    pub fn ensure_ready(&self) -> Result<()> {
        for table in [&self.posts_table, &self.meta_table] {
            if !self.db.table_exists(table)? {
                return Err(StorageError::StoreUnavailable(format!("legacy table {table} is missing")));
            }
        }
        Ok(())
    }

    /// Registers a new post of any type and returns its ID.
    pub fn create_post(&self, post_type: &str, status: &str) -> Result<i64> {
        let now = format_date("post_date_gmt", chrono::Utc::now().timestamp())?;
        let conn = self.db.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (post_type, post_status, post_date_gmt, post_modified_gmt) VALUES (?1, ?2, ?3, ?3)",
                self.posts_table
            ),
            params![post_type, status, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Registers `id` for the entity type if no post has it yet.
    ///
    /// Returns whether a registry entry was created.
    pub fn ensure_post(&self, entity_type: EntityType, id: i64) -> Result<bool> {
        let conn = self.db.lock()?;
        let created = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (ID, post_type, post_status) VALUES (?1, ?2, ?3)",
                self.posts_table
            ),
            params![id, entity_type.post_type(), entity_type.initial_status()],
        )? == 1;
        let post_type: String = conn.query_row(
            &format!("SELECT post_type FROM {} WHERE ID = ?1", self.posts_table),
            params![id],
            |row| row.get(0),
        )?;
        if post_type != entity_type.post_type() {
            return Err(StorageError::InvalidArg(format!(
                "post {id} is a '{post_type}', not a '{}'",
                entity_type.post_type()
            )));
        }
        Ok(created)
    }

    pub fn post_type(&self, id: i64) -> Result<Option<String>> {
        let conn = self.db.lock()?;
        let post_type = conn
            .query_row(
                &format!("SELECT post_type FROM {} WHERE ID = ?1", self.posts_table),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(post_type)
    }

    pub fn get_meta(&self, id: i64, key: &str) -> Result<Option<String>> {
        let conn = self.db.lock()?;
        Self::read_meta(&conn, &self.meta_table, id, key)
    }

    /// Adds a metadata row even when the key already exists for the post.
    pub fn add_meta(&self, id: i64, key: &str, value: &str) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
                self.meta_table
            ),
            params![id, key, value],
        )?;
        Ok(())
    }

    /// Sets a metadata value, returning whether anything was written.
    pub fn update_meta(&self, id: i64, key: &str, value: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        Self::put_meta(&conn, &self.meta_table, id, key, value)
    }

    /// Every metadata row of a post, in insertion order.
    pub fn all_meta(&self, id: i64) -> Result<Vec<(String, Option<String>)>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT meta_key, meta_value FROM {} WHERE post_id = ?1 ORDER BY meta_id",
            self.meta_table
        ))?;
        let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Raw legacy encodings of an entity's mapped fields, keyed by column.
    pub fn raw_fields(&self, entity_type: EntityType, id: i64) -> Result<Option<HashMap<&'static str, String>>> {
        let conn = self.db.lock()?;
        let Some(raw) = self.read_raw(&conn, entity_type, id)? else {
            return Ok(None);
        };
        Ok(Some(
            mapping::columns_for(entity_type)
                .iter()
                .zip(raw)
                .filter_map(|(m, value)| value.map(|v| (m.column, v)))
                .collect(),
        ))
    }

    /// Writes encoded fields in one transaction, skipping values that are
    /// already current. A `None` metadata value removes the key. Returns the
    /// number of fields written.
    pub fn write_fields(&self, id: i64, fields: &[(&ColumnMapping, Option<String>)]) -> Result<usize> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let mut writes = 0;
        for (mapping, encoded) in fields {
            let changed = match (mapping.legacy, encoded) {
                (LegacyField::Meta(key), Some(value)) => Self::put_meta(&tx, &self.meta_table, id, key, value)?,
                (LegacyField::Meta(key), None) => Self::remove_meta(&tx, &self.meta_table, id, key)?,
                (LegacyField::Post(column), Some(value)) => {
                    Self::put_post_column(&tx, &self.posts_table, id, mapping.column, column, value)?
                }
                (LegacyField::Post(column), None) => {
                    let value = encode(mapping, &FieldValue::Null)?;
                    Self::put_post_column(&tx, &self.posts_table, id, mapping.column, column, &value)?
                }
            };
            if changed {
                writes += 1;
            }
        }
        tx.commit()?;
        Ok(writes)
    }

    /// Removes a post and all its metadata without publishing an event.
    pub fn delete_entity(&self, id: i64) -> Result<bool> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {} WHERE post_id = ?1", self.meta_table), params![id])?;
        let removed = tx.execute(&format!("DELETE FROM {} WHERE ID = ?1", self.posts_table), params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// IDs of entities of a type above `cursor`, ascending.
    pub fn ids_after(&self, entity_type: EntityType, cursor: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT ID FROM {} WHERE post_type = ?1 AND ID > ?2 ORDER BY ID LIMIT ?3",
            self.posts_table
        ))?;
        let rows = stmt.query_map(params![entity_type.post_type(), cursor, limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    pub fn count(&self, entity_type: EntityType) -> Result<i64> {
        let conn = self.db.lock()?;
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE post_type = ?1", self.posts_table),
            params![entity_type.post_type()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// IDs of any post whose metadata under one of `keys` contains `term`.
    pub fn search_meta(&self, keys: &[String], term: &str) -> Result<Vec<i64>> {
        if keys.is_empty() || term.trim().is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..keys.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT DISTINCT post_id FROM {} WHERE meta_key IN ({placeholders}) AND meta_value LIKE ?1 ESCAPE '\\' ORDER BY post_id",
            self.meta_table
        );
        let pattern = store::like_pattern(term.trim());
        let values = std::iter::once(pattern.as_str()).chain(keys.iter().map(String::as_str));

        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    fn read_meta(conn: &Connection, table: &str, id: i64, key: &str) -> Result<Option<String>> {
        let value = conn
            .query_row(
                &format!(
                    "SELECT meta_value FROM {table} WHERE post_id = ?1 AND meta_key = ?2 ORDER BY meta_id LIMIT 1"
                ),
                params![id, key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    fn put_meta(conn: &Connection, table: &str, id: i64, key: &str, value: &str) -> Result<bool> {
        let exists = conn
            .query_row(
                &format!("SELECT meta_value FROM {table} WHERE post_id = ?1 AND meta_key = ?2 ORDER BY meta_id LIMIT 1"),
                params![id, key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        match exists {
            Some(Some(current)) if current == value => Ok(false),
            Some(_) => {
                conn.execute(
                    &format!("UPDATE {table} SET meta_value = ?3 WHERE post_id = ?1 AND meta_key = ?2"),
                    params![id, key, value],
                )?;
                Ok(true)
            }
            None => {
                conn.execute(
                    &format!("INSERT INTO {table} (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)"),
                    params![id, key, value],
                )?;
                Ok(true)
            }
        }
    }

    fn remove_meta(conn: &Connection, table: &str, id: i64, key: &str) -> Result<bool> {
        let removed = conn.execute(
            &format!("DELETE FROM {table} WHERE post_id = ?1 AND meta_key = ?2"),
            params![id, key],
        )?;
        Ok(removed > 0)
    }

    fn put_post_column(
        conn: &Connection,
        table: &str,
        id: i64,
        column: &'static str,
        field: PostColumn,
        value: &str,
    ) -> Result<bool> {
        let name = field.column_name();
        let current = conn
            .query_row(&format!("SELECT {name} FROM {table} WHERE ID = ?1"), params![id], |row| {
                Ok(sql_to_string(row.get_ref(0)?))
            })
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("post {id}")))?;
        if current.as_deref() == Some(value) {
            return Ok(false);
        }
        let sql = format!("UPDATE {table} SET {name} = ?1 WHERE ID = ?2");
        if field == PostColumn::Parent {
            let parent: i64 = value.parse().map_err(|_| StorageError::InvalidValue {
                column,
                reason: format!("'{value}' is not a post ID"),
            })?;
            conn.execute(&sql, params![parent, id])?;
        } else {
            conn.execute(&sql, params![value, id])?;
        }
        Ok(true)
    }

    /// Raw values positioned like `columns_for(entity_type)`, or `None` when
    /// the post is missing or of another type.
    fn read_raw(&self, conn: &Connection, entity_type: EntityType, id: i64) -> Result<Option<Vec<Option<String>>>> {
        let post = conn
            .query_row(
                &format!(
                    "SELECT post_type, post_status, post_date_gmt, post_modified_gmt, post_parent, post_excerpt FROM {} WHERE ID = ?1",
                    self.posts_table
                ),
                params![id],
                |row| {
                    let mut fields = HashMap::new();
                    for (idx, column) in [
                        PostColumn::Status,
                        PostColumn::DateCreated,
                        PostColumn::DateModified,
                        PostColumn::Parent,
                        PostColumn::Excerpt,
                    ]
                    .into_iter()
                    .enumerate()
                    {
                        if let Some(value) = sql_to_string(row.get_ref(idx + 1)?) {
                            fields.insert(column, value);
                        }
                    }
                    Ok((row.get::<_, String>(0)?, fields))
                },
            )
            .optional()?;
        let Some((post_type, mut post_fields)) = post else {
            return Ok(None);
        };
        if post_type != entity_type.post_type() {
            return Ok(None);
        }

        let mut meta: HashMap<String, String> = HashMap::new();
        let mut stmt = conn.prepare(&format!(
            "SELECT meta_key, meta_value FROM {} WHERE post_id = ?1 ORDER BY meta_id",
            self.meta_table
        ))?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        for row in rows {
            if let (Some(key), Some(value)) = row? {
                meta.entry(key).or_insert(value);
            }
        }

        Ok(Some(
            mapping::columns_for(entity_type)
                .iter()
                .map(|m| match m.legacy {
                    LegacyField::Meta(key) => meta.remove(key),
                    LegacyField::Post(column) => post_fields.remove(&column),
                })
                .collect(),
        ))
    }

    fn exists(&self, entity_type: EntityType, id: i64) -> Result<bool> {
        Ok(id > 0 && self.post_type(id)?.as_deref() == Some(entity_type.post_type()))
    }
}

impl EntityStore for LegacyStore {
    fn backend(&self) -> Backend {
        Backend::Legacy
    }

    fn load(&self, entity_type: EntityType, id: i64) -> Result<Option<Entity>> {
        let raw = {
            let conn = self.db.lock()?;
            self.read_raw(&conn, entity_type, id)?
        };
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut entity = Entity::with_id(entity_type, id);
        for (idx, (mapping, value)) in mapping::columns_for(entity_type).iter().zip(raw).enumerate() {
            entity.load_value(idx, decode(mapping, value.as_deref())?);
        }
        Ok(Some(entity))
    }

    fn save(&self, entity: &mut Entity) -> Result<UpsertOutcome> {
        let entity_type = entity.entity_type();
        stamp_dates(entity, chrono::Utc::now().timestamp())?;

        let (changeset, created) = if entity.id() == 0 {
            let id = self.create_post(entity_type.post_type(), entity_type.initial_status())?;
            entity.set_id(id);
            (Changeset::full(entity)?, true)
        } else if self.exists(entity_type, entity.id())? {
            (Changeset::dirty(entity)?, false)
        } else {
            let created = self.ensure_post(entity_type, entity.id())?;
            (Changeset::full(entity)?, created)
        };

        if changeset.is_empty() {
            log::trace!("Nothing to save for {} {}", entity_type, entity.id());
            return Ok(UpsertOutcome::NoOp);
        }

        let fields = changeset
            .iter()
            .map(|(name, value)| {
                let (_, column) = mapping::column(entity_type, name)?;
                Ok((column, encode_field(column, value)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let writes = self.write_fields(entity.id(), &fields)?;

        self.events.publish(&StoreEvent::Persisted {
            entity_type,
            id: entity.id(),
            changeset,
        });
        entity.apply_changes();

        Ok(if created {
            UpsertOutcome::Inserted { id: entity.id() }
        } else {
            UpsertOutcome::Updated { rows: writes.min(1) }
        })
    }

    fn delete(&self, entity_type: EntityType, id: i64) -> Result<bool> {
        if !self.exists(entity_type, id)? {
            return Ok(false);
        }
        let removed = self.delete_entity(id)?;
        if removed {
            self.events.publish(&StoreEvent::Deleted { entity_type, id });
        }
        Ok(removed)
    }

    fn order_count(&self, status: &str) -> Result<i64> {
        let conn = self.db.lock()?;
        let count = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE post_type = ?1 AND post_status = ?2",
                self.posts_table
            ),
            params![EntityType::Order.post_type(), status],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn unpaid_orders(&self, before: i64) -> Result<Vec<i64>> {
        let cutoff = format_date("date_modified", before)?;
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT ID FROM {} WHERE post_type = ?1 AND post_status = ?2
               AND COALESCE(NULLIF(post_modified_gmt, ?4), NULLIF(post_date_gmt, ?4)) < ?3
             ORDER BY ID",
            self.posts_table
        ))?;
        let rows = stmt.query_map(
            params![EntityType::Order.post_type(), PENDING_STATUS, cutoff, ZERO_DATE],
            |row| row.get(0),
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    fn search_orders(&self, term: &str) -> Result<Vec<i64>> {
        let mut ids = BTreeSet::new();
        ids.extend(store::numeric_term(term));

        let address_keys: Vec<String> = ORDER_SEARCH_COLUMNS
            .iter()
            .filter_map(|name| mapping::column(EntityType::Order, name).ok())
            .filter_map(|(_, m)| m.meta_key().map(str::to_string))
            .collect();
        let candidates = self.search_meta(&address_keys, term)?;
        for id in candidates {
            if self.exists(EntityType::Order, id)? {
                ids.insert(id);
            }
        }

        ids.extend(self.search_meta(&self.search_meta_keys, term)?);
        Ok(ids.into_iter().collect())
    }
}
