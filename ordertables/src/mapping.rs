//! Static mapping between relational columns and their legacy counterparts.
//!
//! Each entity type owns an ordered list of [`ColumnMapping`] entries. The
//! list is the single source of truth for the relational schema, for
//! changeset extraction and for translating values to and from the legacy
//! post/postmeta representation. Within one entity type the mapping is a
//! bijection: no column and no legacy field appears twice.

use crate::entity::FieldValue;
use crate::errors::{Result, StorageError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Status an order carries while it waits for payment.
pub const PENDING_STATUS: &str = "wc-pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Order,
    Refund,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::Order, EntityType::Refund];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Order => "order",
            EntityType::Refund => "refund",
        }
    }

    /// Name of the primary key column of the relational table.
    pub fn primary_key(&self) -> &'static str {
        match self {
            EntityType::Order => "order_id",
            EntityType::Refund => "refund_id",
        }
    }

    /// Relational table name without the configured prefix.
    pub fn table_suffix(&self) -> &'static str {
        match self {
            EntityType::Order => "woocommerce_orders",
            EntityType::Refund => "woocommerce_refunds",
        }
    }

    /// Post type used for this entity in the legacy registry.
    pub fn post_type(&self) -> &'static str {
        match self {
            EntityType::Order => "shop_order",
            EntityType::Refund => "shop_order_refund",
        }
    }

    /// Status given to a freshly created entity.
    pub fn initial_status(&self) -> &'static str {
        match self {
            EntityType::Order => PENDING_STATUS,
            EntityType::Refund => "wc-completed",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "order" => Ok(EntityType::Order),
            "refund" => Ok(EntityType::Refund),
            other => Err(StorageError::InvalidArg(format!("unknown entity type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Decimal,
    Text,
    Integer,
    Bool,
    Timestamp,
}

impl FieldKind {
    /// Column type used in the relational table.
    ///
    /// Decimals are TEXT so the scale written by the legacy layer survives.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldKind::Decimal | FieldKind::Text => "TEXT",
            FieldKind::Integer | FieldKind::Timestamp | FieldKind::Bool => "INTEGER",
        }
    }

    /// Coerces a value into the canonical shape for this kind.
    pub fn normalize(&self, column: &'static str, value: &FieldValue) -> Result<FieldValue> {
        let invalid = |reason: String| StorageError::InvalidValue { column, reason };
        match (self, value) {
            (_, FieldValue::Null) => Ok(FieldValue::Null),
            (FieldKind::Bool, FieldValue::Bool(b)) => Ok(FieldValue::Bool(*b)),
            (FieldKind::Bool, FieldValue::Integer(i)) => Ok(FieldValue::Bool(*i != 0)),
            (FieldKind::Bool, FieldValue::Text(s)) => Ok(FieldValue::Bool(string_to_bool(s))),
            (FieldKind::Integer | FieldKind::Timestamp, FieldValue::Integer(i)) => {
                Ok(FieldValue::Integer(*i))
            }
            (FieldKind::Integer | FieldKind::Timestamp, FieldValue::Text(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(FieldValue::Null);
                }
                trimmed
                    .parse::<i64>()
                    .map(FieldValue::Integer)
                    .map_err(|_| invalid(format!("'{s}' is not an integer")))
            }
            (FieldKind::Decimal | FieldKind::Text, FieldValue::Text(s)) => {
                Ok(FieldValue::Text(s.clone()))
            }
            (FieldKind::Decimal | FieldKind::Text, FieldValue::Integer(i)) => {
                Ok(FieldValue::Text(i.to_string()))
            }
            (kind, FieldValue::Bool(b)) => Err(invalid(format!("boolean {b} given for a {kind:?} field"))),
        }
    }
}

/// Same truthiness rules the legacy layer applies to stored flags.
pub fn string_to_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "yes" | "true" | "1")
}

pub fn bool_to_string(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Columns of the legacy entity registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostColumn {
    Status,
    DateCreated,
    DateModified,
    Parent,
    Excerpt,
}

impl PostColumn {
    pub fn column_name(&self) -> &'static str {
        match self {
            PostColumn::Status => "post_status",
            PostColumn::DateCreated => "post_date_gmt",
            PostColumn::DateModified => "post_modified_gmt",
            PostColumn::Parent => "post_parent",
            PostColumn::Excerpt => "post_excerpt",
        }
    }
}

/// Where a column lives in the legacy representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegacyField {
    Meta(&'static str),
    Post(PostColumn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDefault {
    Null,
    Text(&'static str),
    Integer(i64),
    Bool(bool),
}

impl FieldDefault {
    pub fn to_value(&self) -> FieldValue {
        match self {
            FieldDefault::Null => FieldValue::Null,
            FieldDefault::Text(s) => FieldValue::Text((*s).to_string()),
            FieldDefault::Integer(i) => FieldValue::Integer(*i),
            FieldDefault::Bool(b) => FieldValue::Bool(*b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMapping {
    pub column: &'static str,
    pub legacy: LegacyField,
    pub kind: FieldKind,
    pub default: FieldDefault,
}

impl ColumnMapping {
    pub fn meta_key(&self) -> Option<&'static str> {
        match self.legacy {
            LegacyField::Meta(key) => Some(key),
            LegacyField::Post(_) => None,
        }
    }
}

const fn meta(column: &'static str, key: &'static str, kind: FieldKind, default: FieldDefault) -> ColumnMapping {
    ColumnMapping {
        column,
        legacy: LegacyField::Meta(key),
        kind,
        default,
    }
}

const fn post(column: &'static str, field: PostColumn, kind: FieldKind, default: FieldDefault) -> ColumnMapping {
    ColumnMapping {
        column,
        legacy: LegacyField::Post(field),
        kind,
        default,
    }
}

const fn money(column: &'static str, key: &'static str) -> ColumnMapping {
    meta(column, key, FieldKind::Decimal, FieldDefault::Text("0"))
}

const fn text(column: &'static str, key: &'static str) -> ColumnMapping {
    meta(column, key, FieldKind::Text, FieldDefault::Text(""))
}

static ORDER_COLUMNS: &[ColumnMapping] = &[
    post("status", PostColumn::Status, FieldKind::Text, FieldDefault::Text(PENDING_STATUS)),
    post("parent_id", PostColumn::Parent, FieldKind::Integer, FieldDefault::Integer(0)),
    post("date_created", PostColumn::DateCreated, FieldKind::Timestamp, FieldDefault::Null),
    post("date_modified", PostColumn::DateModified, FieldKind::Timestamp, FieldDefault::Null),
    post("customer_note", PostColumn::Excerpt, FieldKind::Text, FieldDefault::Text("")),
    text("order_key", "_order_key"),
    meta("customer_id", "_customer_user", FieldKind::Integer, FieldDefault::Integer(0)),
    text("payment_method", "_payment_method"),
    text("payment_method_title", "_payment_method_title"),
    text("transaction_id", "_transaction_id"),
    text("customer_ip_address", "_customer_ip_address"),
    text("customer_user_agent", "_customer_user_agent"),
    text("created_via", "_created_via"),
    meta("date_completed", "_date_completed", FieldKind::Timestamp, FieldDefault::Null),
    meta("date_paid", "_date_paid", FieldKind::Timestamp, FieldDefault::Null),
    text("cart_hash", "_cart_hash"),
    text("billing_first_name", "_billing_first_name"),
    text("billing_last_name", "_billing_last_name"),
    text("billing_company", "_billing_company"),
    text("billing_address_1", "_billing_address_1"),
    text("billing_address_2", "_billing_address_2"),
    text("billing_city", "_billing_city"),
    text("billing_state", "_billing_state"),
    text("billing_postcode", "_billing_postcode"),
    text("billing_country", "_billing_country"),
    text("billing_email", "_billing_email"),
    text("billing_phone", "_billing_phone"),
    text("shipping_first_name", "_shipping_first_name"),
    text("shipping_last_name", "_shipping_last_name"),
    text("shipping_company", "_shipping_company"),
    text("shipping_address_1", "_shipping_address_1"),
    text("shipping_address_2", "_shipping_address_2"),
    text("shipping_city", "_shipping_city"),
    text("shipping_state", "_shipping_state"),
    text("shipping_postcode", "_shipping_postcode"),
    text("shipping_country", "_shipping_country"),
    money("discount_total", "_cart_discount"),
    money("discount_tax", "_cart_discount_tax"),
    money("shipping_total", "_order_shipping"),
    money("shipping_tax", "_order_shipping_tax"),
    money("cart_tax", "_order_tax"),
    money("total", "_order_total"),
    text("version", "_order_version"),
    text("currency", "_order_currency"),
    meta("prices_include_tax", "_prices_include_tax", FieldKind::Bool, FieldDefault::Bool(false)),
];

static REFUND_COLUMNS: &[ColumnMapping] = &[
    post("parent_id", PostColumn::Parent, FieldKind::Integer, FieldDefault::Integer(0)),
    post("date_created", PostColumn::DateCreated, FieldKind::Timestamp, FieldDefault::Null),
    money("discount_total", "_cart_discount"),
    money("discount_tax", "_cart_discount_tax"),
    money("shipping_total", "_order_shipping"),
    money("shipping_tax", "_order_shipping_tax"),
    money("cart_tax", "_order_tax"),
    money("total", "_order_total"),
    text("version", "_order_version"),
    text("currency", "_order_currency"),
    meta("prices_include_tax", "_prices_include_tax", FieldKind::Bool, FieldDefault::Bool(false)),
    money("amount", "_refund_amount"),
    text("reason", "_refund_reason"),
    meta("refunded_by", "_refunded_by", FieldKind::Integer, FieldDefault::Integer(0)),
    meta("refunded_payment", "_refunded_payment", FieldKind::Bool, FieldDefault::Bool(false)),
];

/// Order columns matched by the address part of `search_orders`.
pub const ORDER_SEARCH_COLUMNS: &[&str] = &[
    "billing_first_name",
    "billing_last_name",
    "billing_company",
    "billing_address_1",
    "billing_city",
    "billing_postcode",
    "billing_email",
    "billing_phone",
    "shipping_first_name",
    "shipping_last_name",
    "shipping_company",
    "shipping_address_1",
    "shipping_city",
    "shipping_postcode",
];

static COLUMN_INDEX: Lazy<HashMap<(EntityType, &'static str), usize>> = Lazy::new(|| {
    EntityType::ALL
        .into_iter()
        .flat_map(|et| {
            columns_for(et)
                .iter()
                .enumerate()
                .map(move |(idx, mapping)| ((et, mapping.column), idx))
        })
        .collect()
});

pub fn columns_for(entity_type: EntityType) -> &'static [ColumnMapping] {
    match entity_type {
        EntityType::Order => ORDER_COLUMNS,
        EntityType::Refund => REFUND_COLUMNS,
    }
}

pub fn column_index(entity_type: EntityType, column: &str) -> Option<usize> {
    COLUMN_INDEX.get(&(entity_type, column)).copied()
}

/// Looks up a column, failing loudly when it is not mapped.
pub fn column(entity_type: EntityType, column: &str) -> Result<(usize, &'static ColumnMapping)> {
    column_index(entity_type, column)
        .map(|idx| (idx, &columns_for(entity_type)[idx]))
        .ok_or_else(|| StorageError::MappingGap {
            entity_type,
            column: column.to_string(),
        })
}
