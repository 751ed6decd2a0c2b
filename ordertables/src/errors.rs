use crate::mapping::EntityType;
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite operation failed: {0}")]
    SQLite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Insert into the {entity_type} table failed for id {id}: {affected} rows affected")]
    InsertFailed {
        entity_type: EntityType,
        id: i64,
        affected: usize,
    },

    #[error("No field mapping for column '{column}' on {entity_type}")]
    MappingGap {
        entity_type: EntityType,
        column: String,
    },

    #[error("Invalid value for '{column}': {reason}")]
    InvalidValue { column: &'static str, reason: String },

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Whether the error should stop a whole driver run instead of being
    /// recorded against a single entity.
    pub fn is_fatal(&self) -> bool {
        match self {
            StorageError::StoreUnavailable(_)
            | StorageError::MappingGap { .. }
            | StorageError::Config(_)
            | StorageError::Io(_) => true,
            StorageError::SQLite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
                    | ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(StorageError::StoreUnavailable("gone".into()).is_fatal());
        assert!(
            StorageError::MappingGap {
                entity_type: EntityType::Order,
                column: "nope".into(),
            }
            .is_fatal()
        );
        assert!(
            !StorageError::InsertFailed {
                entity_type: EntityType::Refund,
                id: 7,
                affected: 0,
            }
            .is_fatal()
        );
        assert!(
            !StorageError::InvalidValue {
                column: "customer_id",
                reason: "not a number".into(),
            }
            .is_fatal()
        );
    }
}
