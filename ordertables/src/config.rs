use crate::errors::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_TABLE_PREFIX: &str = "wp_";
pub const DATABASE_FILE: &str = "order_tables.sqlite";

/// Which representation serves reads and writes through `EntityStore`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Relational,
    Legacy,
}

impl FromStr for Backend {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" => Ok(Backend::Relational),
            "legacy" => Ok(Backend::Legacy),
            other => Err(StorageError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub table_prefix: String,
    pub backend: Backend,
    pub batch_size: usize,
    /// Metadata keys searched by `search_orders`. Empty disables metadata search.
    pub search_meta_keys: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DATABASE_FILE),
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            backend: Backend::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            search_meta_keys: Vec::new(),
        }
    }
}

impl StorageConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            database_path: base_path.join(DATABASE_FILE),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: StorageConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `ORDER_TABLES_*` environment variables on top of the current values.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(path) = std::env::var("ORDER_TABLES_DB") {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(prefix) = std::env::var("ORDER_TABLES_PREFIX") {
            self.table_prefix = prefix;
        }
        if let Ok(backend) = std::env::var("ORDER_TABLES_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Ok(batch_size) = std::env::var("ORDER_TABLES_BATCH_SIZE") {
            self.batch_size = batch_size.trim().parse().map_err(|_| {
                StorageError::Config(format!("ORDER_TABLES_BATCH_SIZE is not a number: {batch_size}"))
            })?;
        }
        if let Ok(keys) = std::env::var("ORDER_TABLES_SEARCH_META_KEYS") {
            self.search_meta_keys = parse_key_list(&keys);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_search_meta_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_meta_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(StorageError::Config("batch_size must be greater than zero".into()));
        }
        // The prefix is interpolated into SQL identifiers.
        if !self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StorageError::Config(format!(
                "table_prefix '{}' may only contain ASCII letters, digits and '_'",
                self.table_prefix
            )));
        }
        Ok(())
    }
}

fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_into_base_path() {
        let config = StorageConfig::new("/tmp/shop");
        assert_eq!(config.database_path, PathBuf::from("/tmp/shop").join(DATABASE_FILE));
        assert_eq!(config.table_prefix, "wp_");
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.search_meta_keys.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unsafe_prefix_and_zero_batch() {
        let mut config = StorageConfig::new("/tmp/shop");
        config.table_prefix = "wp_; DROP TABLE".into();
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));

        let mut config = StorageConfig::new("/tmp/shop");
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn parses_json_with_partial_fields() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"backend": "legacy", "search_meta_keys": ["_sku"]}"#).unwrap();
        assert_eq!(config.backend, Backend::Legacy);
        assert_eq!(config.search_meta_keys, vec!["_sku".to_string()]);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn key_list_ignores_blanks() {
        assert_eq!(parse_key_list(" a, ,b ,"), vec!["a".to_string(), "b".to_string()]);
        assert!(parse_key_list("").is_empty());
    }
}
