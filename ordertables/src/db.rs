use crate::config::StorageConfig;
use crate::errors::{Result, StorageError};
use rusqlite::{Connection, params};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Shared handle to the SQLite database holding both representations.
///
/// Every component locks the connection per statement or per transaction and
/// never across calls into another component.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.database_path).map_err(|err| {
            StorageError::StoreUnavailable(format!(
                "cannot open {}: {err}",
                config.database_path.display()
            ))
        })?;
        // Another process may be running a migration against the same file.
        conn.busy_timeout(Duration::from_secs(30))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::StoreUnavailable("database connection lock poisoned".into()))
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("nested/site"));
        let db = Database::open(&config).unwrap();
        db.lock().unwrap().execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
        assert!(config.database_path.exists());
        assert!(db.table_exists("t").unwrap());
        assert!(!db.table_exists("missing").unwrap());
    }
}
