use crate::db::Database;
use crate::errors::Result;
use crate::mapping::EntityType;
use crate::models::{FailureRecord, JobCounters, JobKey, JobState, JobStatus, TaskLog};
use rusqlite::{OptionalExtension, params};

/// Durable bookkeeping for migration and backfill runs.
pub struct Catalog {
    db: Database,
}

impl Catalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS migration_jobs (
                job TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                cursor INTEGER NOT NULL DEFAULT 0,
                batch_size INTEGER NOT NULL,
                attempted INTEGER NOT NULL DEFAULT 0,
                migrated INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                pause_requested INTEGER NOT NULL DEFAULT 0,
                task_id INTEGER,
                updated_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS migration_failures (
                job TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                cause TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (job, entity_id)
            );
            CREATE TABLE IF NOT EXISTS migrated_entities (
                entity_type TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                migrated_at INTEGER NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            );
            CREATE TABLE IF NOT EXISTS task_logs (
                task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                status TEXT,
                details TEXT
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn get_job(&self, key: JobKey) -> Result<Option<JobStatus>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT state, cursor, batch_size, attempted, migrated, skipped, failed, pause_requested, task_id, updated_at
             FROM migration_jobs WHERE job = ?1",
        )?;
        let mut rows = stmt.query(params![key.to_string()])?;

        if let Some(row) = rows.next()? {
            let state: String = row.get(0)?;
            Ok(Some(JobStatus {
                key,
                state: state.parse()?,
                cursor: row.get(1)?,
                batch_size: row.get::<_, i64>(2)? as usize,
                counters: JobCounters {
                    attempted: row.get::<_, i64>(3)? as u64,
                    migrated: row.get::<_, i64>(4)? as u64,
                    skipped: row.get::<_, i64>(5)? as u64,
                    failed: row.get::<_, i64>(6)? as u64,
                },
                pause_requested: row.get(7)?,
                task_id: row.get(8)?,
                updated_at: row.get(9)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Persists progress. The stored cursor never moves backwards here; use
    /// [`Catalog::reset_job`] to start a new pass. The pause flag is left alone
    /// so a request from another process is not lost.
    pub fn save_job(&self, status: &JobStatus) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO migration_jobs (job, state, cursor, batch_size, attempted, migrated, skipped, failed, task_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(job) DO UPDATE SET
                state = excluded.state,
                cursor = MAX(migration_jobs.cursor, excluded.cursor),
                batch_size = excluded.batch_size,
                attempted = excluded.attempted,
                migrated = excluded.migrated,
                skipped = excluded.skipped,
                failed = excluded.failed,
                task_id = excluded.task_id,
                updated_at = excluded.updated_at",
            params![
                status.key.to_string(),
                status.state.as_str(),
                status.cursor,
                status.batch_size as i64,
                status.counters.attempted as i64,
                status.counters.migrated as i64,
                status.counters.skipped as i64,
                status.counters.failed as i64,
                status.task_id,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Starts a fresh pass: cursor and counters back to zero, pause cleared.
    pub fn reset_job(&self, key: JobKey, state: JobState, batch_size: usize, task_id: Option<i64>) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO migration_jobs (job, state, cursor, batch_size, task_id, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?5)
             ON CONFLICT(job) DO UPDATE SET
                state = excluded.state,
                cursor = 0,
                batch_size = excluded.batch_size,
                attempted = 0,
                migrated = 0,
                skipped = 0,
                failed = 0,
                pause_requested = 0,
                task_id = excluded.task_id,
                updated_at = excluded.updated_at",
            params![
                key.to_string(),
                state.as_str(),
                batch_size as i64,
                task_id,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Asks a running job to stop at its next batch boundary.
    ///
    /// Returns false when the job is not running.
    pub fn request_pause(&self, key: JobKey) -> Result<bool> {
        let conn = self.db.lock()?;
        let updated = conn.execute(
            "UPDATE migration_jobs SET pause_requested = 1 WHERE job = ?1 AND state = ?2",
            params![key.to_string(), JobState::Running.as_str()],
        )?;
        Ok(updated > 0)
    }

    pub fn pause_requested(&self, key: JobKey) -> Result<bool> {
        let conn = self.db.lock()?;
        let flag = conn
            .query_row(
                "SELECT pause_requested FROM migration_jobs WHERE job = ?1",
                params![key.to_string()],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(false))
    }

    pub fn clear_pause(&self, key: JobKey) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE migration_jobs SET pause_requested = 0 WHERE job = ?1",
            params![key.to_string()],
        )?;
        Ok(())
    }

    pub fn record_failure(&self, key: JobKey, entity_id: i64, cause: &str) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO migration_failures (job, entity_id, cause, recorded_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job, entity_id) DO UPDATE SET
                cause = excluded.cause,
                recorded_at = excluded.recorded_at",
            params![key.to_string(), entity_id, cause, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn clear_failure(&self, key: JobKey, entity_id: i64) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "DELETE FROM migration_failures WHERE job = ?1 AND entity_id = ?2",
            params![key.to_string(), entity_id],
        )?;
        Ok(())
    }

    pub fn failures(&self, key: JobKey) -> Result<Vec<FailureRecord>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entity_id, cause, recorded_at FROM migration_failures WHERE job = ?1 ORDER BY entity_id",
        )?;
        let rows = stmt.query_map(params![key.to_string()], |row| {
            Ok(FailureRecord {
                entity_id: row.get(0)?,
                cause: row.get(1)?,
                recorded_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn mark_migrated(&self, entity_type: EntityType, entity_id: i64) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO migrated_entities (entity_type, entity_id, migrated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET migrated_at = excluded.migrated_at",
            params![entity_type.as_str(), entity_id, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn is_migrated(&self, entity_type: EntityType, entity_id: i64) -> Result<bool> {
        let conn = self.db.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM migrated_entities WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type.as_str(), entity_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn migrated_count(&self, entity_type: EntityType) -> Result<i64> {
        let conn = self.db.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM migrated_entities WHERE entity_type = ?1",
            params![entity_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn create_task_log(&self, task_name: &str) -> Result<i64> {
        let conn = self.db.lock()?;
        let start_time = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO task_logs (task_name, start_time, status) VALUES (?1, ?2, 'RUNNING')",
            params![task_name, start_time],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_task_log_status(&self, task_id: i64, status: &str, details: &str) -> Result<()> {
        let conn = self.db.lock()?;
        let end_time = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE task_logs SET status = ?1, details = ?2, end_time = ?3 WHERE task_id = ?4",
            params![status, details, end_time, task_id],
        )?;
        Ok(())
    }

    pub fn get_task_log(&self, task_id: i64) -> Result<Option<TaskLog>> {
        let conn = self.db.lock()?;
        let log = conn
            .query_row(
                "SELECT task_id, task_name, start_time, end_time, status, details FROM task_logs WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok(TaskLog {
                        task_id: row.get(0)?,
                        task_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        start_time: row.get(2)?,
                        end_time: row.get(3)?,
                        status: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        details: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobKind;

    fn setup() -> Catalog {
        let catalog = Catalog::new(Database::open_in_memory().unwrap());
        catalog.initialize_schema().unwrap();
        catalog
    }

    fn key() -> JobKey {
        JobKey::new(JobKind::Migrate, EntityType::Order)
    }

    #[test]
    fn test_job_state_crud() {
        let catalog = setup();
        assert!(catalog.get_job(key()).unwrap().is_none());

        catalog.reset_job(key(), JobState::Running, 10, Some(1)).unwrap();
        let mut status = catalog.get_job(key()).unwrap().unwrap();
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.cursor, 0);
        assert_eq!(status.batch_size, 10);

        status.cursor = 25;
        status.counters.attempted = 10;
        status.counters.migrated = 9;
        status.counters.failed = 1;
        catalog.save_job(&status).unwrap();

        let fetched = catalog.get_job(key()).unwrap().unwrap();
        assert_eq!(fetched.cursor, 25);
        assert_eq!(fetched.counters, status.counters);
        assert!(fetched.updated_at.is_some());
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let catalog = setup();
        catalog.reset_job(key(), JobState::Running, 5, None).unwrap();
        let mut status = catalog.get_job(key()).unwrap().unwrap();
        status.cursor = 40;
        catalog.save_job(&status).unwrap();
        status.cursor = 12;
        catalog.save_job(&status).unwrap();
        assert_eq!(catalog.get_job(key()).unwrap().unwrap().cursor, 40);

        catalog.reset_job(key(), JobState::Running, 5, None).unwrap();
        assert_eq!(catalog.get_job(key()).unwrap().unwrap().cursor, 0);
    }

    #[test]
    fn test_pause_only_applies_to_running_jobs() {
        let catalog = setup();
        assert!(!catalog.request_pause(key()).unwrap());

        catalog.reset_job(key(), JobState::Running, 5, None).unwrap();
        assert!(catalog.request_pause(key()).unwrap());
        assert!(catalog.pause_requested(key()).unwrap());

        // Progress saves must not swallow the request.
        let status = catalog.get_job(key()).unwrap().unwrap();
        catalog.save_job(&status).unwrap();
        assert!(catalog.pause_requested(key()).unwrap());

        catalog.clear_pause(key()).unwrap();
        assert!(!catalog.pause_requested(key()).unwrap());
    }

    #[test]
    fn test_failures_and_marks() {
        let catalog = setup();
        catalog.record_failure(key(), 7, "first").unwrap();
        catalog.record_failure(key(), 7, "second").unwrap();
        catalog.record_failure(key(), 3, "other").unwrap();
        let failures = catalog.failures(key()).unwrap();
        assert_eq!(failures.iter().map(|f| f.entity_id).collect::<Vec<_>>(), vec![3, 7]);
        assert_eq!(failures[1].cause, "second");

        catalog.clear_failure(key(), 7).unwrap();
        assert_eq!(catalog.failures(key()).unwrap().len(), 1);

        catalog.mark_migrated(EntityType::Order, 7).unwrap();
        catalog.mark_migrated(EntityType::Order, 7).unwrap();
        assert!(catalog.is_migrated(EntityType::Order, 7).unwrap());
        assert!(!catalog.is_migrated(EntityType::Refund, 7).unwrap());
        assert_eq!(catalog.migrated_count(EntityType::Order).unwrap(), 1);
    }

    #[test]
    fn test_task_log_crud() {
        let catalog = setup();

        let task_id = catalog.create_task_log("migrate:order").unwrap();
        assert_eq!(task_id, 1);

        catalog.update_task_log_status(task_id, "COMPLETED", "{}").unwrap();
        let log = catalog.get_task_log(task_id).unwrap().unwrap();
        assert_eq!(log.status, "COMPLETED");
        assert_eq!(log.task_name, "migrate:order");
        assert!(log.end_time.is_some());
    }
}
