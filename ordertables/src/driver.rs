//! Resumable batch driver shared by migration and backfill.
//!
//! Progress lives in the catalog, so a run can be paused from another
//! process, survive a crash, and pick up at the first unprocessed key.

use crate::catalog::Catalog;
use crate::errors::{Result, StorageError};
use crate::models::{FailureRecord, JobKey, JobState, JobStatus};
use std::sync::Arc;

/// What happened to one entity in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The target representation was written.
    Migrated,
    /// The target representation already held the same data.
    Skipped,
}

/// One direction of copying entities between representations.
pub trait BatchWork: Send + Sync {
    fn key(&self) -> JobKey;

    /// Checks that both representations are usable. Runs before every batch,
    /// so a store that disappears mid-run fails the job at the next boundary.
    fn preflight(&self) -> Result<()>;

    /// Source IDs strictly above `cursor`, ascending, at most `limit`.
    fn next_ids(&self, cursor: i64, limit: usize) -> Result<Vec<i64>>;

    fn process(&self, id: i64) -> Result<ItemOutcome>;
}

pub struct Driver<W> {
    work: W,
    catalog: Arc<Catalog>,
}

impl<W: BatchWork> Driver<W> {
    pub fn new(work: W, catalog: Arc<Catalog>) -> Self {
        Self { work, catalog }
    }

    pub fn key(&self) -> JobKey {
        self.work.key()
    }

    pub fn work(&self) -> &W {
        &self.work
    }

    pub fn status(&self) -> Result<JobStatus> {
        let key = self.key();
        Ok(self.catalog.get_job(key)?.unwrap_or_else(|| JobStatus::idle(key)))
    }

    /// Requests a stop at the next batch boundary. Returns false when the job
    /// is not running.
    pub fn pause(&self) -> Result<bool> {
        let requested = self.catalog.request_pause(self.key())?;
        if requested {
            log::info!("{}: pause requested", self.key());
        }
        Ok(requested)
    }

    pub fn failures(&self) -> Result<Vec<FailureRecord>> {
        self.catalog.failures(self.key())
    }

    /// Runs until the source is exhausted, a pause is requested, or a fatal
    /// error occurs.
    pub fn start(&self, batch_size: usize) -> Result<JobStatus> {
        self.run_batches(batch_size, None)
    }

    /// Like [`Driver::start`], but returns after `max_batches` batches with
    /// the job still `Running`, exactly as an interrupted process leaves it.
    pub fn run_batches(&self, batch_size: usize, max_batches: Option<usize>) -> Result<JobStatus> {
        if batch_size == 0 {
            return Err(StorageError::InvalidArg("batch size must be at least 1".to_string()));
        }
        let key = self.key();
        let mut status = self.begin(batch_size)?;
        let mut batches = 0usize;

        loop {
            if self.catalog.pause_requested(key)? {
                status.state = JobState::Paused;
                self.catalog.save_job(&status)?;
                self.catalog.clear_pause(key)?;
                self.finish_task(&status, "PAUSED")?;
                log::info!("{}: paused at cursor {}", key, status.cursor);
                return Ok(status);
            }
            if max_batches.is_some_and(|max| batches >= max) {
                self.catalog.save_job(&status)?;
                self.finish_task(&status, "STOPPED")?;
                log::info!("{}: stopped after {} batches at cursor {}", key, batches, status.cursor);
                return Ok(status);
            }

            if let Err(err) = self.work.preflight() {
                return self.fail(status, err);
            }
            let ids = match self.work.next_ids(status.cursor, batch_size) {
                Ok(ids) => ids,
                Err(err) if err.is_fatal() => return self.fail(status, err),
                Err(err) => return Err(err),
            };
            if ids.is_empty() {
                status.state = JobState::Completed;
                self.catalog.save_job(&status)?;
                self.finish_task(&status, "COMPLETED")?;
                let c = status.counters;
                log::info!(
                    "{}: completed ({} attempted, {} migrated, {} skipped, {} failed)",
                    key,
                    c.attempted,
                    c.migrated,
                    c.skipped,
                    c.failed
                );
                if c.failed > 0 {
                    log::warn!("{}: {} entities failed; see the failure list", key, c.failed);
                }
                return Ok(status);
            }

            for id in ids {
                status.counters.attempted += 1;
                match self.work.process(id) {
                    Ok(outcome) => {
                        match outcome {
                            ItemOutcome::Migrated => status.counters.migrated += 1,
                            ItemOutcome::Skipped => status.counters.skipped += 1,
                        }
                        self.catalog.clear_failure(key, id)?;
                    }
                    Err(err) if err.is_fatal() => return self.fail(status, err),
                    Err(err) => {
                        log::warn!("{}: entity {} failed: {}", key, id, err);
                        status.counters.failed += 1;
                        self.catalog.record_failure(key, id, &err.to_string())?;
                    }
                }
                status.cursor = id;
            }

            self.catalog.save_job(&status)?;
            batches += 1;
            log::info!(
                "{}: batch {} done, cursor at {} ({} attempted so far)",
                key,
                batches,
                status.cursor,
                status.counters.attempted
            );
        }
    }

    /// Moves the job to `Running`, either resuming the stored pass or starting
    /// a fresh one.
    fn begin(&self, batch_size: usize) -> Result<JobStatus> {
        let key = self.key();
        let previous = self.status()?;
        let task_id = self.catalog.create_task_log(&key.to_string())?;

        if previous.state.resumes() {
            let mut status = previous;
            log::info!("{}: resuming from cursor {} ({})", key, status.cursor, status.state);
            status.state = JobState::Running;
            status.batch_size = batch_size;
            status.task_id = Some(task_id);
            status.pause_requested = false;
            self.catalog.save_job(&status)?;
            self.catalog.clear_pause(key)?;
            Ok(status)
        } else {
            log::info!("{}: starting a new pass with batch size {}", key, batch_size);
            self.catalog.reset_job(key, JobState::Running, batch_size, Some(task_id))?;
            self.status()
        }
    }

    fn fail(&self, mut status: JobStatus, err: StorageError) -> Result<JobStatus> {
        log::error!("{}: failed at cursor {}: {}", status.key, status.cursor, err);
        status.state = JobState::Failed;
        self.catalog.save_job(&status)?;
        if let Some(task_id) = status.task_id {
            let details = serde_json::json!({ "counters": status.counters, "error": err.to_string() });
            self.catalog.update_task_log_status(task_id, "FAILED", &details.to_string())?;
        }
        Err(err)
    }

    fn finish_task(&self, status: &JobStatus, outcome: &str) -> Result<()> {
        if let Some(task_id) = status.task_id {
            let details = serde_json::json!({ "cursor": status.cursor, "counters": status.counters });
            self.catalog.update_task_log_status(task_id, outcome, &details.to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::mapping::EntityType;
    use crate::models::JobKind;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// Copies numbers out of a fixed source, failing on configured IDs.
    struct Numbers {
        source: Vec<i64>,
        failing: BTreeSet<i64>,
        fatal_at: Option<i64>,
        seen: Mutex<Vec<i64>>,
    }

    impl Numbers {
        fn new(source: impl IntoIterator<Item = i64>) -> Self {
            Self {
                source: source.into_iter().collect(),
                failing: BTreeSet::new(),
                fatal_at: None,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl BatchWork for Numbers {
        fn key(&self) -> JobKey {
            JobKey::new(JobKind::Migrate, EntityType::Order)
        }

        fn preflight(&self) -> Result<()> {
            Ok(())
        }

        fn next_ids(&self, cursor: i64, limit: usize) -> Result<Vec<i64>> {
            Ok(self.source.iter().copied().filter(|id| *id > cursor).take(limit).collect())
        }

        fn process(&self, id: i64) -> Result<ItemOutcome> {
            if self.fatal_at == Some(id) {
                return Err(StorageError::StoreUnavailable("gone".to_string()));
            }
            if self.failing.contains(&id) {
                return Err(StorageError::NotFound(format!("entity {id}")));
            }
            self.seen.lock().unwrap().push(id);
            Ok(if id % 2 == 0 { ItemOutcome::Skipped } else { ItemOutcome::Migrated })
        }
    }

    fn driver(work: Numbers) -> Driver<Numbers> {
        let catalog = Catalog::new(Database::open_in_memory().unwrap());
        catalog.initialize_schema().unwrap();
        Driver::new(work, Arc::new(catalog))
    }

    #[test]
    fn rejects_zero_batch_size() {
        let driver = driver(Numbers::new(1..=3));
        assert!(matches!(driver.start(0), Err(StorageError::InvalidArg(_))));
        assert_eq!(driver.status().unwrap().state, JobState::Idle);
    }

    #[test]
    fn runs_to_completion_with_counters() {
        let driver = driver(Numbers::new(1..=5));
        let status = driver.start(2).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.cursor, 5);
        assert_eq!(status.counters.attempted, 5);
        assert_eq!(status.counters.migrated, 3);
        assert_eq!(status.counters.skipped, 2);

        let stored = driver.status().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.counters, status.counters);
        let log = driver.catalog.get_task_log(stored.task_id.unwrap()).unwrap().unwrap();
        assert_eq!(log.status, "COMPLETED");
    }

    #[test]
    fn interrupted_run_resumes_at_cursor() {
        let driver = driver(Numbers::new(1..=7));
        let status = driver.run_batches(3, Some(1)).unwrap();
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.cursor, 3);

        let status = driver.start(3).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.counters.attempted, 7);
        assert_eq!(*driver.work().seen.lock().unwrap(), (1..=7).collect::<Vec<_>>());
    }

    #[test]
    fn per_entity_failures_do_not_abort() {
        let mut work = Numbers::new(1..=4);
        work.failing.insert(2);
        let driver = driver(work);
        let status = driver.start(10).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.counters.failed, 1);
        assert_eq!(status.counters.attempted, 4);
        let failures = driver.failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].entity_id, 2);
    }

    #[test]
    fn fatal_errors_fail_the_job() {
        let mut work = Numbers::new(1..=4);
        work.fatal_at = Some(3);
        let driver = driver(work);
        let err = driver.start(10).unwrap_err();
        assert!(matches!(err, StorageError::StoreUnavailable(_)));
        let status = driver.status().unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.cursor, 2);
    }

    #[test]
    fn pause_only_while_running() {
        let driver = driver(Numbers::new(1..=2));
        assert!(!driver.pause().unwrap());
        driver.start(1).unwrap();
        assert!(!driver.pause().unwrap());
    }
}
