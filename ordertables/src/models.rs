use crate::errors::StorageError;
use crate::mapping::EntityType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Legacy metadata into relational rows.
    Migrate,
    /// Relational rows back into legacy metadata.
    Backfill,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Migrate => "migrate",
            JobKind::Backfill => "backfill",
        }
    }
}

/// Identifies one durable job, e.g. `migrate:order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub kind: JobKind,
    pub entity_type: EntityType,
}

impl JobKey {
    pub fn new(kind: JobKind, entity_type: EntityType) -> Self {
        Self { kind, entity_type }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.entity_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "IDLE",
            JobState::Running => "RUNNING",
            JobState::Paused => "PAUSED",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    /// States from which `start` continues at the stored cursor.
    pub fn resumes(&self) -> bool {
        matches!(self, JobState::Running | JobState::Paused | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(JobState::Idle),
            "RUNNING" => Ok(JobState::Running),
            "PAUSED" => Ok(JobState::Paused),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            other => Err(StorageError::InvalidArg(format!("unknown job state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobCounters {
    pub attempted: u64,
    /// Entities written to the target representation.
    pub migrated: u64,
    /// Entities whose target data was already current.
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub key: JobKey,
    pub state: JobState,
    /// Last processed primary key; zero before the first batch.
    pub cursor: i64,
    pub batch_size: usize,
    pub counters: JobCounters,
    pub pause_requested: bool,
    pub task_id: Option<i64>,
    pub updated_at: Option<i64>,
}

impl JobStatus {
    pub fn idle(key: JobKey) -> Self {
        Self {
            key,
            state: JobState::Idle,
            cursor: 0,
            batch_size: 0,
            counters: JobCounters::default(),
            pause_requested: false,
            task_id: None,
            updated_at: None,
        }
    }
}

/// A per-entity failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub entity_id: i64,
    pub cause: String,
    pub recorded_at: i64, // Unix timestamp
}

#[derive(Debug)]
pub struct TaskLog {
    pub task_id: i64,
    pub task_name: String,
    pub start_time: i64, // Unix timestamp
    pub end_time: Option<i64>,
    pub status: String,
    pub details: String, // JSON string
}
