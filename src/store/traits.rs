//! Storage traits: task collection, TTL key-value space, and delayed job queue.
//!
//! `LibSqlBackend` implements all three against one database; the traits
//! exist so the session manager, task operations and scanner only see the
//! slice of storage they need.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::{Job, NewJob};
use crate::tasks::model::{DifficultyBucket, Task, TaskFilter, TaskOrder, TaskPatch};

/// Document-style task collection.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All tasks matching `filter`, in the requested order.
    async fn find_tasks(
        &self,
        filter: &TaskFilter,
        order: TaskOrder,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Insert a task. A duplicate `(chat_id, description)` fails with
    /// `DatabaseError::Constraint`.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Apply `patch` to the first task matching `filter`.
    ///
    /// Returns the number of tasks actually modified: a match that already
    /// holds every patched value counts as zero.
    async fn update_task(&self, filter: &TaskFilter, patch: &TaskPatch)
    -> Result<u64, DatabaseError>;

    /// Delete the first task matching `filter`. Returns the number deleted.
    async fn delete_task(&self, filter: &TaskFilter) -> Result<u64, DatabaseError>;

    /// Group a chat's tasks by difficulty, ascending. Tasks without a
    /// difficulty are skipped.
    async fn difficulty_breakdown(
        &self,
        chat_id: i64,
    ) -> Result<Vec<DifficultyBucket>, DatabaseError>;
}

/// String key-value space with optional per-key expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> Result<(), DatabaseError>;

    /// Read a value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, DatabaseError>;

    /// Drop every expired key. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64, DatabaseError>;
}

/// Persistent delayed job queue with at-least-once delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. When `unique_key` is set and a job with that key is
    /// still queued, it is replaced (new payload, new fire time, attempts
    /// reset) unless both are unchanged. Returns the job id.
    async fn enqueue(&self, job: &NewJob) -> Result<Uuid, DatabaseError>;

    /// Remove the queued job carrying `unique_key`. Returns whether one existed.
    async fn cancel(&self, unique_key: &str) -> Result<bool, DatabaseError>;

    /// Look up the queued job carrying `unique_key`.
    async fn find_by_key(&self, unique_key: &str) -> Result<Option<Job>, DatabaseError>;

    /// Lease up to `limit` jobs due at `now` (including jobs whose previous
    /// lease ran out). Each claimed job has its attempt counter bumped.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Acknowledge a claimed job. A job that was replaced after being
    /// claimed is left queued.
    async fn complete(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Record a failure. `retry_at = None` dead-letters the job.
    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;
}
