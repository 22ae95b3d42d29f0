//! libSQL backend: implements the task store, key-value space and job queue.
//!
//! Uses libsql's native async API. Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::{Job, JobStatus, NewJob};
use crate::store::migrations;
use crate::store::traits::{JobQueue, KeyValueStore, TaskStore};
use crate::tasks::model::{DifficultyBucket, Task, TaskFilter, TaskOrder, TaskPatch};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Task timestamps are stored at second precision so that deadlines typed
/// by users compare equal to what was written.
fn ts_secs(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Fixed-width millisecond timestamps; lexical order matches time order.
fn ts_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn bool_value(b: bool) -> Value {
    Value::Integer(i64::from(b))
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

/// Build the `WHERE` body for a task filter, pushing its bind values.
fn filter_clause(filter: &TaskFilter, values: &mut Vec<Value>) -> String {
    let mut conditions = Vec::new();
    if let Some(chat_id) = filter.chat_id {
        conditions.push("chat_id = ?");
        values.push(Value::Integer(chat_id));
    }
    if let Some(description) = &filter.description {
        conditions.push("description = ?");
        values.push(Value::Text(description.clone()));
    }
    if let Some(deadline) = filter.deadline {
        conditions.push("deadline = ?");
        values.push(Value::Text(ts_secs(deadline)));
    }
    if conditions.is_empty() {
        "1 = 1".to_string()
    } else {
        conditions.join(" AND ")
    }
}

/// Map a libsql Row to a Task.
fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    let created_str: String = row.get(2)?;
    let deadline_str: Option<String> = row.get(3).ok();
    let completed: i64 = row.get(4)?;
    let reminder: i64 = row.get(5)?;
    let difficulty: Option<i64> = row.get(6).ok();

    Ok(Task {
        chat_id: row.get(0)?,
        description: row.get(1)?,
        created_at: parse_datetime(&created_str),
        deadline: parse_optional_datetime(&deadline_str),
        completed: completed != 0,
        reminder_enabled: reminder != 0,
        difficulty: difficulty.and_then(|d| u8::try_from(d).ok()),
    })
}

/// Map a libsql Row to a Job.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("row_to_job: {e}"));

    let id_str: String = row.get(0).map_err(read)?;
    let payload_str: String = row.get(3).map_err(read)?;
    let fire_str: String = row.get(4).map_err(read)?;
    let status_str: String = row.get(5).map_err(read)?;
    let attempts: i64 = row.get(6).map_err(read)?;
    let created_str: String = row.get(8).map_err(read)?;

    Ok(Job {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?,
        name: row.get(1).map_err(read)?,
        unique_key: row.get(2).ok(),
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| DatabaseError::Serialization(format!("job {id_str} payload: {e}")))?,
        fire_at: parse_datetime(&fire_str),
        status: JobStatus::parse(&status_str),
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_error: row.get(7).ok(),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementations ───────────────────────────────────────────

const TASK_COLUMNS: &str =
    "chat_id, description, created_at, deadline, completed, reminder_enabled, difficulty";

const JOB_COLUMNS: &str =
    "id, name, unique_key, payload, fire_at, status, attempts, last_error, created_at";

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn find_tasks(
        &self,
        filter: &TaskFilter,
        order: TaskOrder,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut values = Vec::new();
        let clause = filter_clause(filter, &mut values);
        let order_by = match order {
            TaskOrder::Natural => "id ASC",
            TaskOrder::DeadlineAsc => "deadline ASC, id ASC",
        };
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE {clause} ORDER BY {order_by}");

        let mut rows = self
            .conn()
            .query(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("find_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(
                row_to_task(&row).map_err(|e| DatabaseError::Query(format!("find_tasks: {e}")))?,
            );
        }
        Ok(tasks)
    }

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let difficulty = match task.difficulty {
            Some(d) => Value::Integer(i64::from(d)),
            None => Value::Null,
        };
        let deadline = task.deadline.map(ts_secs);

        self.conn()
            .execute(
                "INSERT INTO tasks (chat_id, description, created_at, deadline, completed, reminder_enabled, difficulty)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.chat_id,
                    task.description.as_str(),
                    ts_secs(task.created_at),
                    opt_text(deadline.as_deref()),
                    bool_value(task.completed),
                    bool_value(task.reminder_enabled),
                    difficulty,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::Constraint(format!(
                        "task {:?} already exists in chat {}",
                        task.description, task.chat_id
                    ))
                } else {
                    DatabaseError::Query(format!("insert_task: {e}"))
                }
            })?;

        debug!(chat_id = task.chat_id, description = %task.description, "Inserted task");
        Ok(())
    }

    async fn update_task(
        &self,
        filter: &TaskFilter,
        patch: &TaskPatch,
    ) -> Result<u64, DatabaseError> {
        if patch.is_empty() {
            return Ok(0);
        }

        let mut assignments = Vec::new();
        let mut unchanged = Vec::new();
        let mut set_values = Vec::new();
        let mut same_values = Vec::new();

        let mut push = |column: &str, value: Value| {
            assignments.push(format!("{column} = ?"));
            unchanged.push(format!("{column} IS ?"));
            set_values.push(value.clone());
            same_values.push(value);
        };
        if let Some(description) = &patch.description {
            push("description", Value::Text(description.clone()));
        }
        if let Some(deadline) = patch.deadline {
            push("deadline", Value::Text(ts_secs(deadline)));
        }
        if let Some(completed) = patch.completed {
            push("completed", bool_value(completed));
        }
        if let Some(enabled) = patch.reminder_enabled {
            push("reminder_enabled", bool_value(enabled));
        }

        let mut values = set_values;
        let clause = filter_clause(filter, &mut values);
        values.extend(same_values);

        // Only the first match is a candidate; it counts as modified only if
        // some patched column actually changes.
        let sql = format!(
            "UPDATE tasks SET {} WHERE id = (SELECT id FROM tasks WHERE {clause} ORDER BY id LIMIT 1) AND NOT ({})",
            assignments.join(", "),
            unchanged.join(" AND "),
        );

        self.conn()
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::Constraint(format!("update_task: {e}"))
                } else {
                    DatabaseError::Query(format!("update_task: {e}"))
                }
            })
    }

    async fn delete_task(&self, filter: &TaskFilter) -> Result<u64, DatabaseError> {
        let mut values = Vec::new();
        let clause = filter_clause(filter, &mut values);
        let sql = format!(
            "DELETE FROM tasks WHERE id = (SELECT id FROM tasks WHERE {clause} ORDER BY id LIMIT 1)"
        );

        self.conn()
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))
    }

    async fn difficulty_breakdown(
        &self,
        chat_id: i64,
    ) -> Result<Vec<DifficultyBucket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT difficulty, COUNT(*),
                        AVG(CASE WHEN deadline IS NOT NULL
                            THEN julianday(date(deadline)) - julianday(date(created_at)) END)
                 FROM tasks
                 WHERE chat_id = ?1 AND difficulty IS NOT NULL
                 GROUP BY difficulty
                 ORDER BY difficulty ASC",
                params![chat_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("difficulty_breakdown: {e}")))?;

        let mut buckets = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let difficulty: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("difficulty_breakdown: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("difficulty_breakdown: {e}")))?;
            let average = match row.get_value(2) {
                Ok(Value::Real(avg)) => Some(avg),
                Ok(Value::Integer(avg)) => Some(avg as f64),
                _ => None,
            };
            buckets.push(DifficultyBucket {
                difficulty: u8::try_from(difficulty).unwrap_or(0),
                count: u64::try_from(count).unwrap_or(0),
                average_deadline_days: average,
            });
        }
        Ok(buckets)
    }
}

#[async_trait]
impl KeyValueStore for LibSqlBackend {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        let expires_at = match ttl {
            Some(ttl) => {
                let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
                Value::Integer(now.timestamp_millis().saturating_add(ttl_ms))
            }
            None => Value::Null,
        };

        self.conn()
            .execute(
                "INSERT INTO kv (key, value, expires_at, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at",
                params![key, value, expires_at, ts_millis(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("kv set: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("kv get: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("kv get: {e}")))?
        else {
            return Ok(None);
        };

        let value: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("kv get: {e}")))?;
        let expires_at: Option<i64> = row.get(1).ok();

        match expires_at {
            Some(at) if at <= Utc::now().timestamp_millis() => {
                self.delete(key).await?;
                Ok(None)
            }
            _ => Ok(Some(value)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("kv delete: {e}")))?;
        Ok(count > 0)
    }

    async fn purge_expired(&self) -> Result<u64, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![Utc::now().timestamp_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("kv purge_expired: {e}")))?;
        if count > 0 {
            debug!(count, "Purged expired keys");
        }
        Ok(count)
    }
}

#[async_trait]
impl JobQueue for LibSqlBackend {
    async fn enqueue(&self, job: &NewJob) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = ts_millis(Utc::now());
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let Some(key) = job.unique_key.as_deref() else {
            self.conn()
                .execute(
                    "INSERT INTO jobs (id, name, unique_key, payload, fire_at, scheduled_for, status, attempts, created_at, updated_at)
                     VALUES (?1, ?2, NULL, ?3, ?4, ?4, 'pending', 0, ?5, ?5)",
                    params![id.to_string(), job.name.as_str(), payload, ts_millis(job.fire_at), now],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;
            return Ok(id);
        };

        // A keyed job replaces its predecessor only when its payload or
        // requested time changed. Retries move `fire_at` but not
        // `scheduled_for`, so re-enqueueing the same job keeps its backoff.
        self.conn()
            .execute(
                "INSERT INTO jobs (id, name, unique_key, payload, fire_at, scheduled_for, status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, 'pending', 0, ?6, ?6)
                 ON CONFLICT(unique_key) DO UPDATE SET
                    name = excluded.name,
                    payload = excluded.payload,
                    fire_at = excluded.fire_at,
                    scheduled_for = excluded.scheduled_for,
                    status = 'pending',
                    attempts = 0,
                    locked_until = NULL,
                    last_error = NULL,
                    updated_at = excluded.updated_at
                 WHERE jobs.payload <> excluded.payload
                    OR jobs.scheduled_for <> excluded.scheduled_for
                    OR jobs.status = 'dead'",
                params![
                    id.to_string(),
                    job.name.as_str(),
                    key,
                    payload,
                    ts_millis(job.fire_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        match self.find_by_key(key).await? {
            Some(stored) => Ok(stored.id),
            None => Err(DatabaseError::Query(format!(
                "enqueue: job {key} vanished after upsert"
            ))),
        }
    }

    async fn cancel(&self, unique_key: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM jobs WHERE unique_key = ?1", params![unique_key])
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel: {e}")))?;
        Ok(count > 0)
    }

    async fn find_by_key(&self, unique_key: &str) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE unique_key = ?1"),
                params![unique_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_key: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_key: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Job>, DatabaseError> {
        let now_str = ts_millis(now);
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(5));
        let locked_until = ts_millis(now + lease);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE (status = 'pending' AND fire_at <= ?1)
                        OR (status = 'running' AND locked_until <= ?1)
                     ORDER BY fire_at ASC
                     LIMIT ?2"
                ),
                params![now_str.as_str(), limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_due: {e}")))?;

        let mut candidates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            candidates.push(row_to_job(&row)?);
        }

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut job in candidates {
            // Guard on status and attempts so a concurrent replace or claim wins.
            let count = self
                .conn()
                .execute(
                    "UPDATE jobs SET status = 'running', attempts = attempts + 1,
                        locked_until = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = ?4 AND attempts = ?5",
                    params![
                        locked_until.as_str(),
                        now_str.as_str(),
                        job.id.to_string(),
                        job.status.as_str(),
                        i64::from(job.attempts),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_due: {e}")))?;
            if count == 1 {
                job.status = JobStatus::Running;
                job.attempts += 1;
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM jobs WHERE id = ?1 AND status = 'running'",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete: {e}")))?;
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let now = ts_millis(Utc::now());
        let result = match retry_at {
            Some(at) => {
                self.conn()
                    .execute(
                        "UPDATE jobs SET status = 'pending', fire_at = ?1, locked_until = NULL,
                            last_error = ?2, updated_at = ?3
                         WHERE id = ?4 AND status = 'running'",
                        params![ts_millis(at), error, now, id.to_string()],
                    )
                    .await
            }
            None => {
                self.conn()
                    .execute(
                        "UPDATE jobs SET status = 'dead', locked_until = NULL,
                            last_error = ?1, updated_at = ?2
                         WHERE id = ?3 AND status = 'running'",
                        params![error, now, id.to_string()],
                    )
                    .await
            }
        };
        result.map_err(|e| DatabaseError::Query(format!("fail: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    // ── Tasks ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_find_roundtrip() {
        let db = backend().await;
        let task = Task::new(7, "Write report")
            .with_difficulty(3)
            .with_deadline(at(2030, 1, 1, 9, 0));
        db.insert_task(&task).await.unwrap();

        let found = db
            .find_tasks(&TaskFilter::chat(7), TaskOrder::Natural)
            .await
            .unwrap();
        assert_eq!(found, vec![task]);
    }

    #[tokio::test]
    async fn duplicate_description_is_a_constraint_error() {
        let db = backend().await;
        db.insert_task(&Task::new(1, "A")).await.unwrap();
        let err = db.insert_task(&Task::new(1, "A")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        // Same description in another chat is fine.
        db.insert_task(&Task::new(2, "A")).await.unwrap();
    }

    #[tokio::test]
    async fn find_is_scoped_to_chat() {
        let db = backend().await;
        db.insert_task(&Task::new(1, "mine")).await.unwrap();
        db.insert_task(&Task::new(2, "theirs")).await.unwrap();

        let mine = db
            .find_tasks(&TaskFilter::chat(1), TaskOrder::Natural)
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].description, "mine");

        let all = db
            .find_tasks(&TaskFilter::all(), TaskOrder::Natural)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn deadline_order_puts_unset_first() {
        let db = backend().await;
        db.insert_task(&Task::new(1, "late").with_deadline(at(2030, 3, 1, 0, 0)))
            .await
            .unwrap();
        db.insert_task(&Task::new(1, "none")).await.unwrap();
        db.insert_task(&Task::new(1, "early").with_deadline(at(2030, 1, 1, 0, 0)))
            .await
            .unwrap();

        let ordered: Vec<String> = db
            .find_tasks(&TaskFilter::chat(1), TaskOrder::DeadlineAsc)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.description)
            .collect();
        assert_eq!(ordered, vec!["none", "early", "late"]);
    }

    #[tokio::test]
    async fn update_counts_only_real_changes() {
        let db = backend().await;
        db.insert_task(&Task::new(1, "A")).await.unwrap();
        let filter = TaskFilter::chat(1).description("A");

        let patch = TaskPatch::default().completed(true);
        assert_eq!(db.update_task(&filter, &patch).await.unwrap(), 1);
        assert_eq!(db.update_task(&filter, &patch).await.unwrap(), 0);

        let missing = TaskFilter::chat(1).description("B");
        assert_eq!(db.update_task(&missing, &patch).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_rename_onto_existing_is_constraint_error() {
        let db = backend().await;
        db.insert_task(&Task::new(1, "A")).await.unwrap();
        db.insert_task(&Task::new(1, "B")).await.unwrap();

        let err = db
            .update_task(
                &TaskFilter::chat(1).description("A"),
                &TaskPatch::default().description("B"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn delete_by_deadline_removes_first_match_only() {
        let db = backend().await;
        let deadline = at(2030, 1, 1, 9, 0);
        db.insert_task(&Task::new(1, "first").with_deadline(deadline))
            .await
            .unwrap();
        db.insert_task(&Task::new(1, "second").with_deadline(deadline))
            .await
            .unwrap();

        let filter = TaskFilter::chat(1).deadline(deadline);
        assert_eq!(db.delete_task(&filter).await.unwrap(), 1);

        let left = db
            .find_tasks(&TaskFilter::chat(1), TaskOrder::Natural)
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].description, "second");

        let other = TaskFilter::chat(1).deadline(at(2031, 1, 1, 9, 0));
        assert_eq!(db.delete_task(&other).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn difficulty_breakdown_groups_and_averages() {
        let db = backend().await;
        let created = at(2030, 1, 1, 23, 0);
        db.insert_task(
            &Task::new(1, "a")
                .with_created_at(created)
                .with_difficulty(2)
                .with_deadline(at(2030, 1, 3, 1, 0)),
        )
        .await
        .unwrap();
        db.insert_task(
            &Task::new(1, "b")
                .with_created_at(created)
                .with_difficulty(2)
                .with_deadline(at(2030, 1, 5, 0, 0)),
        )
        .await
        .unwrap();
        db.insert_task(&Task::new(1, "c").with_difficulty(5))
            .await
            .unwrap();
        db.insert_task(&Task::new(1, "no difficulty")).await.unwrap();
        db.insert_task(&Task::new(2, "other chat").with_difficulty(1))
            .await
            .unwrap();

        let buckets = db.difficulty_breakdown(1).await.unwrap();
        assert_eq!(buckets.len(), 2);

        assert_eq!(buckets[0].difficulty, 2);
        assert_eq!(buckets[0].count, 2);
        // Calendar-day spans: 2 and 4.
        assert_eq!(buckets[0].average_deadline_days, Some(3.0));

        assert_eq!(buckets[1].difficulty, 5);
        assert_eq!(buckets[1].count, 1);
        assert_eq!(buckets[1].average_deadline_days, None);
    }

    // ── Key-value ───────────────────────────────────────────────────

    #[tokio::test]
    async fn kv_set_get_delete() {
        let db = backend().await;
        db.set("k", "v1", None).await.unwrap();
        db.set("k", "v2", None).await.unwrap();
        assert_eq!(db.get("k").await.unwrap().as_deref(), Some("v2"));

        assert!(db.delete("k").await.unwrap());
        assert!(!db.delete("k").await.unwrap());
        assert!(db.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kv_expired_key_reads_absent() {
        let db = backend().await;
        db.set("gone", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        db.set("kept", "v", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(db.get("gone").await.unwrap().is_none());
        assert_eq!(db.get("kept").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn kv_purge_expired() {
        let db = backend().await;
        db.set("a", "v", Some(Duration::from_millis(10))).await.unwrap();
        db.set("b", "v", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(db.purge_expired().await.unwrap(), 1);
        assert_eq!(db.get("b").await.unwrap().as_deref(), Some("v"));
    }

    // ── Jobs ────────────────────────────────────────────────────────

    fn job(key: &str, n: u32, fire_at: DateTime<Utc>) -> NewJob {
        NewJob::new("test", &serde_json::json!({ "n": n }), fire_at)
            .unwrap()
            .with_unique_key(key)
    }

    #[tokio::test]
    async fn keyed_enqueue_replaces_in_place() {
        let db = backend().await;
        let t = at(2030, 1, 1, 9, 0);

        let first = db.enqueue(&job("k", 1, t)).await.unwrap();
        let second = db.enqueue(&job("k", 2, t + chrono::Duration::hours(1))).await.unwrap();
        assert_eq!(first, second);

        let stored = db.find_by_key("k").await.unwrap().unwrap();
        assert_eq!(stored.payload, serde_json::json!({ "n": 2 }));
        assert_eq!(stored.fire_at, t + chrono::Duration::hours(1));
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn unchanged_enqueue_keeps_attempts() {
        let db = backend().await;
        let t = at(2030, 1, 1, 9, 0);
        db.enqueue(&job("k", 1, t)).await.unwrap();

        let claimed = db.claim_due(t, 10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        db.fail(claimed[0].id, "flaky", Some(t + chrono::Duration::minutes(1)))
            .await
            .unwrap();

        // Same payload and requested time: the retry schedule survives.
        db.enqueue(&job("k", 1, t)).await.unwrap();
        let stored = db.find_by_key("k").await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.fire_at, t + chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn claim_leases_and_bumps_attempts() {
        let db = backend().await;
        let t = at(2030, 1, 1, 9, 0);
        db.enqueue(&job("k", 1, t)).await.unwrap();

        assert!(db
            .claim_due(t - chrono::Duration::seconds(1), 10, Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());

        let claimed = db.claim_due(t, 10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].status, JobStatus::Running);

        // Leased: invisible until the lease runs out.
        assert!(db.claim_due(t, 10, Duration::from_secs(60)).await.unwrap().is_empty());
        let reclaimed = db
            .claim_due(t + chrono::Duration::minutes(2), 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[tokio::test]
    async fn complete_leaves_a_replaced_job() {
        let db = backend().await;
        let t = at(2030, 1, 1, 9, 0);
        db.enqueue(&job("k", 1, t)).await.unwrap();
        let claimed = db.claim_due(t, 10, Duration::from_secs(60)).await.unwrap();

        db.enqueue(&job("k", 2, t + chrono::Duration::days(1))).await.unwrap();
        db.complete(claimed[0].id).await.unwrap();

        let stored = db.find_by_key("k").await.unwrap().unwrap();
        assert_eq!(stored.payload, serde_json::json!({ "n": 2 }));
    }

    #[tokio::test]
    async fn cancel_removes_job() {
        let db = backend().await;
        db.enqueue(&job("k", 1, at(2030, 1, 1, 9, 0))).await.unwrap();
        assert!(db.cancel("k").await.unwrap());
        assert!(!db.cancel("k").await.unwrap());
        assert!(db.find_by_key("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_job_is_revived_by_enqueue() {
        let db = backend().await;
        let t = at(2030, 1, 1, 9, 0);
        db.enqueue(&job("k", 1, t)).await.unwrap();
        let claimed = db.claim_due(t, 10, Duration::from_secs(60)).await.unwrap();
        db.fail(claimed[0].id, "fatal", None).await.unwrap();
        assert_eq!(
            db.find_by_key("k").await.unwrap().unwrap().status,
            JobStatus::Dead
        );

        db.enqueue(&job("k", 1, t)).await.unwrap();
        let stored = db.find_by_key("k").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert!(stored.last_error.is_none());
    }
}
