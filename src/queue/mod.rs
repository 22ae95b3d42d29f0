//! Delayed job queue: job records, handlers, and the consuming worker.

pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{DatabaseError, Error, JobError};

pub use worker::{JobWorker, WorkReport, spawn_job_worker};

/// Lifecycle of a queued job. Completed jobs are deleted, not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for its fire time.
    Pending,
    /// Leased by a worker.
    Running,
    /// Gave up after too many failures.
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "dead" => JobStatus::Dead,
            _ => JobStatus::Pending,
        }
    }
}

/// A job as stored in the queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub unique_key: Option<String>,
    pub payload: serde_json::Value,
    pub fire_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Decode the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| JobError::BadPayload {
            id: self.id,
            reason: e.to_string(),
        })
    }
}

/// A job to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub unique_key: Option<String>,
    pub payload: serde_json::Value,
    pub fire_at: DateTime<Utc>,
}

impl NewJob {
    /// Build a job from any serializable payload.
    pub fn new<T: Serialize>(
        name: impl Into<String>,
        payload: &T,
        fire_at: DateTime<Utc>,
    ) -> Result<Self, DatabaseError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            unique_key: None,
            payload,
            fire_at,
        })
    }

    /// Builder: make this job replace any queued job with the same key.
    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }
}

/// Consumer for one job name.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process a delivered job. Delivery is at-least-once, so handlers must
    /// tolerate seeing the same job twice. An error schedules a retry.
    async fn handle(&self, job: &Job) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, serde::Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn new_job_serializes_payload() {
        let job = NewJob::new("ping", &Ping { n: 3 }, Utc::now())
            .unwrap()
            .with_unique_key("ping:3");
        assert_eq!(job.payload, serde_json::json!({"n": 3}));
        assert_eq!(job.unique_key.as_deref(), Some("ping:3"));
    }

    #[test]
    fn decode_reports_bad_payload() {
        let job = Job {
            id: Uuid::new_v4(),
            name: "ping".into(),
            unique_key: None,
            payload: serde_json::json!({"n": "three"}),
            fire_at: Utc::now(),
            status: JobStatus::Running,
            attempts: 1,
            last_error: None,
            created_at: Utc::now(),
        };
        assert!(matches!(job.decode::<Ping>(), Err(JobError::BadPayload { .. })));
    }

    #[test]
    fn status_strings() {
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Dead] {
            assert_eq!(JobStatus::parse(status.as_str()), status);
        }
        assert_eq!(JobStatus::parse("garbage"), JobStatus::Pending);
    }
}
