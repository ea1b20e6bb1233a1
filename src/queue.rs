//! Delivery queue.
//!
//! The listener hands each envelope to a [`JobQueue`] under a job type; some
//! runner later invokes the matching job with the stored argument. Two
//! backends ship with the crate:
//!
//! - [`MemoryJobQueue`]: in-process FIFO, drained explicitly
//! - [`RedisJobQueue`]: a Redis stream consumed by the `relay-worker` binary
//!   through a consumer group, so queued jobs survive restarts

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, Value as RedisValue};
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Redis stream holding queued jobs
pub const JOB_STREAM_NAME: &str = "webhook_rabbitmq:jobs";

/// Errors raised while queueing a job.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A job waiting to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Identifier of the job to invoke
    #[serde(rename = "jobType")]
    pub job_type: String,

    /// Argument handed to the job
    pub argument: Value,
}

impl QueuedJob {
    /// Rebuild a job from the fields of a stream entry written by [`RedisJobQueue`].
    pub fn from_stream_fields(map: &HashMap<String, RedisValue>) -> Option<Self> {
        let job_type = str_field(map, "jobType")?;
        let argument = str_field(map, "argument")?;

        let argument = match serde_json::from_str(&argument) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, job_type = %job_type, "Failed to parse job argument");
                return None;
            }
        };

        Some(Self { job_type, argument })
    }
}

fn str_field(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    map.get(key).and_then(redis_string)
}

fn redis_string(val: &RedisValue) -> Option<String> {
    match val {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Stream entry id with its field map.
pub type StreamEntry = (String, HashMap<String, RedisValue>);

/// One page of an `XAUTOCLAIM` reply.
#[derive(Debug, Clone, Default)]
pub struct ClaimedPage {
    /// Cursor for the next call; `0-0` once the pending list is exhausted
    pub next_id: String,
    pub entries: Vec<StreamEntry>,
}

/// Parse an `XAUTOCLAIM` reply.
///
/// Redis 6.2 answers `[next-id, entries]`; 7.0 appends the ids of entries
/// deleted from the stream. Entries whose fields are gone come back with an
/// empty field map. Returns `None` for anything else.
pub fn parse_autoclaim_reply(reply: &RedisValue) -> Option<ClaimedPage> {
    let RedisValue::Array(parts) = reply else {
        return None;
    };
    let next_id = redis_string(parts.first()?)?;
    let RedisValue::Array(entries) = parts.get(1)? else {
        return None;
    };

    Some(ClaimedPage {
        next_id,
        entries: entries.iter().filter_map(parse_stream_entry).collect(),
    })
}

fn parse_stream_entry(entry: &RedisValue) -> Option<StreamEntry> {
    let RedisValue::Array(pair) = entry else {
        return None;
    };
    let id = redis_string(pair.first()?)?;

    let fields = match pair.get(1) {
        Some(RedisValue::Array(flat)) => flat
            .chunks(2)
            .filter_map(|kv| match kv {
                [k, v] => Some((redis_string(k)?, v.clone())),
                _ => None,
            })
            .collect(),
        Some(RedisValue::Map(pairs)) => pairs
            .iter()
            .filter_map(|(k, v)| Some((redis_string(k)?, v.clone())))
            .collect(),
        _ => HashMap::new(),
    };

    Some((id, fields))
}

/// Queue for deferred jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a job for later, asynchronous execution.
    async fn add(&self, job_type: &str, argument: Value) -> Result<(), QueueError>;
}

/// In-process job queue.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<VecDeque<QueuedJob>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting.
    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every queued job, oldest first.
    pub fn drain(&self) -> Vec<QueuedJob> {
        match self.jobs.lock() {
            Ok(mut jobs) => jobs.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn add(&self, job_type: &str, argument: Value) -> Result<(), QueueError> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        jobs.push_back(QueuedJob {
            job_type: job_type.to_string(),
            argument,
        });
        Ok(())
    }
}

/// Job queue backed by a Redis stream.
#[derive(Clone)]
pub struct RedisJobQueue {
    pool: Pool,
    stream: String,
}

impl RedisJobQueue {
    pub fn new(pool: Pool) -> Self {
        Self::with_stream(pool, JOB_STREAM_NAME)
    }

    pub fn with_stream(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn add(&self, job_type: &str, argument: Value) -> Result<(), QueueError> {
        let argument = serde_json::to_string(&argument)?;

        let mut conn = self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for job queue");
            QueueError::Connection(e.to_string())
        })?;

        let id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("jobType")
            .arg(job_type)
            .arg("argument")
            .arg(&argument)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        debug!(id = %id, stream = %self.stream, job_type = %job_type, "Job queued");
        Ok(())
    }
}
