//! Deployment Job Queue
//!
//! Redis-backed FIFO of deployment intents plus the per-project exclusion
//! locks and the counters surfaced on the admin stats endpoint. Layout:
//! - list `deployment:queue`: JSON job payloads, RPUSH in, BLPOP out
//! - string `deployment:lock:<project_id>`: SET NX EX, value = acquisition
//!   unix timestamp, 30 minute TTL
//! - hash `deployment:stats`: lifetime counters
//!
//! FIFO holds across the whole queue; per-project serialization comes from
//! the lock, not from ordering.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::warn;

const QUEUE_KEY: &str = "deployment:queue";
const LOCK_KEY_PREFIX: &str = "deployment:lock";
const STATS_KEY: &str = "deployment:stats";

pub const COUNTER_ENQUEUED: &str = "total_enqueued";
pub const COUNTER_PROCESSED: &str = "total_processed";
pub const COUNTER_COMPLETED: &str = "completed";
pub const COUNTER_FAILED_LOCK: &str = "failed_lock";
pub const COUNTER_SKIPPED_LOCKED: &str = "skipped_locked";
pub const COUNTER_FAILED_NOT_FOUND: &str = "failed_not_found";
pub const COUNTER_FAILED_DEPLOYMENT: &str = "failed_deployment";

#[derive(Debug)]
pub enum QueueError {
    Redis(redis::RedisError),
    Payload(serde_json::Error),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Redis(err) => write!(f, "Queue store error: {}", err),
            QueueError::Payload(err) => write!(f, "Invalid job payload: {}", err),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Redis(err) => Some(err),
            QueueError::Payload(err) => Some(err),
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Redis(err)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Payload(err)
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Deploy,
    Redeploy,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Deploy => write!(f, "deploy"),
            JobKind::Redeploy => write!(f, "redeploy"),
        }
    }
}

/// One deployment intent. Transient: created on enqueue, gone once popped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentJob {
    pub project_id: i64,
    pub user_id: i64,
    pub kind: JobKind,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct JobQueue {
    client: redis::Client,
    conn: ConnectionManager,
}

impl JobQueue {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }

    /// Append a job and return its 1-based queue position.
    pub async fn enqueue(&self, project_id: i64, user_id: i64, kind: JobKind) -> Result<i64> {
        let job = DeploymentJob {
            project_id,
            user_id,
            kind,
            enqueued_at: Utc::now(),
            started_at: None,
        };
        let payload = serde_json::to_string(&job)?;

        let mut conn = self.conn.clone();
        let position: i64 = conn.rpush(QUEUE_KEY, payload).await?;
        self.bump(COUNTER_ENQUEUED).await;
        Ok(position)
    }

    /// Blocking pop with a timeout. Runs on a dedicated connection: BLPOP
    /// parks the connection it runs on, and the shared multiplexed one must
    /// stay free for enqueues and lock traffic.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<DeploymentJob>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(QUEUE_KEY)
            .arg(timeout.as_secs())
            .query_async(&mut conn)
            .await?;

        let Some((_, payload)) = reply else {
            return Ok(None);
        };

        let mut job: DeploymentJob = serde_json::from_str(&payload)?;
        job.started_at = Some(Utc::now());
        self.bump(COUNTER_PROCESSED).await;
        Ok(Some(job))
    }

    pub async fn len(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(QUEUE_KEY).await?;
        Ok(len)
    }

    /// Try to take the per-project exclusion lock. Returns false when
    /// another worker already holds it.
    pub async fn acquire_lock(&self, project_id: i64, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(lock_key(project_id))
            .arg(Utc::now().timestamp())
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    pub async fn release_lock(&self, project_id: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(lock_key(project_id)).await?;
        Ok(())
    }

    /// Increment a lifetime counter. Best-effort: stats must never fail a
    /// deployment.
    pub async fn bump(&self, counter: &str) {
        let mut conn = self.conn.clone();
        if let Err(err) = conn.hincr::<_, _, _, i64>(STATS_KEY, counter, 1).await {
            warn!(counter, %err, "Failed to bump queue counter");
        }
    }

    /// All counters plus the live queue length.
    pub async fn stats(&self) -> Result<HashMap<String, i64>> {
        let mut conn = self.conn.clone();
        let mut stats: HashMap<String, i64> = conn.hgetall(STATS_KEY).await?;
        stats.insert("queue_length".to_string(), self.len().await?);
        Ok(stats)
    }
}

fn lock_key(project_id: i64) -> String {
    format!("{}:{}", LOCK_KEY_PREFIX, project_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_payload_shape_is_stable() {
        let job = DeploymentJob {
            project_id: 42,
            user_id: 7,
            kind: JobKind::Redeploy,
            enqueued_at: Utc::now(),
            started_at: None,
        };

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&job).unwrap()).unwrap();
        assert_eq!(value["project_id"], 42);
        assert_eq!(value["user_id"], 7);
        assert_eq!(value["kind"], "redeploy");
        assert!(value.get("started_at").is_none());

        let parsed: DeploymentJob = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.kind, JobKind::Redeploy);
        assert_eq!(parsed.project_id, 42);
    }

    #[test]
    fn lock_keys_are_per_project() {
        assert_eq!(lock_key(9), "deployment:lock:9");
        assert_ne!(lock_key(1), lock_key(2));
    }
}
