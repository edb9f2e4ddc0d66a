//! Job queue, progress cache, and pub/sub broker.
//!
//! The broker carries four concerns that all live in Redis in production:
//!
//! - the ingestion **job queue** (`LPUSH`/`BRPOP`, at-least-once),
//! - the per-document **progress snapshot** (`SETEX` with a one-hour TTL),
//! - the progress **broadcast channel** (`PUBLISH`/`SUBSCRIBE`),
//! - the **worker control** values (paused flag, desired concurrency)
//!   shared by every worker process and driven by the admin surface.
//!
//! Broker outages are transient: callers back off and retry rather than
//! failing documents.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::AsyncCommands;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{Job, ProgressEvent};

/// TTL of the per-document progress snapshot.
pub const PROGRESS_TTL_SECS: u64 = 3600;

const PAUSED_KEY: &str = "ragd:workers_paused";
const CONCURRENCY_KEY: &str = "ragd:workers_concurrency";

/// Shared worker control state, re-read between dequeues.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerControl {
    pub paused: bool,
    /// Desired in-flight documents per worker process; `None` falls back to
    /// the configured default.
    pub concurrency: Option<u32>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn push(&self, job: &Job) -> Result<(), ServiceError>;

    /// Pops the next job, waiting up to `timeout`. `Ok(None)` on timeout so
    /// the worker loop can observe shutdown and control changes.
    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<Job>, ServiceError>;

    async fn set_progress(&self, event: &ProgressEvent) -> Result<(), ServiceError>;

    async fn get_progress(&self, doc_id: Uuid) -> Result<Option<ProgressEvent>, ServiceError>;

    async fn publish(&self, event: &ProgressEvent) -> Result<(), ServiceError>;

    /// Subscribes to the broadcast channel. The stream ends when the broker
    /// connection drops; callers resubscribe with backoff.
    async fn subscribe(&self) -> Result<BoxStream<'static, ProgressEvent>, ServiceError>;

    async fn control(&self) -> Result<WorkerControl, ServiceError>;

    async fn set_paused(&self, paused: bool) -> Result<(), ServiceError>;

    async fn set_concurrency(&self, concurrency: u32) -> Result<(), ServiceError>;

    /// Drops all queued jobs (admin reset).
    async fn purge_queue(&self) -> Result<(), ServiceError>;

    async fn ping(&self) -> Result<(), ServiceError>;
}

/// Writes the snapshot and broadcasts in one go; the two are always
/// published together so late subscribers and live subscribers agree.
pub async fn publish_progress(
    broker: &dyn Broker,
    event: &ProgressEvent,
) -> Result<(), ServiceError> {
    broker.set_progress(event).await?;
    broker.publish(event).await
}

// ============ Redis implementation ============

pub struct RedisBroker {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
    queue_key: String,
    progress_channel: String,
}

fn redis_err(e: redis::RedisError) -> ServiceError {
    ServiceError::transient("redis", e.to_string())
}

impl RedisBroker {
    pub async fn connect(
        url: &str,
        queue_key: &str,
        progress_channel: &str,
    ) -> Result<Self, ServiceError> {
        let client = redis::Client::open(url).map_err(redis_err)?;
        let conn = client.get_connection_manager().await.map_err(redis_err)?;
        Ok(RedisBroker {
            client,
            conn,
            queue_key: queue_key.to_string(),
            progress_channel: progress_channel.to_string(),
        })
    }

    fn progress_key(doc_id: Uuid) -> String {
        format!("progress:{}", doc_id)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, job: &Job) -> Result<(), ServiceError> {
        let payload = serde_json::to_string(job)
            .map_err(|e| ServiceError::Internal(format!("encode job: {}", e)))?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.queue_key, payload)
            .await
            .map_err(redis_err)
    }

    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<Job>, ServiceError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .brpop(&self.queue_key, timeout.as_secs_f64())
            .await
            .map_err(redis_err)?;

        match popped {
            None => Ok(None),
            Some((_, raw)) => match serde_json::from_str::<Job>(&raw) {
                Ok(job) => Ok(Some(job)),
                Err(e) => {
                    // A bad payload is dropped, not retried: re-queueing it
                    // would wedge the queue forever.
                    tracing::error!(error = %e, raw = %raw.chars().take(300).collect::<String>(),
                        "invalid job payload, dropping");
                    Ok(None)
                }
            },
        }
    }

    async fn set_progress(&self, event: &ProgressEvent) -> Result<(), ServiceError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| ServiceError::Internal(format!("encode progress: {}", e)))?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::progress_key(event.doc_id), payload, PROGRESS_TTL_SECS)
            .await
            .map_err(redis_err)
    }

    async fn get_progress(&self, doc_id: Uuid) -> Result<Option<ProgressEvent>, ServiceError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::progress_key(doc_id))
            .await
            .map_err(redis_err)?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    async fn publish(&self, event: &ProgressEvent) -> Result<(), ServiceError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| ServiceError::Internal(format!("encode progress: {}", e)))?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(&self.progress_channel, payload)
            .await
            .map_err(redis_err)
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, ProgressEvent>, ServiceError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(redis_err)?;
        pubsub
            .subscribe(&self.progress_channel)
            .await
            .map_err(redis_err)?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let payload: String = msg.get_payload().ok()?;
                serde_json::from_str::<ProgressEvent>(&payload).ok()
            })
            .boxed();
        Ok(stream)
    }

    async fn control(&self) -> Result<WorkerControl, ServiceError> {
        let mut conn = self.conn.clone();
        let paused: Option<String> = conn.get(PAUSED_KEY).await.map_err(redis_err)?;
        let concurrency: Option<String> = conn.get(CONCURRENCY_KEY).await.map_err(redis_err)?;
        Ok(WorkerControl {
            paused: paused.map(|v| !v.is_empty()).unwrap_or(false),
            concurrency: concurrency.and_then(|v| v.trim().parse::<u32>().ok()),
        })
    }

    async fn set_paused(&self, paused: bool) -> Result<(), ServiceError> {
        let mut conn = self.conn.clone();
        if paused {
            conn.set::<_, _, ()>(PAUSED_KEY, chrono::Utc::now().to_rfc3339())
                .await
                .map_err(redis_err)
        } else {
            conn.del::<_, ()>(PAUSED_KEY).await.map_err(redis_err)
        }
    }

    async fn set_concurrency(&self, concurrency: u32) -> Result<(), ServiceError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(CONCURRENCY_KEY, concurrency.to_string())
            .await
            .map_err(redis_err)
    }

    async fn purge_queue(&self) -> Result<(), ServiceError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&self.queue_key).await.map_err(redis_err)
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}
