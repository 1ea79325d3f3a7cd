//! The durable work queue (§4.1): a Redis Streams consumer group for
//! `PageWorkItem`s, a score-ordered delayed set for backoff retries, a
//! dead-letter stream, a cancellation set and an idempotency keyset.
//!
//! Grounded on the pack's Redis Streams job-queue shape: consumer-group
//! creation via `XGROUP CREATE ... MKSTREAM` (ignoring `BUSYGROUP`), delivery
//! via `XREADGROUP ... STREAMS <key> >`, acknowledgement via `XACK`, and
//! crash recovery via `XPENDING`/`XCLAIM`. The delayed-retry set and the
//! idempotency keyset reuse the same `redis` crate primitives (`ZADD`/
//! `ZRANGEBYSCORE`/`ZREM`, `SET NX EX`) that pack examples use for scheduled
//! jobs and request deduplication.

pub mod delayed_mover;
pub mod types;

pub use types::{PageResult, PageSource, PageWorkItem};

use crate::error::ServiceError;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const STREAM_KEY: &str = "jobs:ai:pages";
pub const CONSUMER_GROUP: &str = "workers:images";
pub const DELAYED_KEY: &str = "jobs:ai:pages:delayed";
pub const DLQ_KEY: &str = "jobs:ai:pages:dlq";
pub const CANCELLED_SET_KEY: &str = "jobs:cancelled:set";

fn idem_key(key: &str) -> String {
    format!("idem:done:{key}")
}

/// Queue depths, for `GET /health` and `GET /metrics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDepths {
    pub stream_len: u64,
    pub delayed_len: u64,
    pub dlq_len: u64,
}

/// A dequeued message: the stream-assigned id plus the deserialized payload.
/// The id is opaque and round-trips through `Ack`/`EnqueueDLQ`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub msg_id: String,
    pub payload: PageWorkItem,
}

/// The queue contract of §4.1, as an async trait so tests can substitute an
/// in-memory implementation without a live Redis instance.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, payload: &PageWorkItem) -> Result<String, ServiceError>;
    async fn enqueue_delayed(&self, payload: &PageWorkItem, execute_at: SystemTime) -> Result<(), ServiceError>;
    async fn dequeue(&self, consumer_id: &str, block: Duration) -> Result<Option<Delivery>, ServiceError>;
    async fn ack(&self, msg_id: &str) -> Result<(), ServiceError>;
    async fn enqueue_dlq(&self, payload: &PageWorkItem, reason: &str) -> Result<(), ServiceError>;
    async fn cancel(&self, job_id: &str) -> Result<(), ServiceError>;
    async fn is_cancelled(&self, job_id: &str) -> Result<bool, ServiceError>;
    async fn is_idem_done(&self, key: &str) -> Result<bool, ServiceError>;
    async fn mark_idem_done(&self, key: &str, ttl: Duration) -> Result<(), ServiceError>;
    async fn ping(&self) -> Result<(), ServiceError>;
    async fn depths(&self) -> Result<QueueDepths, ServiceError>;
    /// Move due entries from the delayed set to the main stream. Returns the
    /// number moved. Called by the delayed mover on every tick (§4.1).
    async fn move_due_delayed(&self, limit: usize) -> Result<usize, ServiceError>;
}

/// Redis-backed implementation of [`Queue`].
pub struct RedisQueue {
    client: redis::Client,
}

impl RedisQueue {
    pub fn new(redis_url: &str) -> Result<Self, ServiceError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ServiceError::Queue(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, ServiceError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(ServiceError::from)
    }

    /// Create the consumer group at the stream tail if it does not already exist.
    pub async fn init(&self) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(STREAM_KEY)
            .arg(CONSUMER_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => info!(group = CONSUMER_GROUP, "created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = CONSUMER_GROUP, "consumer group already exists");
            }
            Err(e) => return Err(ServiceError::from(e)),
        }
        Ok(())
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[async_trait]
impl Queue for RedisQueue {
    async fn enqueue(&self, payload: &PageWorkItem) -> Result<String, ServiceError> {
        let mut conn = self.conn().await?;
        let body = serde_json::to_string(payload)
            .map_err(|e| ServiceError::Internal(format!("serialize PageWorkItem: {e}")))?;
        let msg_id: String = redis::cmd("XADD")
            .arg(STREAM_KEY)
            .arg("*")
            .arg("data")
            .arg(&body)
            .query_async(&mut conn)
            .await?;
        debug!(job_id = %payload.job_id, page = payload.page_id, msg_id = %msg_id, "enqueued page work item");
        Ok(msg_id)
    }

    async fn enqueue_delayed(&self, payload: &PageWorkItem, execute_at: SystemTime) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let body = serde_json::to_string(payload)
            .map_err(|e| ServiceError::Internal(format!("serialize PageWorkItem: {e}")))?;
        let score = execute_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        redis::cmd("ZADD")
            .arg(DELAYED_KEY)
            .arg(score)
            .arg(&body)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, consumer_id: &str, block: Duration) -> Result<Option<Delivery>, ServiceError> {
        let mut conn = self.conn().await?;
        let reply: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(CONSUMER_GROUP)
            .arg(consumer_id)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block.as_millis() as i64)
            .arg("STREAMS")
            .arg(STREAM_KEY)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let msg_id = entry.id.clone();
                if let Some(redis::Value::BulkString(bytes)) = entry.map.get("data") {
                    let text = String::from_utf8_lossy(bytes);
                    match serde_json::from_str::<PageWorkItem>(&text) {
                        Ok(payload) => return Ok(Some(Delivery { msg_id, payload })),
                        Err(e) => {
                            warn!(msg_id = %msg_id, error = %e, "dropping malformed page work item");
                            self.ack(&msg_id).await.ok();
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, msg_id: &str) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        redis::cmd("XACK")
            .arg(STREAM_KEY)
            .arg(CONSUMER_GROUP)
            .arg(msg_id)
            .query_async::<()>(&mut conn)
            .await?;
        // A double-ack (message already removed) is a no-op, satisfying the
        // idempotent-ack contract of §4.1.
        redis::cmd("XDEL")
            .arg(STREAM_KEY)
            .arg(msg_id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn enqueue_dlq(&self, payload: &PageWorkItem, reason: &str) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let body = serde_json::to_string(payload)
            .map_err(|e| ServiceError::Internal(format!("serialize PageWorkItem: {e}")))?;
        redis::cmd("XADD")
            .arg(DLQ_KEY)
            .arg("*")
            .arg("data")
            .arg(&body)
            .arg("reason")
            .arg(reason)
            .query_async::<()>(&mut conn)
            .await?;
        warn!(job_id = %payload.job_id, page = payload.page_id, reason, "moved page work item to DLQ");
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        conn.sadd::<_, _, ()>(CANCELLED_SET_KEY, job_id).await?;
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &str) -> Result<bool, ServiceError> {
        let mut conn = self.conn().await?;
        let is_member: bool = conn.sismember(CANCELLED_SET_KEY, job_id).await?;
        Ok(is_member)
    }

    async fn is_idem_done(&self, key: &str) -> Result<bool, ServiceError> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(idem_key(key)).await?;
        Ok(exists)
    }

    async fn mark_idem_done(&self, key: &str, ttl: Duration) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(idem_key(key), "1", ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn depths(&self) -> Result<QueueDepths, ServiceError> {
        let mut conn = self.conn().await?;
        let stream_len: u64 = conn.xlen(STREAM_KEY).await.unwrap_or(0);
        let delayed_len: u64 = redis::cmd("ZCARD")
            .arg(DELAYED_KEY)
            .query_async(&mut conn)
            .await
            .unwrap_or(0);
        let dlq_len: u64 = conn.xlen(DLQ_KEY).await.unwrap_or(0);
        Ok(QueueDepths {
            stream_len,
            delayed_len,
            dlq_len,
        })
    }

    async fn move_due_delayed(&self, limit: usize) -> Result<usize, ServiceError> {
        let mut conn = self.conn().await?;
        let now = now_epoch();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(DELAYED_KEY)
            .arg(0)
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }

        let mut moved = 0;
        for body in &due {
            // Best-effort: a partial failure leaves the entry in the delayed
            // set for the next tick; duplicates are absorbed by idempotency
            // (§4.1 delayed-mover policy).
            let add_result: Result<String, redis::RedisError> = redis::cmd("XADD")
                .arg(STREAM_KEY)
                .arg("*")
                .arg("data")
                .arg(body)
                .query_async(&mut conn)
                .await;

            if add_result.is_ok() {
                let _: Result<(), redis::RedisError> = redis::cmd("ZREM")
                    .arg(DELAYED_KEY)
                    .arg(body)
                    .query_async(&mut conn)
                    .await;
                moved += 1;
            } else {
                warn!("failed to move delayed page work item to main stream; will retry next tick");
            }
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item(job_id: &str, page: usize) -> PageWorkItem {
        PageWorkItem {
            job_id: job_id.to_string(),
            page_id: page,
            content_ref: "fs://documents/doc.pdf".to_string(),
            ai_engine_hint: None,
            force_fast: false,
            attempt: 1,
            idempotency_key: PageWorkItem::idempotency_key_for(job_id, page),
            image_bytes: String::new(),
            image_mime: "image/jpeg".to_string(),
            mupdf_text: String::new(),
            context_text: String::new(),
            system_prompt: "system".to_string(),
            source_tag: "test".to_string(),
        }
    }

    #[test]
    fn idempotency_key_format() {
        let item = sample_item("job-1", 3);
        assert_eq!(item.idempotency_key, "job:job-1:page:3");
    }

    #[test]
    fn page_source_roundtrip() {
        for s in [PageSource::Ai, PageSource::Mupdf, PageSource::MupdfTimeoutFallback, PageSource::Error] {
            assert_eq!(PageSource::parse(s.as_str()), s);
        }
    }
}
