//! Page artifact store (§2 item 3, §6): per-(job,page) results plus the
//! TTL'd MuPDF pre-store used for fallback text on failure/timeout.

use crate::error::ServiceError;
use crate::queue::{PageResult, PageSource};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

fn page_key(job_id: &str, page_id: usize) -> String {
    format!("job:{job_id}:page:{page_id}")
}

fn mupdf_key(job_id: &str, page_id: usize) -> String {
    format!("job:{job_id}:mupdf:{page_id}")
}

/// The page artifact store, backed by Redis.
pub struct PageStore {
    client: redis::Client,
}

impl PageStore {
    pub fn new(redis_url: &str) -> Result<Self, ServiceError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ServiceError::Store(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, ServiceError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))
    }

    /// Pre-store a page's MuPDF-extracted text with a 24h TTL (§4.4.1 phase 2).
    pub async fn put_mupdf_text(&self, job_id: &str, page_id: usize, text: &str, ttl: Duration) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(mupdf_key(job_id, page_id), text, ttl.as_secs().max(1))
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(())
    }

    pub async fn get_mupdf_text(&self, job_id: &str, page_id: usize) -> Result<Option<String>, ServiceError> {
        let mut conn = self.conn().await?;
        let v: Option<String> = conn
            .get(mupdf_key(job_id, page_id))
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(v)
    }

    /// Persist a page result. Written once by the first terminal outcome; a
    /// second write for the same (job,page) silently overwrites, which is
    /// safe because the idempotency keyset prevents a second AI call, and a
    /// worker-level re-delivery after the first `page_done` is already a
    /// no-op via `IsIdemDone`.
    pub async fn put_result(&self, job_id: &str, page_id: usize, result: &PageResult) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let key = page_key(job_id, page_id);
        let mut fields: Vec<(&str, String)> = vec![
            ("text", result.text.clone()),
            ("source", result.source.as_str().to_string()),
        ];
        if let Some(p) = &result.provider {
            fields.push(("provider", p.clone()));
        }
        if let Some(m) = &result.model {
            fields.push(("model", m.clone()));
        }
        conn.hset_multiple::<_, _, _, ()>(&key, &fields)
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(())
    }

    pub async fn get_result(&self, job_id: &str, page_id: usize) -> Result<Option<PageResult>, ServiceError> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(page_key(job_id, page_id))
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(PageResult {
            text: fields.get("text").cloned().unwrap_or_default(),
            source: PageSource::parse(fields.get("source").map(String::as_str).unwrap_or("missing")),
            provider: fields.get("provider").cloned(),
            model: fields.get("model").cloned(),
        }))
    }
}
