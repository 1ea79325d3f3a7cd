//! Status store (§2 item 2, §6 persisted keys): job status records and the
//! file→job mapping, backed by Redis hashes/strings with `HINCRBY` for
//! atomic counter increments — avoiding the lost-update race a naive
//! read-modify-write of the whole record would risk under concurrent page
//! completions (§5 Ordering, §9 Design Notes).

use crate::error::ServiceError;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Terminal and in-flight job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Success,
    Failed,
    Cancelled,
}

impl JobState {
    fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Success => "success",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "processing" => JobState::Processing,
            "success" => JobState::Success,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            _ => JobState::Queued,
        }
    }
}

/// A snapshot of a job's status, returned by `Progress` (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub job_id: String,
    pub status: JobState,
    pub progress: u8,
    pub message: String,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub total_pages: usize,
    pub ai_pages: usize,
    pub pages_done: usize,
    pub pages_failed: usize,
    pub timeout_occurred: bool,
    pub result_url: Option<String>,
    pub doc_uri: Option<String>,
    /// Per-source page counts and aggregate text length recorded by
    /// `Finalize` (§4.4.2); zero until the job reaches a terminal `success`.
    pub final_ai_pages: usize,
    pub final_mupdf_pages: usize,
    pub final_timeout_fallback_pages: usize,
    pub final_error_pages: usize,
    pub final_text_length: usize,
}

fn status_key(job_id: &str) -> String {
    format!("job:{job_id}:status")
}

fn file_to_job_key(file_id: &str) -> String {
    format!("file_to_job:{file_id}")
}

fn now_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// The status store, backed by Redis.
pub struct StatusStore {
    client: redis::Client,
}

impl StatusStore {
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

    /// Create the initial `queued` status record for a newly submitted job
    /// (§4.4 `SubmitJob`), recording the source document reference so
    /// [`crate::controller::finalize`] can locate it later without threading
    /// it through every reporting call, and the optional decryption secret
    /// so the pipeline can decrypt the download and re-encrypt the result.
    ///
    /// `password` is kept out of [`StatusSnapshot`] — it is fetched
    /// separately via [`Self::get_job_secret`] so `Progress` never echoes it
    /// back to a caller.
    pub async fn create_job(
        &self,
        job_id: &str,
        message: &str,
        doc_uri: &str,
        password: Option<&str>,
    ) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let key = status_key(job_id);
        let _: () = redis::pipe()
            .hset(&key, "status", JobState::Queued.as_str())
            .ignore()
            .hset(&key, "progress", 0)
            .ignore()
            .hset(&key, "message", message)
            .ignore()
            .hset(&key, "start_time", now_epoch())
            .ignore()
            .hset(&key, "total_pages", 0)
            .ignore()
            .hset(&key, "ai_pages", 0)
            .ignore()
            .hset(&key, "pages_done", 0)
            .ignore()
            .hset(&key, "pages_failed", 0)
            .ignore()
            .hset(&key, "timeout_occurred", 0)
            .ignore()
            .hset(&key, "doc_uri", doc_uri)
            .ignore()
            .hset(&key, "password", password.unwrap_or_default())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(())
    }

    /// Fetch the job's decryption secret, if one was supplied at submission.
    /// Kept out of [`StatusSnapshot`] so `Progress` never echoes it back.
    pub async fn get_job_secret(&self, job_id: &str) -> Result<Option<String>, ServiceError> {
        let mut conn = self.conn().await?;
        let v: Option<String> = conn
            .hget(status_key(job_id), "password")
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(v.filter(|s| !s.is_empty()))
    }

    /// Set a free-form progress update (monotone by convention — callers must
    /// never decrease `progress`).
    pub async fn set_progress(&self, job_id: &str, progress: u8, message: &str) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let key = status_key(job_id);
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[("progress", progress.to_string()), ("message", message.to_string())],
        )
        .await
        .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(())
    }

    pub async fn set_totals(&self, job_id: &str, total_pages: usize, ai_pages: usize) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let key = status_key(job_id);
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("total_pages", total_pages.to_string()),
                ("ai_pages", ai_pages.to_string()),
            ],
        )
        .await
        .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(())
    }

    pub async fn mark_processing(&self, job_id: &str) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(status_key(job_id), "status", JobState::Processing.as_str())
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(())
    }

    pub async fn mark_cancelled(&self, job_id: &str) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(status_key(job_id), "status", JobState::Cancelled.as_str())
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(())
    }

    pub async fn mark_failed(&self, job_id: &str, message: &str) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let key = status_key(job_id);
        let _: () = redis::pipe()
            .hset(&key, "status", JobState::Failed.as_str())
            .ignore()
            .hset(&key, "message", message)
            .ignore()
            .hset(&key, "end_time", now_epoch())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(())
    }

    /// Finalize as `success`, recording the result pointer, whether a monitor
    /// timeout forced a partial finalization, and the per-source page counts
    /// and text length `Finalize` aggregated (§4.4.2, §6, §7).
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_success(
        &self,
        job_id: &str,
        result_url: &str,
        timeout_occurred: bool,
        final_ai_pages: usize,
        final_mupdf_pages: usize,
        final_timeout_fallback_pages: usize,
        final_error_pages: usize,
        final_text_length: usize,
    ) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        let key = status_key(job_id);
        let _: () = redis::pipe()
            .hset(&key, "status", JobState::Success.as_str())
            .ignore()
            .hset(&key, "progress", 100)
            .ignore()
            .hset(&key, "end_time", now_epoch())
            .ignore()
            .hset(&key, "result_url", result_url)
            .ignore()
            .hset(&key, "timeout_occurred", timeout_occurred as i64)
            .ignore()
            .hset(&key, "final_ai_pages", final_ai_pages)
            .ignore()
            .hset(&key, "final_mupdf_pages", final_mupdf_pages)
            .ignore()
            .hset(&key, "final_timeout_fallback_pages", final_timeout_fallback_pages)
            .ignore()
            .hset(&key, "final_error_pages", final_error_pages)
            .ignore()
            .hset(&key, "final_text_length", final_text_length)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(())
    }

    /// Atomically increment `pages_done`, returning the new (done, failed) counts.
    pub async fn incr_pages_done(&self, job_id: &str) -> Result<(usize, usize), ServiceError> {
        let mut conn = self.conn().await?;
        let key = status_key(job_id);
        let done: i64 = conn.hincr(&key, "pages_done", 1).await.map_err(|e| ServiceError::Store(e.to_string()))?;
        let failed: i64 = conn
            .hget::<_, _, Option<String>>(&key, "pages_failed")
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok((done as usize, failed as usize))
    }

    /// Atomically increment `pages_failed`, returning the new (done, failed) counts.
    pub async fn incr_pages_failed(&self, job_id: &str) -> Result<(usize, usize), ServiceError> {
        let mut conn = self.conn().await?;
        let key = status_key(job_id);
        let failed: i64 = conn.hincr(&key, "pages_failed", 1).await.map_err(|e| ServiceError::Store(e.to_string()))?;
        let done: i64 = conn
            .hget::<_, _, Option<String>>(&key, "pages_done")
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok((done as usize, failed as usize))
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<StatusSnapshot>, ServiceError> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(status_key(job_id))
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        if fields.is_empty() {
            return Ok(None);
        }
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let get_usize = |k: &str| get(k).parse::<usize>().unwrap_or(0);

        Ok(Some(StatusSnapshot {
            job_id: job_id.to_string(),
            status: JobState::parse(&get("status")),
            progress: get("progress").parse().unwrap_or(0),
            message: get("message"),
            start_time: get("start_time").parse().unwrap_or(0),
            end_time: fields.get("end_time").and_then(|s| s.parse().ok()),
            total_pages: get_usize("total_pages"),
            ai_pages: get_usize("ai_pages"),
            pages_done: get_usize("pages_done"),
            pages_failed: get_usize("pages_failed"),
            timeout_occurred: get("timeout_occurred") == "1",
            result_url: fields.get("result_url").cloned(),
            doc_uri: fields.get("doc_uri").filter(|s| !s.is_empty()).cloned(),
            final_ai_pages: get_usize("final_ai_pages"),
            final_mupdf_pages: get_usize("final_mupdf_pages"),
            final_timeout_fallback_pages: get_usize("final_timeout_fallback_pages"),
            final_error_pages: get_usize("final_error_pages"),
            final_text_length: get_usize("final_text_length"),
        }))
    }

    /// Install the File→Job mapping with its TTL (§3, §6).
    pub async fn map_file_to_job(&self, file_id: &str, job_id: &str, ttl: Duration) -> Result<(), ServiceError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(file_to_job_key(file_id), job_id, ttl.as_secs().max(1))
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(())
    }

    /// Resolve a job id or a file id (optionally with `_original` suffix) to a job id.
    pub async fn resolve_identifier(&self, identifier: &str) -> Result<Option<String>, ServiceError> {
        let mut conn = self.conn().await?;
        // Try as a job id directly first.
        let exists: bool = conn
            .exists(status_key(identifier))
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        if exists {
            return Ok(Some(identifier.to_string()));
        }
        let stripped = identifier.strip_suffix("_original").unwrap_or(identifier);
        let job_id: Option<String> = conn
            .get(file_to_job_key(stripped))
            .await
            .map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(job_id)
    }
}
