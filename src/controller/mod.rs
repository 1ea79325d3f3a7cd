//! Job controller (§4.4): job lifecycle operations — `SubmitJob`, `Progress`,
//! `Cancel` — plus the page-outcome reporting entry points the worker calls
//! (`PageDone`/`PageFailed`), which in turn trigger finalization once every
//! dispatched page has reported in.

pub mod finalize;
pub mod pipeline;

use crate::controller::finalize::{finalize_complete, finalize_partial};
use crate::error::{FailureKind, ServiceError};
use crate::objectstore::DocRef;
use crate::queue::{PageResult, PageSource, PageWorkItem};
use crate::status::JobState;
use crate::worker::WorkerContext;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use uuid::Uuid;

/// Generate a fresh job id.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// `SubmitJob` (§4.4): register a new job's status record, map the uploaded
/// file id to it, and kick off the background processing pipeline. Returns
/// the new job id immediately — the caller polls `Progress` for updates.
///
/// `password` is the job's optional decryption secret (§3 Job) — the
/// pipeline decrypts the downloaded document with it before processing and
/// re-encrypts the finalized result under the same secret. `ai_engine_hint`
/// overrides which provider stands in P1's place in the failover chain
/// (§4.3.1); the configured primary provider still runs as P2.
pub fn submit_job(
    ctx: Arc<WorkerContext>,
    doc: DocRef,
    text_only: bool,
    password: Option<String>,
    ai_engine_hint: Option<String>,
) -> Result<String, ServiceError> {
    let job_id = new_job_id();
    let file_id = doc.file_id();
    let status_create = ctx.status.clone();
    let job_id_for_create = job_id.clone();
    let file_id_for_map = file_id.clone();
    let job_id_for_map = job_id.clone();
    let doc_uri = doc.to_uri();
    let password_for_create = password.clone();

    tokio::spawn(async move {
        if let Err(e) = status_create
            .create_job(&job_id_for_create, "job queued", &doc_uri, password_for_create.as_deref())
            .await
        {
            warn!(error = %e, "failed to create status record");
            return;
        }
        if let Err(e) = status_create
            .map_file_to_job(&file_id_for_map, &job_id_for_map, Duration::from_secs(7 * 24 * 3600))
            .await
        {
            warn!(error = %e, "failed to map file to job");
        }
    });

    let bg_job_id = job_id.clone();
    let bg_ctx = ctx.clone();
    tokio::spawn(async move {
        pipeline::process_job_for_ai(bg_ctx, bg_job_id, doc, text_only, password, ai_engine_hint).await;
    });

    Ok(job_id)
}

/// `Progress` (§4.4): resolve an identifier (job id or file id) to a status snapshot.
pub async fn progress(
    status: &crate::status::StatusStore,
    identifier: &str,
) -> Result<Option<crate::status::StatusSnapshot>, ServiceError> {
    match status.resolve_identifier(identifier).await? {
        Some(job_id) => status.get(&job_id).await,
        None => Ok(None),
    }
}

/// `Cancel` (§4.4): mark the job cancelled in both the status record and the
/// queue's cancellation set so in-flight and not-yet-dequeued pages are
/// skipped on their next touch.
pub async fn cancel(
    status: &crate::status::StatusStore,
    queue: &dyn crate::queue::Queue,
    job_id: &str,
) -> Result<(), ServiceError> {
    queue.cancel(job_id).await?;
    status.mark_cancelled(job_id).await?;
    info!(job_id, "job cancelled");
    Ok(())
}

/// `PageDone` (§4.4): record a successful page dispatch and, once all pages
/// for the job have reported in, finalize.
pub async fn report_page_done(
    ctx: &Arc<WorkerContext>,
    item: &PageWorkItem,
    text: String,
    provider: String,
    model: String,
) -> Result<(), ServiceError> {
    if ctx.queue.is_idem_done(&item.idempotency_key).await.unwrap_or(false) {
        return Ok(());
    }

    ctx.pages
        .put_result(
            &item.job_id,
            item.page_id,
            &PageResult {
                text,
                source: PageSource::Ai,
                provider: Some(provider),
                model: Some(model),
            },
        )
        .await?;

    ctx.queue
        .mark_idem_done(&item.idempotency_key, ctx.config.idempotency_ttl)
        .await?;

    let (done, failed) = ctx.status.incr_pages_done(&item.job_id).await?;
    maybe_finalize(ctx, &item.job_id, done, failed).await;
    Ok(())
}

/// `PageFailed` (§4.4): on the final attempt, fall back to any pre-stored
/// MuPDF text (or an empty placeholder) and count the page as failed; on a
/// non-final attempt, reschedule with exponential backoff.
pub async fn report_page_failed(
    ctx: &Arc<WorkerContext>,
    item: &PageWorkItem,
    kind: FailureKind,
    detail: String,
) -> Result<(), ServiceError> {
    if matches!(kind, FailureKind::Fatal) || item.attempt >= ctx.config.job_max_attempts {
        warn!(job_id = %item.job_id, page_id = item.page_id, attempt = item.attempt, detail, "page permanently failed");

        let fallback = ctx.pages.get_mupdf_text(&item.job_id, item.page_id).await.ok().flatten();
        let (text, source) = match fallback {
            Some(t) if !t.trim().is_empty() => (t, PageSource::MupdfTimeoutFallback),
            _ => (String::new(), PageSource::Error),
        };
        ctx.pages
            .put_result(
                &item.job_id,
                item.page_id,
                &PageResult { text, source, provider: None, model: None },
            )
            .await?;
        ctx.queue
            .mark_idem_done(&item.idempotency_key, ctx.config.idempotency_ttl)
            .await?;
        ctx.queue.enqueue_dlq(item, &detail).await?;

        let (done, failed) = ctx.status.incr_pages_failed(&item.job_id).await?;
        maybe_finalize(ctx, &item.job_id, done, failed).await;
        return Ok(());
    }

    let attempt = item.attempt + 1;
    let backoff_secs = ctx
        .config
        .retry_backoff_base
        .as_secs_f64()
        .mul_add(2f64.powi(attempt as i32 - 2), 0.0)
        .min(ctx.config.max_retry_backoff.as_secs_f64());
    let execute_at = SystemTime::now() + Duration::from_secs_f64(backoff_secs.max(0.0));

    let mut retry_item = item.clone();
    retry_item.attempt = attempt;
    ctx.queue.enqueue_delayed(&retry_item, execute_at).await?;
    info!(job_id = %item.job_id, page_id = item.page_id, attempt, backoff_secs, "page rescheduled for retry");
    Ok(())
}

async fn maybe_finalize(ctx: &Arc<WorkerContext>, job_id: &str, done: usize, failed: usize) {
    let Ok(Some(snapshot)) = ctx.status.get(job_id).await else {
        return;
    };
    if snapshot.status == JobState::Cancelled || snapshot.status == JobState::Success || snapshot.status == JobState::Failed {
        return;
    }
    if done + failed < snapshot.ai_pages {
        let progress = 65 + ((done + failed) * 30 / snapshot.ai_pages.max(1)).min(30);
        let _ = ctx
            .status
            .set_progress(job_id, progress as u8, &format!("{}/{} pages done", done + failed, snapshot.ai_pages))
            .await;
        return;
    }

    info!(job_id, done, failed, total = snapshot.ai_pages, "all pages reported, finalizing");
    if failed == snapshot.ai_pages && snapshot.ai_pages > 0 {
        if let Err(e) = finalize_partial(ctx, job_id, "all AI pages failed; falling back to extracted text").await {
            warn!(job_id, error = %e, "finalize_partial failed");
        }
    } else if let Err(e) = finalize_complete(ctx, job_id).await {
        warn!(job_id, error = %e, "finalize_complete failed");
    }
}
