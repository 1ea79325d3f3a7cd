//! `FinalizeComplete`/`FinalizePartial` (§4.4.2): aggregate every page's
//! stored result in ascending page order, prefixed with `=== Page N ===`,
//! upload it as the `_v2` artifact and promote it to the job's base key.

use crate::error::ServiceError;
use crate::objectstore::DocRef;
use crate::queue::{PageResult, PageSource};
use crate::worker::WorkerContext;
use std::sync::Arc;
use tracing::info;

struct SourceCounts {
    ai: usize,
    mupdf: usize,
    mupdf_fallback: usize,
    error: usize,
}

/// Fill in every page whose `PageResult` is still missing or empty with its
/// pre-stored MuPDF text, falling back to a placeholder if even that was
/// never cached (§4.4.2). Called before aggregation on the partial-finalize
/// path, where some pages never reported before the monitor timeout fired.
async fn fill_timeout_fallbacks(ctx: &Arc<WorkerContext>, job_id: &str, total_pages: usize) -> Result<(), ServiceError> {
    for page_id in 1..=total_pages {
        let existing = ctx.pages.get_result(job_id, page_id).await?;
        let needs_fallback = match &existing {
            None => true,
            Some(r) => r.text.trim().is_empty(),
        };
        if !needs_fallback {
            continue;
        }
        let mupdf_text = ctx.pages.get_mupdf_text(job_id, page_id).await?;
        let text = match mupdf_text {
            Some(t) if !t.trim().is_empty() => t,
            _ => format!("[Page {page_id} - text not available]"),
        };
        ctx.pages
            .put_result(
                job_id,
                page_id,
                &PageResult { text, source: PageSource::MupdfTimeoutFallback, provider: None, model: None },
            )
            .await?;
    }
    Ok(())
}

async fn aggregate(ctx: &Arc<WorkerContext>, job_id: &str, total_pages: usize) -> Result<(String, SourceCounts), ServiceError> {
    let mut body = String::new();
    let mut counts = SourceCounts { ai: 0, mupdf: 0, mupdf_fallback: 0, error: 0 };

    for page_id in 1..=total_pages {
        let result = ctx.pages.get_result(job_id, page_id).await?;
        let (text, source) = match result {
            Some(r) => (r.text, r.source),
            None => (String::new(), PageSource::Missing),
        };
        match source {
            PageSource::Ai => counts.ai += 1,
            PageSource::Mupdf => counts.mupdf += 1,
            PageSource::MupdfTimeoutFallback => counts.mupdf_fallback += 1,
            PageSource::Error | PageSource::Missing => counts.error += 1,
        }
        body.push_str(&format!("=== Page {page_id} ===\n{text}\n\n"));
    }
    Ok((body, counts))
}

/// Build the final document, upload it and mark the job a success. If
/// `timeout_occurred` is set the caller already knows some pages were cut
/// short by the job monitor; the aggregation still runs over whatever has
/// been reported so far.
pub async fn finalize_complete(ctx: &Arc<WorkerContext>, job_id: &str) -> Result<(), ServiceError> {
    finalize(ctx, job_id, false).await
}

/// Same as [`finalize_complete`] but explicitly flags the result as a
/// partial/timeout finalization (§4.4.1 monitor, §4.4.2).
pub async fn finalize_partial(ctx: &Arc<WorkerContext>, job_id: &str, reason: &str) -> Result<(), ServiceError> {
    info!(job_id, reason, "finalizing job partially");
    finalize(ctx, job_id, true).await
}

async fn finalize(ctx: &Arc<WorkerContext>, job_id: &str, timeout_occurred: bool) -> Result<(), ServiceError> {
    let Some(snapshot) = ctx.status.get(job_id).await? else {
        return Err(ServiceError::Internal(format!("no status record for job {job_id}")));
    };
    let Some(doc_uri) = &snapshot.doc_uri else {
        return Err(ServiceError::Internal(format!("no document reference recorded for job {job_id}")));
    };
    let doc = DocRef::parse(doc_uri, &ctx.config.default_container)?;
    let base = doc.base();

    if timeout_occurred {
        fill_timeout_fallbacks(ctx, job_id, snapshot.total_pages).await?;
    }

    let (body, counts) = aggregate(ctx, job_id, snapshot.total_pages).await?;
    info!(
        job_id,
        ai = counts.ai,
        mupdf = counts.mupdf,
        mupdf_fallback = counts.mupdf_fallback,
        error = counts.error,
        "aggregated final document"
    );

    let payload = match ctx.status.get_job_secret(job_id).await? {
        Some(password) => crate::objectstore::crypto::encrypt(&password, body.as_bytes()),
        None => body.into_bytes(),
    };

    let v2 = base.with_suffix("_v2");
    ctx.object_store.put(&v2, &payload).await?;
    ctx.object_store.promote(&v2, &base).await?;

    ctx.status
        .mark_success(
            job_id,
            &base.to_uri(),
            timeout_occurred,
            counts.ai,
            counts.mupdf,
            counts.mupdf_fallback,
            counts.error,
            body.len(),
        )
        .await?;
    Ok(())
}
