//! `ProcessJobForAI` (§4.4.1): the background pipeline spawned by
//! `SubmitJob`. Runs entirely off the request path; progress is reported
//! through [`crate::status::StatusStore`] as it goes.
//!
//! Phases and their progress bands: download & prepare (5→10%), per-page
//! text extraction (10→35%), AI payload preparation (35→55%), enqueue
//! (55→65%), then the monitor watches pages report in up to `job_timeout`
//! (§4.4.1, §4.4.2) while [`super::report_page_done`]/
//! [`super::report_page_failed`] push progress the rest of the way to 100%.

use crate::error::ServiceError;
use crate::extract::{self, docconv, ExtractedPage};
use crate::objectstore::{sniff_mime, DocRef, DocumentKind};
use crate::queue::PageWorkItem;
use crate::status::JobState;
use crate::worker::{self, WorkerContext};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

const SYSTEM_PROMPT: &str = "You are transcribing a scanned document page into clean, accurate plain text. \
Reproduce the page's content faithfully, preserving paragraph and table structure where reasonable. \
Do not summarize, comment on, or refuse to transcribe the page; if the page is blank, respond with an empty string.";

const CONTEXT_TRUNCATION_SUFFIX: &str = "...[truncated]";

pub async fn process_job_for_ai(
    ctx: Arc<WorkerContext>,
    job_id: String,
    doc: DocRef,
    text_only: bool,
    password: Option<String>,
    ai_engine_hint: Option<String>,
) {
    if let Err(e) = run(&ctx, &job_id, &doc, text_only, password.as_deref(), ai_engine_hint.as_deref()).await {
        error!(job_id, error = %e, "job pipeline failed");
        let _ = ctx.status.mark_failed(&job_id, &e.to_string()).await;
    }
}

async fn run(
    ctx: &Arc<WorkerContext>,
    job_id: &str,
    doc: &DocRef,
    text_only: bool,
    password: Option<&str>,
    ai_engine_hint: Option<&str>,
) -> Result<(), ServiceError> {
    ctx.status.mark_processing(job_id).await?;
    ctx.status.set_progress(job_id, 5, "downloading source document").await?;

    let downloaded = ctx.object_store.get(doc).await?;
    let raw = match password {
        Some(pw) => crate::objectstore::crypto::decrypt(pw, &downloaded).map_err(|e| ServiceError::DecryptionFailed {
            key: doc.to_uri(),
            detail: e.to_string(),
        })?,
        None => downloaded,
    };
    let ext = crate::objectstore::path_extension(&doc.key);
    let kind = sniff_mime(&raw, ext);

    let pdf_bytes = match kind {
        DocumentKind::Pdf => raw,
        DocumentKind::OfficeOpenXml | DocumentKind::LegacyOffice => {
            ctx.status.set_progress(job_id, 8, "converting office document to PDF").await?;
            docconv::convert_to_pdf(&raw, kind, ctx.config.libreoffice_timeout).await?
        }
        other => {
            return Err(ServiceError::ConversionFailed {
                key: doc.to_uri(),
                detail: format!("unsupported document kind: {other:?}"),
            })
        }
    };
    ctx.status.set_progress(job_id, 10, "extracting page text").await?;

    let pages = extract::extract_all_text(pdf_bytes.clone(), None).await?;
    let total_pages = pages.len();
    if total_pages == 0 {
        return Err(ServiceError::ConversionFailed {
            key: doc.to_uri(),
            detail: "document contains no pages".to_string(),
        });
    }

    for page in &pages {
        ctx.pages
            .put_mupdf_text(job_id, page.page_id, &page.text, ctx.config.mupdf_cache_ttl)
            .await?;
    }
    upload_mupdf_aggregate(ctx, doc, &pages).await?;

    // `text_only`/`fast_upload` bypass AI dispatch entirely, the same path
    // taken when the document already has enough extractable text (§4.4.1
    // phase 2, HTTP surface).
    let skip_ai = text_only || extract::has_extractable_text(&pages, ctx.config.extractable_text_threshold);
    ctx.status.set_progress(job_id, 35, "preparing AI dispatch payloads").await?;

    if skip_ai {
        info!(job_id, text_only, "skipping AI dispatch, using extracted text only");
        ctx.status.set_totals(job_id, total_pages, 0).await?;
        for page in &pages {
            ctx.pages
                .put_result(
                    job_id,
                    page.page_id,
                    &crate::queue::PageResult {
                        text: page.text.clone(),
                        source: crate::queue::PageSource::Mupdf,
                        provider: None,
                        model: None,
                    },
                )
                .await?;
        }
        super::finalize::finalize_complete(ctx, job_id).await?;
        return Ok(());
    }

    let context_text = build_context_text(&pages, ctx.config.context_text_limit);
    let rendered = extract::render_pages(
        pdf_bytes,
        None,
        pages.iter().map(|p| p.page_id).collect(),
        ctx.config.render_dpi,
        ctx.config.jpeg_quality,
    )
    .await?;

    ctx.status.set_progress(job_id, 55, "enqueueing pages for AI dispatch").await?;
    ctx.status.set_totals(job_id, total_pages, rendered.len()).await?;

    let mupdf_by_page: std::collections::HashMap<usize, &ExtractedPage> =
        pages.iter().map(|p| (p.page_id, p)).collect();

    for page in &rendered {
        let mupdf_text = mupdf_by_page.get(&page.page_id).map(|p| p.text.as_str()).unwrap_or_default();
        let item = PageWorkItem {
            job_id: job_id.to_string(),
            page_id: page.page_id,
            content_ref: doc.to_uri(),
            ai_engine_hint: ai_engine_hint.map(str::to_string),
            force_fast: false,
            attempt: 1,
            idempotency_key: PageWorkItem::idempotency_key_for(job_id, page.page_id),
            image_bytes: worker::encode_image(&page.jpeg_bytes),
            image_mime: "image/jpeg".to_string(),
            mupdf_text: mupdf_text.to_string(),
            context_text: context_text.clone(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            source_tag: "pipeline".to_string(),
        };
        ctx.queue.enqueue(&item).await?;
    }

    ctx.status.set_progress(job_id, 65, "pages dispatched, awaiting AI results").await?;
    spawn_monitor(ctx.clone(), job_id.to_string(), ctx.config.job_timeout);
    Ok(())
}

async fn upload_mupdf_aggregate(ctx: &Arc<WorkerContext>, doc: &DocRef, pages: &[ExtractedPage]) -> Result<(), ServiceError> {
    let mut body = String::new();
    for page in pages {
        body.push_str(&format!("=== Page {} ===\n{}\n\n", page.page_id, page.text));
    }
    let v1 = doc.base().with_suffix("_v1");
    ctx.object_store.put(&v1, body.as_bytes()).await
}

fn build_context_text(pages: &[ExtractedPage], limit: usize) -> String {
    let mut joined = String::new();
    for page in pages {
        joined.push_str(&page.text);
        joined.push('\n');
    }
    if joined.len() <= limit {
        return joined;
    }
    let mut cut = limit.saturating_sub(CONTEXT_TRUNCATION_SUFFIX.len());
    while cut > 0 && !joined.is_char_boundary(cut) {
        cut -= 1;
    }
    // Back off to the previous word boundary so we don't split mid-word.
    let mut word_cut = cut;
    while word_cut > 0 && !joined.as_bytes()[word_cut - 1].is_ascii_whitespace() {
        word_cut -= 1;
    }
    let final_cut = if word_cut > 0 { word_cut } else { cut };
    format!("{}{}", &joined[..final_cut], CONTEXT_TRUNCATION_SUFFIX)
}

/// Watch a job's page counters; if it hasn't finalized within `timeout`,
/// finalize partially with whatever has reported in so far (§4.4.1, §9).
fn spawn_monitor(ctx: Arc<WorkerContext>, job_id: String, timeout: Duration) {
    tokio::spawn(async move {
        let deadline = SystemTime::now() + timeout;
        let mut ticker = tokio::time::interval(ctx.config.monitor_interval);
        loop {
            ticker.tick().await;
            let Ok(Some(snapshot)) = ctx.status.get(&job_id).await else {
                return;
            };
            if matches!(snapshot.status, JobState::Success | JobState::Failed | JobState::Cancelled) {
                return;
            }
            if SystemTime::now() >= deadline {
                warn!(job_id, "job exceeded monitor timeout, cancelling and finalizing partially");
                if let Err(e) = super::cancel(&ctx.status, ctx.queue.as_ref(), &job_id).await {
                    error!(job_id, error = %e, "timeout cancellation failed");
                }
                if let Err(e) = super::finalize::finalize_partial(&ctx, &job_id, "job_timeout exceeded").await {
                    error!(job_id, error = %e, "timeout finalization failed");
                }
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(id: usize, text: &str) -> ExtractedPage {
        ExtractedPage { page_id: id, text: text.to_string() }
    }

    #[test]
    fn context_text_under_limit_is_unchanged() {
        let pages = vec![page(1, "hello"), page(2, "world")];
        assert_eq!(build_context_text(&pages, 4000), "hello\nworld\n");
    }

    #[test]
    fn context_text_over_limit_is_truncated_at_word_boundary() {
        let long_word = "a".repeat(10);
        let text = format!("{} {}", long_word, "b".repeat(20));
        let pages = vec![page(1, &text)];
        let out = build_context_text(&pages, 15);
        assert!(out.ends_with(CONTEXT_TRUNCATION_SUFFIX));
        assert!(out.len() <= 15 + CONTEXT_TRUNCATION_SUFFIX.len());
    }
}
