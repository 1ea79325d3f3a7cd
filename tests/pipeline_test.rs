//! Integration tests for the job controller / worker dispatch / finalize
//! interplay — the six scenarios a distributed page-fan-out pipeline lives
//! or dies by: happy path, failover, monitor timeout, DLQ after exhausted
//! retries, cancellation, and the AI-bypass fast path.
//!
//! These need a real Redis instance (the status/page/breaker stores are
//! concrete Redis-backed types, not trait objects — there is nothing to
//! fake them with). Gated the same way the donor crate gates its own
//! external-resource e2e tests: skip with a clear message rather than fail
//! when the resource isn't there.
//!
//! Run with a Redis instance reachable at `DOCPIPE_TEST_REDIS_URL`
//! (default `redis://127.0.0.1:6379`):
//!   cargo test --test pipeline_test
//!
//! PDF rendering (pdfium/LibreOffice) is intentionally not exercised here —
//! it has its own unit tests in `extract::` and needs binary assets this
//! harness doesn't fetch. These tests seed the status/page records a
//! completed extraction phase would have left behind and exercise
//! everything downstream of it.

use async_trait::async_trait;
use edgequake_docpipe::breaker::BreakerRegistry;
use edgequake_docpipe::config::{ProviderModels, ServiceConfig};
use edgequake_docpipe::controller;
use edgequake_docpipe::error::FailureKind;
use edgequake_docpipe::metrics::Metrics;
use edgequake_docpipe::objectstore::{DocRef, LocalObjectStore};
use edgequake_docpipe::pages::PageStore;
use edgequake_docpipe::providers::{AttemptOutcome, ProviderClient, Request, Response};
use edgequake_docpipe::queue::{PageResult, PageSource, PageWorkItem, RedisQueue};
use edgequake_docpipe::status::{JobState, StatusStore};
use edgequake_docpipe::worker::limiter::InflightLimiter;
use edgequake_docpipe::worker::{failover, WorkerContext};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("DOCPIPE_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Skip the calling test (printing why) if Redis isn't reachable.
macro_rules! skip_unless_redis {
    () => {{
        let url = redis_url();
        match redis::Client::open(url.as_str()) {
            Ok(client) => match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    if redis::cmd("PING").query_async::<String>(&mut conn).await.is_err() {
                        println!("SKIP — Redis at {url} did not respond to PING");
                        return;
                    }
                }
                Err(e) => {
                    println!("SKIP — could not connect to Redis at {url}: {e}");
                    return;
                }
            },
            Err(e) => {
                println!("SKIP — invalid Redis URL {url}: {e}");
                return;
            }
        }
        url
    }};
}

fn unique_job_id(tag: &str) -> String {
    format!("test-{tag}-{}", uuid::Uuid::new_v4())
}

/// Canned-outcome provider double. Each call pops the next outcome off the
/// front of its queue; the last outcome repeats once the queue is drained.
struct FakeProviderClient {
    name: &'static str,
    outcomes: Mutex<VecDeque<AttemptOutcome>>,
}

impl FakeProviderClient {
    fn new(name: &'static str, outcomes: Vec<AttemptOutcome>) -> Self {
        Self { name, outcomes: Mutex::new(outcomes.into()) }
    }
}

#[async_trait]
impl ProviderClient for FakeProviderClient {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn dispatch(&self, _req: &Request<'_>) -> AttemptOutcome {
        let mut q = self.outcomes.lock().unwrap();
        if q.len() > 1 {
            q.pop_front().unwrap()
        } else {
            q.front().cloned().unwrap_or(AttemptOutcome::Failed {
                kind: FailureKind::Transient,
                detail: "fake provider exhausted".to_string(),
            })
        }
    }
}

fn sample_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.primary_provider = "openai".to_string();
    config.job_max_attempts = 3;
    config.retry_backoff_base = Duration::from_millis(1);
    config.max_retry_backoff = Duration::from_millis(5);
    config.primary_models = ProviderModels {
        openai: Some("gpt-4o".to_string()),
        anthropic: Some("claude-sonnet-4-20250514".to_string()),
    };
    config.secondary_models = ProviderModels {
        openai: Some("gpt-4o-mini".to_string()),
        anthropic: Some("claude-3-5-haiku-20241022".to_string()),
    };
    config.fast_models = config.secondary_models.clone();
    config
}

async fn build_ctx(
    redis_url: &str,
    openai: Arc<dyn ProviderClient>,
    anthropic: Arc<dyn ProviderClient>,
) -> Arc<WorkerContext> {
    let config = sample_config();
    let mut providers: HashMap<String, Arc<dyn ProviderClient>> = HashMap::new();
    providers.insert("openai".to_string(), openai);
    providers.insert("anthropic".to_string(), anthropic);

    let tmp = tempfile::tempdir().expect("tempdir");
    Arc::new(WorkerContext {
        queue: Arc::new(RedisQueue::new(redis_url).expect("queue")),
        status: Arc::new(StatusStore::new(redis_url).expect("status")),
        pages: Arc::new(PageStore::new(redis_url).expect("pages")),
        // Breaker cooldowns use whole-second granularity (`retry_at = now +
        // base.as_secs()`), so sub-second bases would reopen to half_open
        // immediately and defeat `is_open` assertions right after a failure.
        breaker: Arc::new(BreakerRegistry::new(redis_url, Duration::from_secs(30), Duration::from_secs(300)).expect("breaker")),
        providers,
        inflight: Arc::new(InflightLimiter::new(config.max_inflight_per_model)),
        config: Arc::new(config),
        metrics: Arc::new(Metrics::new()),
        object_store: Arc::new(LocalObjectStore::new(tmp.into_path())),
    })
}

fn sample_item(job_id: &str, page_id: usize) -> PageWorkItem {
    PageWorkItem {
        job_id: job_id.to_string(),
        page_id,
        content_ref: format!("fs://documents/{job_id}_original"),
        ai_engine_hint: None,
        force_fast: false,
        attempt: 1,
        idempotency_key: PageWorkItem::idempotency_key_for(job_id, page_id),
        image_bytes: String::new(),
        image_mime: "image/jpeg".to_string(),
        mupdf_text: "fallback text".to_string(),
        context_text: String::new(),
        system_prompt: "system".to_string(),
        source_tag: "test".to_string(),
    }
}

fn success(text: &str) -> AttemptOutcome {
    AttemptOutcome::Success(Response { text: text.to_string(), tokens_in: 10, tokens_out: 10 })
}

// ── Scenario 1: happy 3-page PDF ────────────────────────────────────────────
//
// Every page dispatches successfully on the first attempt; once the third
// `PageDone` lands the job should finalize on its own.
#[tokio::test]
async fn happy_path_three_pages_finalizes_automatically() {
    let redis_url = skip_unless_redis!();
    let job_id = unique_job_id("happy");

    let ctx = build_ctx(
        &redis_url,
        Arc::new(FakeProviderClient::new("openai", vec![success("page text")])),
        Arc::new(FakeProviderClient::new("anthropic", vec![success("page text")])),
    )
    .await;

    let doc = DocRef::parse(&format!("fs://documents/{job_id}_original"), "documents").unwrap();
    ctx.status.create_job(&job_id, "queued", &doc.to_uri(), None).await.unwrap();
    ctx.status.mark_processing(&job_id).await.unwrap();
    ctx.status.set_totals(&job_id, 3, 3).await.unwrap();

    for page_id in 1..=3 {
        let item = sample_item(&job_id, page_id);
        let chain = failover::build_chain(&ctx.config, &ctx.config.primary_provider, item.force_fast);
        let outcome = failover::run_chain(
            &chain,
            &ctx.providers,
            &ctx.breaker,
            &ctx.inflight,
            ctx.config.request_timeout,
            &item.job_id,
            item.page_id,
            &item.system_prompt,
            &item.context_text,
            &item.mupdf_text,
            None,
            None,
        )
        .await;
        match outcome {
            failover::ChainOutcome::Success { text, provider, model } => {
                controller::report_page_done(&ctx, &item, text, provider, model).await.unwrap();
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    let snapshot = ctx.status.get(&job_id).await.unwrap().expect("status must exist");
    assert_eq!(snapshot.status, JobState::Success);
    assert_eq!(snapshot.pages_done, 3);
    assert_eq!(snapshot.pages_failed, 0);
    let result_url = snapshot.result_url.expect("result_url must be set");
    let result_doc = DocRef::parse(&result_url, "documents").unwrap();
    let body = String::from_utf8(ctx.object_store.get(&result_doc).await.unwrap()).unwrap();
    assert_eq!(body.matches("page text").count(), 3);
}

// ── Scenario 2: primary rate-limited, secondary model succeeds ─────────────
#[tokio::test]
async fn primary_rate_limited_falls_through_to_secondary_provider() {
    let redis_url = skip_unless_redis!();
    let ctx = build_ctx(
        &redis_url,
        Arc::new(FakeProviderClient::new(
            "openai",
            vec![AttemptOutcome::Failed { kind: FailureKind::RateLimited, detail: "429".to_string() }],
        )),
        Arc::new(FakeProviderClient::new("anthropic", vec![success("recovered via secondary")])),
    )
    .await;

    let item = sample_item(&unique_job_id("failover"), 1);
    let chain = failover::build_chain(&ctx.config, &ctx.config.primary_provider, false);
    let outcome = failover::run_chain(
        &chain,
        &ctx.providers,
        &ctx.breaker,
        &ctx.inflight,
        ctx.config.request_timeout,
        &item.job_id,
        item.page_id,
        &item.system_prompt,
        &item.context_text,
        &item.mupdf_text,
        None,
        None,
    )
    .await;

    match outcome {
        failover::ChainOutcome::Success { text, provider, .. } => {
            assert_eq!(provider, "anthropic");
            assert_eq!(text, "recovered via secondary");
        }
        other => panic!("expected the secondary provider to recover, got {other:?}"),
    }

    // Both openai steps (M1, M2) should have tripped the breaker open.
    assert!(ctx.breaker.is_open("openai", "gpt-4o").await.unwrap());
}

// ── Scenario 3: monitor timeout finalizes with whatever reported in ────────
#[tokio::test]
async fn monitor_timeout_finalizes_partial_with_timeout_flag() {
    let redis_url = skip_unless_redis!();
    let job_id = unique_job_id("timeout");
    let ctx = build_ctx(
        &redis_url,
        Arc::new(FakeProviderClient::new("openai", vec![success("unused")])),
        Arc::new(FakeProviderClient::new("anthropic", vec![success("unused")])),
    )
    .await;

    let doc = DocRef::parse(&format!("fs://documents/{job_id}_original"), "documents").unwrap();
    ctx.status.create_job(&job_id, "queued", &doc.to_uri(), None).await.unwrap();
    ctx.status.mark_processing(&job_id).await.unwrap();
    ctx.status.set_totals(&job_id, 2, 2).await.unwrap();

    // Only one of the two dispatched pages reported in before the deadline;
    // page 2 only has its pre-stored MuPDF text to fall back on.
    ctx.pages
        .put_result(&job_id, 1, &PageResult { text: "page one".to_string(), source: PageSource::Ai, provider: Some("openai".to_string()), model: Some("gpt-4o".to_string()) })
        .await
        .unwrap();
    ctx.pages.put_mupdf_text(&job_id, 2, "page two mupdf text", Duration::from_secs(3600)).await.unwrap();

    controller::finalize::finalize_partial(&ctx, &job_id, "job_timeout exceeded").await.unwrap();

    let snapshot = ctx.status.get(&job_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, JobState::Success);
    assert!(snapshot.timeout_occurred);
    assert_eq!(snapshot.final_ai_pages, 1);
    assert_eq!(snapshot.final_timeout_fallback_pages, 1);
    assert!(snapshot.final_text_length > 0);
    let result_doc = DocRef::parse(&snapshot.result_url.unwrap(), "documents").unwrap();
    let body = String::from_utf8(ctx.object_store.get(&result_doc).await.unwrap()).unwrap();
    assert!(body.contains("page one"));
    assert!(body.contains("=== Page 2 ==="));
    assert!(body.contains("page two mupdf text"));

    let page2 = ctx.pages.get_result(&job_id, 2).await.unwrap().unwrap();
    assert_eq!(page2.source, PageSource::MupdfTimeoutFallback);
}

// ── Scenario 4: page exhausts retries and lands in the DLQ ─────────────────
#[tokio::test]
async fn page_moves_to_dlq_after_max_attempts() {
    let redis_url = skip_unless_redis!();
    let job_id = unique_job_id("dlq");
    let ctx = build_ctx(
        &redis_url,
        Arc::new(FakeProviderClient::new("openai", vec![success("unused")])),
        Arc::new(FakeProviderClient::new("anthropic", vec![success("unused")])),
    )
    .await;

    let doc = DocRef::parse(&format!("fs://documents/{job_id}_original"), "documents").unwrap();
    ctx.status.create_job(&job_id, "queued", &doc.to_uri(), None).await.unwrap();
    ctx.status.mark_processing(&job_id).await.unwrap();
    ctx.status.set_totals(&job_id, 1, 1).await.unwrap();
    ctx.pages.put_mupdf_text(&job_id, 1, "fallback text", Duration::from_secs(60)).await.unwrap();

    let dlq_before = ctx.queue.depths().await.unwrap().dlq_len;

    // Attempts 1 and 2 (below job_max_attempts=3): rescheduled, not final.
    for attempt in 1..ctx.config.job_max_attempts {
        let mut item = sample_item(&job_id, 1);
        item.attempt = attempt;
        controller::report_page_failed(&ctx, &item, FailureKind::Transient, "boom".to_string()).await.unwrap();
        let snapshot = ctx.status.get(&job_id).await.unwrap().unwrap();
        assert_eq!(snapshot.pages_failed, 0, "attempt {attempt} should reschedule, not fail permanently");
    }

    // Final attempt (== job_max_attempts): permanent failure, DLQ entry.
    let mut final_item = sample_item(&job_id, 1);
    final_item.attempt = ctx.config.job_max_attempts;
    controller::report_page_failed(&ctx, &final_item, FailureKind::Transient, "boom".to_string()).await.unwrap();

    let snapshot = ctx.status.get(&job_id).await.unwrap().unwrap();
    assert_eq!(snapshot.pages_failed, 1);
    assert_eq!(snapshot.status, JobState::Success, "fallback to extracted text still finalizes the job");

    let dlq_after = ctx.queue.depths().await.unwrap().dlq_len;
    assert_eq!(dlq_after, dlq_before + 1);

    let page_result = ctx.pages.get_result(&job_id, 1).await.unwrap().unwrap();
    assert_eq!(page_result.source, PageSource::MupdfTimeoutFallback);
    assert_eq!(page_result.text, "fallback text");
}

// ── Scenario 5: cancellation mid-flight ─────────────────────────────────────
#[tokio::test]
async fn cancellation_stops_further_reporting_from_overriding_status() {
    let redis_url = skip_unless_redis!();
    let job_id = unique_job_id("cancel");
    let ctx = build_ctx(
        &redis_url,
        Arc::new(FakeProviderClient::new("openai", vec![success("unused")])),
        Arc::new(FakeProviderClient::new("anthropic", vec![success("unused")])),
    )
    .await;

    let doc = DocRef::parse(&format!("fs://documents/{job_id}_original"), "documents").unwrap();
    ctx.status.create_job(&job_id, "queued", &doc.to_uri(), None).await.unwrap();
    ctx.status.mark_processing(&job_id).await.unwrap();
    ctx.status.set_totals(&job_id, 2, 2).await.unwrap();

    controller::cancel(&ctx.status, ctx.queue.as_ref(), &job_id).await.unwrap();
    assert!(ctx.queue.is_cancelled(&job_id).await.unwrap());

    // A page in flight when the cancellation landed still reports in — it
    // must not resurrect the job into `success`.
    let item = sample_item(&job_id, 1);
    controller::report_page_done(&ctx, &item, "late text".to_string(), "openai".to_string(), "gpt-4o".to_string())
        .await
        .unwrap();

    let snapshot = ctx.status.get(&job_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, JobState::Cancelled);
}

// ── Scenario 6: fast path bypasses AI entirely ──────────────────────────────
//
// `text_only`/`fast_upload` skip AI dispatch and finalize straight from the
// locally extracted text (§4.4.1 phase 2). Simulated here by seeding the
// page store the way `pipeline::run`'s `skip_ai` branch does, then
// finalizing — no provider is ever dispatched to.
#[tokio::test]
async fn fast_path_finalizes_from_extracted_text_without_any_ai_dispatch() {
    let redis_url = skip_unless_redis!();
    let job_id = unique_job_id("fastpath");
    let ctx = build_ctx(
        &redis_url,
        Arc::new(FakeProviderClient::new(
            "openai",
            vec![AttemptOutcome::Failed { kind: FailureKind::Fatal, detail: "must never be called".to_string() }],
        )),
        Arc::new(FakeProviderClient::new(
            "anthropic",
            vec![AttemptOutcome::Failed { kind: FailureKind::Fatal, detail: "must never be called".to_string() }],
        )),
    )
    .await;

    let doc = DocRef::parse(&format!("fs://documents/{job_id}_original"), "documents").unwrap();
    ctx.status.create_job(&job_id, "queued", &doc.to_uri(), None).await.unwrap();
    ctx.status.mark_processing(&job_id).await.unwrap();
    // ai_pages = 0: the defining trait of the skip_ai branch.
    ctx.status.set_totals(&job_id, 2, 0).await.unwrap();

    for (page_id, text) in [(1, "locally extracted page one"), (2, "locally extracted page two")] {
        ctx.pages
            .put_result(&job_id, page_id, &PageResult { text: text.to_string(), source: PageSource::Mupdf, provider: None, model: None })
            .await
            .unwrap();
    }

    controller::finalize::finalize_complete(&ctx, &job_id).await.unwrap();

    let snapshot = ctx.status.get(&job_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, JobState::Success);
    assert!(!snapshot.timeout_occurred);
    let result_doc = DocRef::parse(&snapshot.result_url.unwrap(), "documents").unwrap();
    let body = String::from_utf8(ctx.object_store.get(&result_doc).await.unwrap()).unwrap();
    assert!(body.contains("locally extracted page one"));
    assert!(body.contains("locally extracted page two"));
}

// ── Password round-trip through finalize + download ─────────────────────────
//
// Not one of the six named scenarios, but the same fixtures make it nearly
// free to check: a job submitted with a password finalizes to encrypted
// bytes, decryptable only with that password.
#[tokio::test]
async fn finalize_encrypts_result_when_job_has_a_password() {
    let redis_url = skip_unless_redis!();
    let job_id = unique_job_id("encrypted");
    let ctx = build_ctx(
        &redis_url,
        Arc::new(FakeProviderClient::new("openai", vec![success("unused")])),
        Arc::new(FakeProviderClient::new("anthropic", vec![success("unused")])),
    )
    .await;

    let doc = DocRef::parse(&format!("fs://documents/{job_id}_original"), "documents").unwrap();
    ctx.status.create_job(&job_id, "queued", &doc.to_uri(), Some("correct horse battery staple")).await.unwrap();
    ctx.status.mark_processing(&job_id).await.unwrap();
    ctx.status.set_totals(&job_id, 1, 0).await.unwrap();
    ctx.pages
        .put_result(&job_id, 1, &PageResult { text: "secret page text".to_string(), source: PageSource::Mupdf, provider: None, model: None })
        .await
        .unwrap();

    controller::finalize::finalize_complete(&ctx, &job_id).await.unwrap();

    let snapshot = ctx.status.get(&job_id).await.unwrap().unwrap();
    let result_doc = DocRef::parse(&snapshot.result_url.unwrap(), "documents").unwrap();
    let ciphertext = ctx.object_store.get(&result_doc).await.unwrap();
    assert!(
        !String::from_utf8_lossy(&ciphertext).contains("secret page text"),
        "result must not be stored as plaintext once a password is set"
    );

    let plaintext = edgequake_docpipe::objectstore::crypto::decrypt("correct horse battery staple", &ciphertext).unwrap();
    assert!(String::from_utf8(plaintext).unwrap().contains("secret page text"));

    assert!(edgequake_docpipe::objectstore::crypto::decrypt("wrong password", &ciphertext).is_err());
}
