//! HTTP surface (§6): submission, progress, download, cancellation and the
//! operational endpoints (`/health`, `/healthz`, `/metrics`), served with
//! `axum` to match the ambient HTTP-framework choice for this pipeline.

use crate::controller;
use crate::objectstore::DocRef;
use crate::worker::WorkerContext;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub fn router(ctx: Arc<WorkerContext>) -> Router {
    Router::new()
        .route("/process_file_junior_call", post(process_file_junior_call))
        .route("/process_file_upload", post(process_file_upload))
        .route("/progress_spec/:id", get(progress))
        .route("/download_result/:job_id", get(download_result))
        .route("/webhook/cancel_job", post(cancel_job))
        .route("/internal/page_done", post(internal_page_done))
        .route("/internal/page_failed", post(internal_page_failed))
        .route("/internal/job_done", post(internal_job_done))
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
struct ProcessFileRequest {
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    text_only: bool,
    #[serde(default)]
    fast_upload: bool,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    ai_engine: Option<String>,
}

impl ProcessFileRequest {
    /// `file_path` and `file_url` are interchangeable aliases for the same
    /// `scheme://bucket/key` document reference (§6).
    fn document_ref(&self) -> Option<&str> {
        self.file_path.as_deref().or(self.file_url.as_deref())
    }
}

/// Map the `ai_engine` request field (`OpenAIEngine|ClaudeEngine|JuniorEngine`,
/// case-insensitive) to the provider hint threaded through the failover chain.
fn ai_engine_hint(ai_engine: &str) -> Option<&'static str> {
    match ai_engine.to_ascii_lowercase().as_str() {
        "openaiengine" => Some("openai"),
        "claudeengine" => Some("anthropic"),
        "juniorengine" => Some("openai"),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    status: &'static str,
    job_id: String,
    message: String,
    metadata: serde_json::Value,
}

fn submit_response(
    job_id: String,
    doc: &DocRef,
    user_name: Option<&str>,
    user_id: Option<&str>,
    source: Option<&str>,
) -> SubmitResponse {
    SubmitResponse {
        status: "ok",
        message: "job queued".to_string(),
        metadata: json!({
            "document_ref": doc.to_uri(),
            "user_name": user_name,
            "user_id": user_id,
            "source": source,
        }),
        job_id,
    }
}

/// `POST /process_file_junior_call`: submit a job for a document already
/// present in the object store, identified by `scheme://bucket/key`.
async fn process_file_junior_call(
    State(ctx): State<Arc<WorkerContext>>,
    Json(req): Json<ProcessFileRequest>,
) -> Response {
    let Some(document_ref) = req.document_ref() else {
        return api_error(StatusCode::BAD_REQUEST, "request must set 'file_path' or 'file_url'");
    };
    let doc = match DocRef::parse(document_ref, &ctx.config.default_container) {
        Ok(d) => d,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let hint = req.ai_engine.as_deref().and_then(ai_engine_hint).map(str::to_string);
    let text_only = req.text_only || req.fast_upload;
    let user_name = req.user_name.clone();
    let user_id = req.user_id.clone();
    let source = req.source.clone();
    let password = req.password.clone();
    match controller::submit_job(ctx, doc.clone(), text_only, password, hint) {
        Ok(job_id) => (
            StatusCode::CREATED,
            Json(submit_response(job_id, &doc, user_name.as_deref(), user_id.as_deref(), source.as_deref())),
        )
            .into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// `POST /process_file_upload`: accept a raw file upload, store it as
/// `<file_id>_original`, and submit a job for it.
async fn process_file_upload(State(ctx): State<Arc<WorkerContext>>, mut multipart: Multipart) -> Response {
    let mut text_only = false;
    let mut ai_engine: Option<String> = None;
    let mut user_name: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut file_name = String::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => return api_error(StatusCode::BAD_REQUEST, &format!("malformed multipart body: {e}")),
        };
        match field.name().unwrap_or_default() {
            "text_only" => {
                if let Ok(bytes) = field.bytes().await {
                    text_only = bytes.as_ref() == b"true" || bytes.as_ref() == b"1";
                }
            }
            "ai_engine" => {
                if let Ok(bytes) = field.bytes().await {
                    ai_engine = Some(String::from_utf8_lossy(&bytes).into_owned());
                }
            }
            "user_name" => {
                if let Ok(bytes) = field.bytes().await {
                    user_name = Some(String::from_utf8_lossy(&bytes).into_owned());
                }
            }
            "file" => {
                file_name = field.file_name().unwrap_or("upload").to_string();
                match field.bytes().await {
                    Ok(bytes) => file_bytes = Some(bytes.to_vec()),
                    Err(e) => return api_error(StatusCode::BAD_REQUEST, &format!("failed to read upload: {e}")),
                }
            }
            _ => {}
        }
    }

    let Some(bytes) = file_bytes else {
        return api_error(StatusCode::BAD_REQUEST, "missing 'file' field in multipart body");
    };

    let file_id = Uuid::new_v4().to_string();
    let ext = std::path::Path::new(&file_name).extension().and_then(|e| e.to_str()).unwrap_or("");
    let key = if ext.is_empty() {
        format!("{file_id}_original")
    } else {
        format!("{file_id}_original.{ext}")
    };
    let doc = DocRef {
        scheme: "fs".to_string(),
        bucket: ctx.config.default_container.clone(),
        key,
    };

    if let Err(e) = ctx.object_store.put(&doc, &bytes).await {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    let hint = ai_engine.as_deref().and_then(ai_engine_hint).map(str::to_string);
    match controller::submit_job(ctx, doc.clone(), text_only, None, hint) {
        Ok(job_id) => {
            (StatusCode::CREATED, Json(submit_response(job_id, &doc, user_name.as_deref(), None, None))).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    success: bool,
    job_id: String,
    status: crate::status::JobState,
    progress: u8,
    message: String,
    start_time: u64,
    end_time: Option<u64>,
    metadata: serde_json::Value,
}

/// `GET /progress_spec/{id}`: accepts either a job id or a file id.
async fn progress(State(ctx): State<Arc<WorkerContext>>, Path(id): Path<String>) -> Response {
    match controller::progress(&ctx.status, &id).await {
        Ok(Some(snapshot)) => Json(ProgressResponse {
            success: true,
            job_id: snapshot.job_id,
            status: snapshot.status,
            progress: snapshot.progress,
            message: snapshot.message,
            start_time: snapshot.start_time,
            end_time: snapshot.end_time,
            metadata: json!({
                "total_pages": snapshot.total_pages,
                "ai_pages": snapshot.ai_pages,
                "pages_done": snapshot.pages_done,
                "pages_failed": snapshot.pages_failed,
                "timeout_occurred": snapshot.timeout_occurred,
                "result_url": snapshot.result_url,
                "final_ai_pages": snapshot.final_ai_pages,
                "final_mupdf_pages": snapshot.final_mupdf_pages,
                "final_timeout_fallback_pages": snapshot.final_timeout_fallback_pages,
                "final_error_pages": snapshot.final_error_pages,
                "final_text_length": snapshot.final_text_length,
            }),
        })
        .into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "job not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// `GET /download_result/{job_id}`: fetch the finalized document.
async fn download_result(State(ctx): State<Arc<WorkerContext>>, Path(job_id): Path<String>) -> Response {
    let snapshot = match ctx.status.get(&job_id).await {
        Ok(Some(s)) => s,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "job not found"),
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let Some(result_url) = snapshot.result_url else {
        return api_error(StatusCode::CONFLICT, "job has not produced a result yet");
    };
    let doc = match DocRef::parse(&result_url, &ctx.config.default_container) {
        Ok(d) => d,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let bytes = match ctx.object_store.get(&doc).await {
        Ok(b) => b,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let secret = match ctx.status.get_job_secret(&job_id).await {
        Ok(s) => s,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    match secret {
        Some(password) => match crate::objectstore::crypto::decrypt(&password, &bytes) {
            Ok(plaintext) => (StatusCode::OK, plaintext).into_response(),
            Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("failed to decrypt result: {e}")),
        },
        None => (StatusCode::OK, bytes).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    job_id: String,
}

/// `POST /webhook/cancel_job`.
async fn cancel_job(State(ctx): State<Arc<WorkerContext>>, Json(req): Json<CancelRequest>) -> Response {
    match controller::cancel(&ctx.status, ctx.queue.as_ref(), &req.job_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct PageDoneRequest {
    job_id: String,
    page_id: usize,
    text: String,
    provider: String,
    model: String,
}

/// `POST /internal/page_done`: out-of-process worker callback, equivalent to
/// the in-process path taken after [`crate::worker::run`] dispatches a page.
async fn internal_page_done(State(ctx): State<Arc<WorkerContext>>, Json(req): Json<PageDoneRequest>) -> Response {
    let item = crate::queue::PageWorkItem {
        job_id: req.job_id.clone(),
        page_id: req.page_id,
        content_ref: String::new(),
        ai_engine_hint: None,
        force_fast: false,
        attempt: 1,
        idempotency_key: crate::queue::PageWorkItem::idempotency_key_for(&req.job_id, req.page_id),
        image_bytes: String::new(),
        image_mime: String::new(),
        mupdf_text: String::new(),
        context_text: String::new(),
        system_prompt: String::new(),
        source_tag: "external_worker".to_string(),
    };
    match controller::report_page_done(&ctx, &item, req.text, req.provider, req.model).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct PageFailedRequest {
    job_id: String,
    page_id: usize,
    attempt: u32,
    kind: String,
    detail: String,
}

/// `POST /internal/page_failed`.
async fn internal_page_failed(State(ctx): State<Arc<WorkerContext>>, Json(req): Json<PageFailedRequest>) -> Response {
    let kind = match req.kind.as_str() {
        "rate_limited" => crate::error::FailureKind::RateLimited,
        "timeout" => crate::error::FailureKind::Timeout,
        "fatal" => crate::error::FailureKind::Fatal,
        _ => crate::error::FailureKind::Transient,
    };
    let item = crate::queue::PageWorkItem {
        job_id: req.job_id.clone(),
        page_id: req.page_id,
        content_ref: String::new(),
        ai_engine_hint: None,
        force_fast: false,
        attempt: req.attempt,
        idempotency_key: crate::queue::PageWorkItem::idempotency_key_for(&req.job_id, req.page_id),
        image_bytes: String::new(),
        image_mime: String::new(),
        mupdf_text: String::new(),
        context_text: String::new(),
        system_prompt: String::new(),
        source_tag: "external_worker".to_string(),
    };
    match controller::report_page_failed(&ctx, &item, kind, req.detail).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct JobDoneRequest {
    job_id: String,
}

/// `POST /internal/job_done`: acknowledges an externally-finalized job; this
/// pipeline finalizes jobs itself once every page reports in, so this simply
/// confirms current status for callers that expect a response.
async fn internal_job_done(State(ctx): State<Arc<WorkerContext>>, Json(req): Json<JobDoneRequest>) -> Response {
    match ctx.status.get(&req.job_id).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "job not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn healthz(State(ctx): State<Arc<WorkerContext>>) -> Response {
    match ctx.queue.ping().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!(error = %e, "healthz check failed");
            api_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
        }
    }
}

async fn metrics(State(ctx): State<Arc<WorkerContext>>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, message: &str) -> Response {
    (status, Json(ApiError { error: message.to_string() })).into_response()
}
