//! Wire types carried through the queue: [`PageWorkItem`] and [`PageResult`].

use serde::{Deserialize, Serialize};

/// The per-page unit of work transported through the queue.
///
/// Immutable once enqueued except for `attempt`, which is monotonically
/// incremented on requeue. Unknown fields on deserialize are ignored so the
/// payload can evolve without breaking in-flight messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWorkItem {
    pub job_id: String,
    /// 1-based page number.
    pub page_id: usize,
    /// Object-store reference the page's rendered image/text originated from.
    pub content_ref: String,
    /// Per-job provider hint (`openai` | `anthropic`), if the caller requested one.
    #[serde(default)]
    pub ai_engine_hint: Option<String>,
    #[serde(default)]
    pub force_fast: bool,
    /// Monotonically incremented on each requeue; starts at 1.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    pub idempotency_key: String,
    /// Base64-encoded JPEG bytes of the rendered page.
    pub image_bytes: String,
    pub image_mime: String,
    pub mupdf_text: String,
    pub context_text: String,
    pub system_prompt: String,
    /// Free-form tag identifying where the page work item originated
    /// (e.g. `"upload"`, `"url"`), carried through for diagnostics.
    #[serde(default)]
    pub source_tag: String,
}

fn default_attempt() -> u32 {
    1
}

impl PageWorkItem {
    pub fn idempotency_key_for(job_id: &str, page_id: usize) -> String {
        format!("job:{job_id}:page:{page_id}")
    }
}

/// Where a [`PageResult`]'s text ultimately came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    Ai,
    Mupdf,
    MupdfTimeoutFallback,
    Error,
    Missing,
}

impl PageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageSource::Ai => "ai",
            PageSource::Mupdf => "mupdf",
            PageSource::MupdfTimeoutFallback => "mupdf_timeout_fallback",
            PageSource::Error => "error",
            PageSource::Missing => "missing",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ai" => PageSource::Ai,
            "mupdf" => PageSource::Mupdf,
            "mupdf_timeout_fallback" => PageSource::MupdfTimeoutFallback,
            "error" => PageSource::Error,
            _ => PageSource::Missing,
        }
    }
}

/// Per-(job,page) record, written once by the first terminal outcome.
///
/// Invariant: `text` is never empty when `source == Ai`; on any other source
/// text may be a placeholder (e.g. `"[Page N - text not available]"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub text: String,
    pub source: PageSource,
    pub provider: Option<String>,
    pub model: Option<String>,
}
