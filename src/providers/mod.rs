//! Provider client contract (§4.5): a thin `Do` call per attempt, with
//! response classification pushed down to the outcome types so the failover
//! chain (§4.3.1) never has to look past `FailureKind`.

pub mod anthropic;
pub mod openai;

use crate::error::FailureKind;
use async_trait::async_trait;
use std::time::Duration;

/// One AI-dispatch attempt's input. `image_bytes_base64`/`image_mime` are
/// `None` for the fast path (`force_fast`/text-only dispatch skips the image).
#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub job_id: &'a str,
    pub page_id: usize,
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub user_context_text: &'a str,
    pub page_mupdf_text: &'a str,
    pub image_bytes_base64: Option<&'a str>,
    pub image_mime: Option<&'a str>,
    pub timeout: Duration,
}

/// A successful provider response.
#[derive(Debug, Clone)]
pub struct Response {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Outcome of a single provider attempt (§4.3.1 classification).
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success(Response),
    Refused { reason: String },
    Failed { kind: FailureKind, detail: String },
}

/// A vision-chat-completion client for one AI provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Stable provider identifier used in breaker keys, metrics and `PageResult::provider`.
    fn name(&self) -> &'static str;

    async fn dispatch(&self, req: &Request<'_>) -> AttemptOutcome;
}

/// Classify an HTTP status code per §4.3.1: 429 → rate limited, other 4xx →
/// fatal (will never succeed on retry), 5xx → transient.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        429 => FailureKind::RateLimited,
        400..=499 => FailureKind::Fatal,
        500..=599 => FailureKind::Transient,
        _ => FailureKind::Transient,
    }
}

/// Canonical phrases used to recognise a model's refusal to answer, checked
/// case-insensitively against the full completion text (§4.3.2). Kept short
/// and specific enough to avoid flagging legitimate transcriptions of a
/// document that merely mentions these topics.
const REFUSAL_PHRASES: &[&str] = &[
    "i cannot assist with this request",
    "i can't assist with this request",
    "i cannot help with this request",
    "i'm not able to process this image",
    "i am not able to process this image",
    "i cannot view or analyze images",
    "i'm unable to view images",
    "this content violates",
    "i cannot provide a transcription of this",
    "i won't be able to help with that",
];

/// Detect a content refusal masquerading as a normal completion (§4.3.2):
/// an explicit refusal flag, `finish_reason == "content_filter"`, or a
/// canonical refusal phrase found in the response text.
pub fn looks_like_refusal(text: &str, finish_reason: Option<&str>, explicit_refusal: bool) -> Option<String> {
    if explicit_refusal {
        return Some("provider reported an explicit refusal".to_string());
    }
    if matches!(finish_reason, Some("content_filter")) {
        return Some("finish_reason=content_filter".to_string());
    }
    let lower = text.to_lowercase();
    for phrase in REFUSAL_PHRASES {
        if phrase.len() >= 10 && lower.contains(phrase) {
            return Some(format!("matched refusal phrase: \"{phrase}\""));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_matches_spec_buckets() {
        assert_eq!(classify_status(429), FailureKind::RateLimited);
        assert_eq!(classify_status(400), FailureKind::Fatal);
        assert_eq!(classify_status(404), FailureKind::Fatal);
        assert_eq!(classify_status(500), FailureKind::Transient);
        assert_eq!(classify_status(503), FailureKind::Transient);
    }

    #[test]
    fn refusal_detection_catches_phrase_and_filter() {
        assert!(looks_like_refusal("I cannot assist with this request.", None, false).is_some());
        assert!(looks_like_refusal("here is the text", Some("content_filter"), false).is_some());
        assert!(looks_like_refusal("here is the extracted text", None, false).is_none());
    }

    #[test]
    fn refusal_detection_respects_explicit_flag() {
        assert!(looks_like_refusal("ok", None, true).is_some());
    }
}
