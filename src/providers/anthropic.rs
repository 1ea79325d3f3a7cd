//! Anthropic vision messages-API client (§4.5), mirroring
//! [`super::openai::OpenAiProvider`]'s direct-`reqwest` shape so the
//! classifier can inspect the raw status/body for both providers alike.

use super::{classify_status, looks_like_refusal, AttemptOutcome, ProviderClient, Request, Response};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    fn build_content(req: &Request<'_>) -> serde_json::Value {
        let mut blocks = Vec::new();
        if let (Some(b64), Some(mime)) = (req.image_bytes_base64, req.image_mime) {
            blocks.push(json!({
                "type": "image",
                "source": { "type": "base64", "media_type": mime, "data": b64 },
            }));
        }
        blocks.push(json!({
            "type": "text",
            "text": format!(
                "{}\n\nMuPDF-extracted text for this page (may be empty or garbled):\n{}",
                req.user_context_text, req.page_mupdf_text
            ),
        }));
        json!(blocks)
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[async_trait]
impl ProviderClient for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn dispatch(&self, req: &Request<'_>) -> AttemptOutcome {
        let body = json!({
            "model": req.model,
            "max_tokens": 4096,
            "system": req.system_prompt,
            "messages": [
                { "role": "user", "content": Self::build_content(req) },
            ],
        });

        let resp = match self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .timeout(req.timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return AttemptOutcome::Failed {
                    kind: crate::error::FailureKind::Timeout,
                    detail: "request timed out".to_string(),
                }
            }
            Err(e) => {
                return AttemptOutcome::Failed {
                    kind: crate::error::FailureKind::Transient,
                    detail: format!("request failed: {e}"),
                }
            }
        };

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let detail = resp.text().await.unwrap_or_default();
            warn!(provider = "anthropic", status, "non-success response");
            return AttemptOutcome::Failed {
                kind: classify_status(status),
                detail: format!("http {status}: {detail}"),
            };
        }

        let parsed: MessagesResponse = match resp.json().await {
            Ok(p) => p,
            Err(e) => {
                return AttemptOutcome::Failed {
                    kind: crate::error::FailureKind::Transient,
                    detail: format!("failed to parse response body: {e}"),
                }
            }
        };

        let text = parsed
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        let explicit_refusal = matches!(parsed.stop_reason.as_deref(), Some("refusal"));
        if let Some(reason) = looks_like_refusal(&text, parsed.stop_reason.as_deref(), explicit_refusal) {
            return AttemptOutcome::Refused { reason };
        }

        AttemptOutcome::Success(Response {
            text,
            tokens_in: parsed.usage.as_ref().map(|u| u.input_tokens).unwrap_or(0),
            tokens_out: parsed.usage.as_ref().map(|u| u.output_tokens).unwrap_or(0),
        })
    }
}
