//! OpenAI vision chat-completions client (§4.5), built directly on
//! `reqwest`/`rustls-tls` so the attempt classifier can inspect the raw HTTP
//! status and body rather than go through a higher-level abstraction.

use super::{classify_status, looks_like_refusal, AttemptOutcome, ProviderClient, Request, Response};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    fn build_messages(req: &Request<'_>) -> serde_json::Value {
        let mut user_content = vec![json!({
            "type": "text",
            "text": format!(
                "{}\n\nMuPDF-extracted text for this page (may be empty or garbled):\n{}",
                req.user_context_text, req.page_mupdf_text
            ),
        })];
        if let (Some(b64), Some(mime)) = (req.image_bytes_base64, req.image_mime) {
            user_content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{mime};base64,{b64}") },
            }));
        }
        json!([
            { "role": "system", "content": req.system_prompt },
            { "role": "user", "content": user_content },
        ])
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl ProviderClient for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn dispatch(&self, req: &Request<'_>) -> AttemptOutcome {
        let body = json!({
            "model": req.model,
            "messages": Self::build_messages(req),
            "max_tokens": 4096,
        });

        let resp = match self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
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
            warn!(provider = "openai", status, "non-success response");
            return AttemptOutcome::Failed {
                kind: classify_status(status),
                detail: format!("http {status}: {detail}"),
            };
        }

        let parsed: ChatCompletionResponse = match resp.json().await {
            Ok(p) => p,
            Err(e) => {
                return AttemptOutcome::Failed {
                    kind: crate::error::FailureKind::Transient,
                    detail: format!("failed to parse response body: {e}"),
                }
            }
        };

        let Some(choice) = parsed.choices.into_iter().next() else {
            return AttemptOutcome::Failed {
                kind: crate::error::FailureKind::Transient,
                detail: "response contained no choices".to_string(),
            };
        };

        let text = choice.message.content.unwrap_or_default();
        let explicit_refusal = choice.message.refusal.is_some();
        if let Some(reason) = looks_like_refusal(&text, choice.finish_reason.as_deref(), explicit_refusal) {
            return AttemptOutcome::Refused { reason };
        }

        AttemptOutcome::Success(Response {
            text,
            tokens_in: parsed.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            tokens_out: parsed.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
        })
    }
}
