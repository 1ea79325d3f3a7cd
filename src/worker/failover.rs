//! Four-step provider/model failover chain (§4.3.1).
//!
//! Steps, in order: P1/M1 (primary provider, primary model) → P1/M2 (primary
//! provider, secondary model) → P2/M3 (secondary provider, primary model) →
//! P2/M4 (secondary provider, secondary model). A step is skipped outright if
//! its circuit breaker is open. `RateLimited`/`Timeout`/`Transient` outcomes
//! and refusals fall through to the next step; `Fatal` aborts the chain
//! immediately (a malformed or rejected request fails the same way against
//! every other provider/model) and is reported as the exhausted reason.

use crate::breaker::BreakerRegistry;
use crate::config::ServiceConfig;
use crate::error::FailureKind;
use crate::providers::{AttemptOutcome, ProviderClient, Request};
use crate::worker::limiter::InflightLimiter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Build the four ordered (provider, model) steps from config (§4.3.1):
/// `modelTier = fast if force_fast else primary` for steps 1/3, `secondary`
/// for steps 2/4; a step is skipped if its provider has no configured model
/// for that tier, or if it would repeat the model the prior step for that
/// provider already tried. `primary_provider` overrides `config.primary_provider`
/// — a per-job `ai_engine_hint` takes P1's place, with the configured primary
/// provider's counterpart still tried as P2 (§4.4 per-job hint semantics).
pub fn build_chain(config: &ServiceConfig, primary_provider: &str, force_fast: bool) -> Vec<(String, String)> {
    let secondary_provider = match primary_provider {
        "openai" => "anthropic",
        _ => "openai",
    };
    let tier_models = if force_fast { &config.fast_models } else { &config.primary_models };

    let mut steps = Vec::with_capacity(4);
    let m1 = tier_models.get(primary_provider).map(str::to_string);
    if let Some(m) = &m1 {
        steps.push((primary_provider.to_string(), m.clone()));
    }
    if let Some(m2) = config.secondary_models.get(primary_provider) {
        if Some(m2) != m1.as_deref() {
            steps.push((primary_provider.to_string(), m2.to_string()));
        }
    }
    let m3 = tier_models.get(secondary_provider).map(str::to_string);
    if let Some(m) = &m3 {
        steps.push((secondary_provider.to_string(), m.clone()));
    }
    if let Some(m4) = config.secondary_models.get(secondary_provider) {
        if Some(m4) != m3.as_deref() {
            steps.push((secondary_provider.to_string(), m4.to_string()));
        }
    }
    steps
}

#[derive(Debug, Clone)]
pub enum ChainOutcome {
    Success { text: String, provider: String, model: String },
    Exhausted { kind: FailureKind, detail: String },
}

/// Run the chain for a single page, stopping at the first success.
pub async fn run_chain(
    chain: &[(String, String)],
    providers: &HashMap<String, Arc<dyn ProviderClient>>,
    breaker: &BreakerRegistry,
    inflight: &InflightLimiter,
    per_attempt_timeout: Duration,
    job_id: &str,
    page_id: usize,
    system_prompt: &str,
    user_context_text: &str,
    page_mupdf_text: &str,
    image_bytes_base64: Option<&str>,
    image_mime: Option<&str>,
) -> ChainOutcome {
    let mut last_failure: Option<(FailureKind, String)> = None;

    for (provider_name, model) in chain {
        match breaker.is_open(provider_name, model).await {
            Ok(true) => {
                debug!(provider = %provider_name, model = %model, "breaker open, skipping step");
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "breaker check failed, treating as closed");
            }
        }

        let Some(client) = providers.get(provider_name) else {
            warn!(provider = %provider_name, "no client configured for provider, skipping step");
            continue;
        };

        let Some(_permit) = inflight.try_admit(provider_name, model) else {
            debug!(provider = %provider_name, model = %model, "inflight cap reached, skipping step");
            continue;
        };

        let req = Request {
            job_id,
            page_id,
            model,
            system_prompt,
            user_context_text,
            page_mupdf_text,
            image_bytes_base64,
            image_mime,
            timeout: per_attempt_timeout,
        };

        let outcome = client.dispatch(&req).await;
        match outcome {
            AttemptOutcome::Success(resp) => {
                let _ = breaker.close(provider_name, model).await;
                info!(provider = %provider_name, model = %model, job_id, page_id, "page dispatch succeeded");
                return ChainOutcome::Success {
                    text: resp.text,
                    provider: provider_name.clone(),
                    model: model.clone(),
                };
            }
            AttemptOutcome::Refused { reason } => {
                // Content refusal is classified as transient (§4.3.2): it opens the
                // breaker and falls through to the next provider/model step.
                let _ = breaker.open(provider_name, model).await;
                warn!(provider = %provider_name, model = %model, job_id, page_id, reason, "content refused, trying next step");
                last_failure = Some((FailureKind::Transient, format!("refused: {reason}")));
            }
            AttemptOutcome::Failed { kind, detail } => {
                if matches!(kind, FailureKind::RateLimited | FailureKind::Transient | FailureKind::Timeout) {
                    let _ = breaker.open(provider_name, model).await;
                }
                warn!(provider = %provider_name, model = %model, job_id, page_id, ?kind, detail, "step failed");
                let fatal = kind == FailureKind::Fatal;
                last_failure = Some((kind, detail));
                if fatal {
                    // A request-level rejection (bad/malformed request, non-429 4xx) will
                    // fail identically against every other provider/model in the chain.
                    break;
                }
            }
        }
    }

    match last_failure {
        Some((kind, detail)) => ChainOutcome::Exhausted { kind, detail },
        None => ChainOutcome::Exhausted {
            kind: FailureKind::Transient,
            detail: "no eligible provider/model step available (all breakers open)".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderModels;

    fn sample_config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.primary_provider = "openai".to_string();
        config.primary_models = ProviderModels {
            openai: Some("gpt-4o".to_string()),
            anthropic: Some("claude-sonnet-4-20250514".to_string()),
        };
        config.secondary_models = ProviderModels {
            openai: Some("gpt-4o-mini".to_string()),
            anthropic: Some("claude-3-5-haiku-20241022".to_string()),
        };
        config.fast_models = ProviderModels {
            openai: Some("gpt-4o-mini".to_string()),
            anthropic: Some("claude-3-5-haiku-20241022".to_string()),
        };
        config
    }

    #[test]
    fn build_chain_orders_primary_then_secondary_provider() {
        let config = sample_config();
        let chain = build_chain(&config, &config.primary_provider, false);
        assert_eq!(chain.len(), 4);
        assert_eq!(chain[0], ("openai".to_string(), "gpt-4o".to_string()));
        assert_eq!(chain[1], ("openai".to_string(), "gpt-4o-mini".to_string()));
        assert_eq!(chain[2], ("anthropic".to_string(), "claude-sonnet-4-20250514".to_string()));
        assert_eq!(chain[3], ("anthropic".to_string(), "claude-3-5-haiku-20241022".to_string()));
    }

    #[test]
    fn build_chain_hint_overrides_primary_provider() {
        let config = sample_config();
        let chain = build_chain(&config, "anthropic", false);
        assert_eq!(chain[0].0, "anthropic");
        assert_eq!(chain[2].0, "openai");
    }

    #[test]
    fn build_chain_force_fast_uses_fast_tier_for_primary_steps() {
        let config = sample_config();
        let chain = build_chain(&config, &config.primary_provider, true);
        // Steps 1/3 now use the fast tier, which happens to equal the
        // secondary tier in this config, so steps 2/4 collapse away.
        assert_eq!(chain, vec![
            ("openai".to_string(), "gpt-4o-mini".to_string()),
            ("anthropic".to_string(), "claude-3-5-haiku-20241022".to_string()),
        ]);
    }
}
