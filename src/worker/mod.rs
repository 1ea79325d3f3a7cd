//! AI dispatch worker (§4.3): the consumer-group loop that pulls
//! [`crate::queue::PageWorkItem`]s, runs the failover chain, and reports the
//! outcome back to the job controller before acking.

pub mod failover;
pub mod limiter;

use crate::breaker::BreakerRegistry;
use crate::config::ServiceConfig;
use crate::controller;
use crate::metrics::Metrics;
use crate::objectstore::ObjectStore;
use crate::pages::PageStore;
use crate::providers::ProviderClient;
use crate::queue::{PageWorkItem, Queue};
use crate::status::StatusStore;
use base64::Engine;
use limiter::InflightLimiter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

pub struct WorkerContext {
    pub queue: Arc<dyn Queue>,
    pub status: Arc<StatusStore>,
    pub pages: Arc<PageStore>,
    pub breaker: Arc<BreakerRegistry>,
    pub providers: HashMap<String, Arc<dyn ProviderClient>>,
    pub config: Arc<ServiceConfig>,
    pub metrics: Arc<Metrics>,
    pub object_store: Arc<dyn ObjectStore>,
    pub inflight: Arc<InflightLimiter>,
}

/// Run one worker's dequeue loop until `shutdown` resolves. `consumer_id`
/// must be unique across the fleet (used for `XREADGROUP`/`XCLAIM` identity).
pub async fn run(
    ctx: Arc<WorkerContext>,
    consumer_id: String,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let block = Duration::from_millis(2000);
    loop {
        if *shutdown.borrow() {
            info!(consumer_id, "worker shutting down");
            return;
        }

        let delivery = tokio::select! {
            res = ctx.queue.dequeue(&consumer_id, block) => res,
            _ = shutdown.changed() => continue,
        };

        let delivery = match delivery {
            Ok(Some(d)) => d,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "dequeue failed, backing off");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let msg_id = delivery.msg_id.clone();
        if let Err(e) = handle_item(&ctx, delivery.payload).await {
            error!(error = %e, "error while handling page item");
        }
        if let Err(e) = ctx.queue.ack(&msg_id).await {
            error!(error = %e, "failed to ack message");
        }
    }
}

async fn handle_item(ctx: &Arc<WorkerContext>, item: PageWorkItem) -> Result<(), crate::error::ServiceError> {
    if ctx.queue.is_cancelled(&item.job_id).await.unwrap_or(false) {
        info!(job_id = %item.job_id, page_id = item.page_id, "skipping cancelled job's page");
        return Ok(());
    }
    if ctx.queue.is_idem_done(&item.idempotency_key).await.unwrap_or(false) {
        info!(job_id = %item.job_id, page_id = item.page_id, "page already reported done, skipping");
        return Ok(());
    }

    let primary_provider = item.ai_engine_hint.as_deref().unwrap_or(&ctx.config.primary_provider);
    let chain = failover::build_chain(&ctx.config, primary_provider, item.force_fast);

    let image_bytes_base64 = if item.image_bytes.is_empty() { None } else { Some(item.image_bytes.as_str()) };
    let image_mime = if item.image_mime.is_empty() { None } else { Some(item.image_mime.as_str()) };

    let deadline = ctx.config.request_timeout;
    let start = SystemTime::now();
    ctx.metrics.page_attempts_total.inc();

    let outcome = tokio::time::timeout(
        deadline,
        failover::run_chain(
            &chain,
            &ctx.providers,
            &ctx.breaker,
            &ctx.inflight,
            deadline,
            &item.job_id,
            item.page_id,
            &item.system_prompt,
            &item.context_text,
            &item.mupdf_text,
            image_bytes_base64,
            image_mime,
        ),
    )
    .await;

    let elapsed = start.elapsed().unwrap_or_default();
    ctx.metrics.page_latency_seconds.observe(elapsed.as_secs_f64());

    match outcome {
        Ok(failover::ChainOutcome::Success { text, provider, model }) => {
            ctx.metrics.pages_succeeded_total.inc();
            controller::report_page_done(ctx, &item, text, provider, model).await
        }
        Ok(failover::ChainOutcome::Exhausted { kind, detail }) => {
            ctx.metrics.pages_failed_total.inc();
            controller::report_page_failed(ctx, &item, kind, detail).await
        }
        Err(_) => {
            ctx.metrics.pages_failed_total.inc();
            warn!(job_id = %item.job_id, page_id = item.page_id, "overall per-page deadline exceeded");
            controller::report_page_failed(
                ctx,
                &item,
                crate::error::FailureKind::Timeout,
                "overall page deadline exceeded".to_string(),
            )
            .await
        }
    }
}

/// Base64-encode raw JPEG bytes for a [`PageWorkItem`] payload.
pub fn encode_image(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
