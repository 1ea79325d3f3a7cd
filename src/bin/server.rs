//! Composition root for the document pipeline service: builds every shared
//! component once, spawns the delayed-retry mover and the worker pool,
//! serves the HTTP surface, and drains on SIGINT/SIGTERM.

use clap::Parser;
use edgequake_docpipe::breaker::BreakerRegistry;
use edgequake_docpipe::config::ServiceConfig;
use edgequake_docpipe::http;
use edgequake_docpipe::metrics::Metrics;
use edgequake_docpipe::objectstore::LocalObjectStore;
use edgequake_docpipe::pages::PageStore;
use edgequake_docpipe::providers::anthropic::AnthropicProvider;
use edgequake_docpipe::providers::openai::OpenAiProvider;
use edgequake_docpipe::providers::ProviderClient;
use edgequake_docpipe::queue::{delayed_mover, RedisQueue};
use edgequake_docpipe::status::StatusStore;
use edgequake_docpipe::worker::limiter::InflightLimiter;
use edgequake_docpipe::worker::{self, WorkerContext};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_DRAIN_SECS: u64 = 10;

#[derive(Debug, Parser)]
#[command(name = "docpipe-server", about = "Distributed document-to-text AI pipeline service")]
struct Args {
    /// Address to bind the HTTP surface to.
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<String>,

    /// Redis connection URL backing the queue, status, page and breaker stores.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Root directory for the local object store stand-in.
    #[arg(long, env = "OBJECT_STORE_ROOT")]
    object_store_root: Option<std::path::PathBuf>,

    /// Number of concurrent AI-dispatch worker loops.
    #[arg(long, env = "WORKER_CONCURRENCY")]
    worker_concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = ServiceConfig::from_env()?;
    if let Some(v) = args.bind_addr {
        config.bind_addr = v;
    }
    if let Some(v) = args.redis_url {
        config.redis_url = v;
    }
    if let Some(v) = args.object_store_root {
        config.object_store_root = v;
    }
    if let Some(v) = args.worker_concurrency {
        config.worker_concurrency = v.max(1);
    }
    let config = Arc::new(config);
    info!(?config, "starting docpipe-server");

    let queue = Arc::new(RedisQueue::new(&config.redis_url)?);
    queue.init().await?;
    let status = Arc::new(StatusStore::new(&config.redis_url)?);
    let pages = Arc::new(PageStore::new(&config.redis_url)?);
    let breaker = Arc::new(BreakerRegistry::new(&config.redis_url, config.breaker_base, config.breaker_max)?);
    let object_store = Arc::new(LocalObjectStore::new(config.object_store_root.clone()));
    let metrics = Arc::new(Metrics::new());

    let mut providers: HashMap<String, Arc<dyn ProviderClient>> = HashMap::new();
    if let Some(key) = &config.openai_api_key {
        providers.insert("openai".to_string(), Arc::new(OpenAiProvider::new(key.clone())));
    }
    if let Some(key) = &config.anthropic_api_key {
        providers.insert("anthropic".to_string(), Arc::new(AnthropicProvider::new(key.clone())));
    }
    if providers.is_empty() {
        error!("no provider API keys configured; set OPENAI_API_KEY and/or ANTHROPIC_API_KEY");
        anyhow::bail!("no AI providers configured");
    }

    let inflight = Arc::new(InflightLimiter::new(config.max_inflight_per_model));

    let ctx = Arc::new(WorkerContext {
        queue: queue.clone(),
        status,
        pages,
        breaker,
        providers,
        config: config.clone(),
        metrics,
        object_store,
        inflight,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(delayed_mover::run(queue.clone(), config.delayed_mover_interval));

    let mut worker_handles = Vec::with_capacity(config.worker_concurrency);
    for i in 0..config.worker_concurrency {
        let consumer_id = format!("worker-{}-{i}", std::process::id());
        let ctx = ctx.clone();
        let rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(worker::run(ctx, consumer_id, rx)));
    }

    let app = http::router(ctx.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    server.await?;

    info!("http server stopped, draining workers");
    let _ = shutdown_tx.send(true);
    let drain = tokio::time::timeout(
        std::time::Duration::from_secs(SHUTDOWN_DRAIN_SECS),
        futures::future::join_all(worker_handles),
    )
    .await;
    if drain.is_err() {
        error!("worker drain exceeded {SHUTDOWN_DRAIN_SECS}s, exiting anyway");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining within budget");
}
