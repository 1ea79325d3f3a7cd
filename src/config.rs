//! Configuration for the document pipeline service.
//!
//! All runtime behaviour is controlled through [`ServiceConfig`], built via
//! its [`ServiceConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configuration across tasks, log it at startup, and diff
//! two deployments to understand why their behavior differs.
//!
//! # Design choice: builder over constructor
//! A twenty-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! well-documented defaults — identical in spirit to `ConversionConfigBuilder`
//! in the PDF-to-Markdown conversion library this service grew out of.

use crate::error::ServiceError;
use std::fmt;
use std::time::Duration;

/// Configuration for the whole service: queue connection, timeouts,
/// provider/model failover table, and object-store root.
///
/// Built via [`ServiceConfig::builder()`] or [`ServiceConfig::from_env()`].
#[derive(Clone)]
pub struct ServiceConfig {
    /// Redis connection string backing the queue, status store, page store,
    /// breaker registry, cancellation set and idempotency keyset.
    pub redis_url: String,

    /// Root directory for the local-filesystem object store stand-in.
    pub object_store_root: std::path::PathBuf,

    /// Default container (bucket) used when a bare key is submitted without
    /// a `scheme://bucket/` prefix.
    pub default_container: String,

    /// Number of concurrent AI worker tasks. Default: 8.
    pub worker_concurrency: usize,

    /// Per-page overall deadline, bounding the whole failover chain. Default: 120s.
    pub request_timeout: Duration,

    /// Job-level monitor deadline; on expiry, partial finalization runs. Default: 300s.
    pub job_timeout: Duration,

    /// Office-to-PDF external-process budget. Default: 180s.
    pub libreoffice_timeout: Duration,

    /// Maximum requeue attempts before a page is sent to the DLQ. Default: 3.
    pub job_max_attempts: u32,

    /// Base requeue backoff. Default: 500ms, doubling per attempt, capped at `max_retry_backoff`.
    pub retry_backoff_base: Duration,

    /// Cap on requeue backoff. Default: 5 minutes.
    pub max_retry_backoff: Duration,

    /// Circuit breaker base cooldown. Default: 30s.
    pub breaker_base: Duration,

    /// Circuit breaker cooldown cap. Default: 5 minutes.
    pub breaker_max: Duration,

    /// Idempotency mark TTL. Default: 24h.
    pub idempotency_ttl: Duration,

    /// MuPDF pre-store TTL. Default: 24h.
    pub mupdf_cache_ttl: Duration,

    /// File→job mapping TTL. Default: 7 days.
    pub file_to_job_ttl: Duration,

    /// Delayed-mover poll interval. Default: 150ms.
    pub delayed_mover_interval: Duration,

    /// Monitor poll interval. Default: 2s.
    pub monitor_interval: Duration,

    /// DPI used when rasterising pages to JPEG for AI dispatch. Default: 100.
    pub render_dpi: u32,

    /// JPEG quality used when encoding rendered pages. Default: 70.
    pub jpeg_quality: u8,

    /// Minimum whitespace-stripped character count for a document to be
    /// considered "has extractable text". Default: 300.
    pub extractable_text_threshold: usize,

    /// Byte limit for the `context_text` field before truncation. Default: 4000.
    pub context_text_limit: usize,

    /// Local, in-process concurrency cap per (provider, model) pair (§4.2):
    /// bounds how many failover attempts against one provider/model this
    /// worker process has outstanding at once, independent of the
    /// cross-process circuit breaker. Default: 4.
    pub max_inflight_per_model: usize,

    /// OpenAI API key, if configured.
    pub openai_api_key: Option<String>,
    /// Anthropic API key, if configured.
    pub anthropic_api_key: Option<String>,

    /// Primary-tier model per provider, keyed by provider name (`openai`, `anthropic`).
    pub primary_models: ProviderModels,
    /// Secondary-tier model per provider, tried after the primary model fails.
    pub secondary_models: ProviderModels,
    /// Fast-tier model per provider, used when a job requests `force_fast`.
    pub fast_models: ProviderModels,

    /// Default provider to try first, absent a per-job hint. Default: `openai`.
    pub primary_provider: String,

    /// HTTP bind address for the server. Default: `0.0.0.0:8080`.
    pub bind_addr: String,
}

/// Per-provider model table (provider name → model id).
#[derive(Debug, Clone, Default)]
pub struct ProviderModels {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
}

impl ProviderModels {
    pub fn get(&self, provider: &str) -> Option<&str> {
        match provider {
            "openai" => self.openai.as_deref(),
            "anthropic" => self.anthropic.as_deref(),
            _ => None,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            object_store_root: std::env::temp_dir().join("edgequake-docpipe-objects"),
            default_container: "documents".to_string(),
            worker_concurrency: 8,
            request_timeout: Duration::from_secs(120),
            job_timeout: Duration::from_secs(300),
            libreoffice_timeout: Duration::from_secs(180),
            job_max_attempts: 3,
            retry_backoff_base: Duration::from_millis(500),
            max_retry_backoff: Duration::from_secs(300),
            breaker_base: Duration::from_secs(30),
            breaker_max: Duration::from_secs(300),
            idempotency_ttl: Duration::from_secs(24 * 3600),
            mupdf_cache_ttl: Duration::from_secs(24 * 3600),
            file_to_job_ttl: Duration::from_secs(7 * 24 * 3600),
            delayed_mover_interval: Duration::from_millis(150),
            monitor_interval: Duration::from_secs(2),
            render_dpi: 100,
            jpeg_quality: 70,
            extractable_text_threshold: 300,
            context_text_limit: 4000,
            max_inflight_per_model: 4,
            openai_api_key: None,
            anthropic_api_key: None,
            primary_models: ProviderModels {
                openai: Some("gpt-4o".to_string()),
                anthropic: Some("claude-sonnet-4-20250514".to_string()),
            },
            secondary_models: ProviderModels {
                openai: Some("gpt-4o-mini".to_string()),
                anthropic: Some("claude-3-5-haiku-20241022".to_string()),
            },
            fast_models: ProviderModels {
                openai: Some("gpt-4o-mini".to_string()),
                anthropic: Some("claude-3-5-haiku-20241022".to_string()),
            },
            primary_provider: "openai".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("redis_url", &self.redis_url)
            .field("object_store_root", &self.object_store_root)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("request_timeout", &self.request_timeout)
            .field("job_timeout", &self.job_timeout)
            .field("job_max_attempts", &self.job_max_attempts)
            .field("breaker_base", &self.breaker_base)
            .field("breaker_max", &self.breaker_max)
            .field("primary_provider", &self.primary_provider)
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "<redacted>"))
            .field("anthropic_api_key", &self.anthropic_api_key.as_ref().map(|_| "<redacted>"))
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`, seeded with defaults.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset. Mirrors the layering the donor CLI does
    /// with clap `env` attributes.
    pub fn from_env() -> Result<Self, ServiceError> {
        let mut b = Self::builder();
        if let Ok(v) = std::env::var("REDIS_URL") {
            b = b.redis_url(v);
        }
        if let Ok(v) = std::env::var("OBJECT_STORE_ROOT") {
            b = b.object_store_root(v.into());
        }
        if let Ok(v) = std::env::var("WORKER_CONCURRENCY") {
            b = b.worker_concurrency(v.parse().map_err(|_| {
                ServiceError::InvalidConfig("WORKER_CONCURRENCY must be an integer".into())
            })?);
        }
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT_SECS") {
            let secs: u64 = v
                .parse()
                .map_err(|_| ServiceError::InvalidConfig("REQUEST_TIMEOUT_SECS must be an integer".into()))?;
            b = b.request_timeout(Duration::from_secs(secs));
        }
        if let Ok(v) = std::env::var("JOB_TIMEOUT_SECS") {
            let secs: u64 = v
                .parse()
                .map_err(|_| ServiceError::InvalidConfig("JOB_TIMEOUT_SECS must be an integer".into()))?;
            b = b.job_timeout(Duration::from_secs(secs));
        }
        if let Ok(v) = std::env::var("MAX_INFLIGHT_PER_MODEL") {
            b = b.max_inflight_per_model(v.parse().map_err(|_| {
                ServiceError::InvalidConfig("MAX_INFLIGHT_PER_MODEL must be an integer".into())
            })?);
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            b = b.openai_api_key(v);
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            b = b.anthropic_api_key(v);
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            b = b.bind_addr(v);
        }
        b.build()
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis_url = url.into();
        self
    }

    pub fn object_store_root(mut self, path: std::path::PathBuf) -> Self {
        self.config.object_store_root = path;
        self
    }

    pub fn default_container(mut self, name: impl Into<String>) -> Self {
        self.config.default_container = name.into();
        self
    }

    pub fn worker_concurrency(mut self, n: usize) -> Self {
        self.config.worker_concurrency = n.max(1);
        self
    }

    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.config.request_timeout = d;
        self
    }

    pub fn job_timeout(mut self, d: Duration) -> Self {
        self.config.job_timeout = d;
        self
    }

    pub fn libreoffice_timeout(mut self, d: Duration) -> Self {
        self.config.libreoffice_timeout = d;
        self
    }

    pub fn job_max_attempts(mut self, n: u32) -> Self {
        self.config.job_max_attempts = n.max(1);
        self
    }

    pub fn breaker_base(mut self, d: Duration) -> Self {
        self.config.breaker_base = d;
        self
    }

    pub fn breaker_max(mut self, d: Duration) -> Self {
        self.config.breaker_max = d;
        self
    }

    pub fn max_inflight_per_model(mut self, n: usize) -> Self {
        self.config.max_inflight_per_model = n.max(1);
        self
    }

    pub fn openai_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.openai_api_key = Some(key.into());
        self
    }

    pub fn anthropic_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.anthropic_api_key = Some(key.into());
        self
    }

    pub fn primary_provider(mut self, provider: impl Into<String>) -> Self {
        self.config.primary_provider = provider.into();
        self
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, ServiceError> {
        let c = &self.config;
        if c.worker_concurrency == 0 {
            return Err(ServiceError::InvalidConfig("worker_concurrency must be >= 1".into()));
        }
        if c.job_max_attempts == 0 {
            return Err(ServiceError::InvalidConfig("job_max_attempts must be >= 1".into()));
        }
        if c.primary_provider != "openai" && c.primary_provider != "anthropic" {
            return Err(ServiceError::InvalidConfig(format!(
                "primary_provider must be 'openai' or 'anthropic', got '{}'",
                c.primary_provider
            )));
        }
        Ok(self.config)
    }
}
