//! Prometheus metrics (§6 `/metrics`): counters and histograms for provider
//! dispatch, page outcomes, retries, breaker transitions and queue depths.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,
    pub page_attempts_total: IntCounter,
    pub pages_succeeded_total: IntCounter,
    pub pages_failed_total: IntCounter,
    pub page_retries_total: IntCounter,
    pub page_latency_seconds: Histogram,
    pub breaker_opens_total: IntCounterVec,
    pub provider_requests_total: IntCounterVec,
    pub queue_stream_depth: IntGauge,
    pub queue_delayed_depth: IntGauge,
    pub queue_dlq_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let page_attempts_total =
            IntCounter::new("docpipe_page_attempts_total", "Total AI dispatch attempts across all pages").unwrap();
        let pages_succeeded_total =
            IntCounter::new("docpipe_pages_succeeded_total", "Pages that completed via AI or MuPDF text").unwrap();
        let pages_failed_total =
            IntCounter::new("docpipe_pages_failed_total", "Pages that exhausted the failover chain or timed out").unwrap();
        let page_retries_total =
            IntCounter::new("docpipe_page_retries_total", "Pages rescheduled onto the delayed retry set").unwrap();
        let page_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("docpipe_page_latency_seconds", "End-to-end page dispatch latency")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )
        .unwrap();
        let breaker_opens_total = IntCounterVec::new(
            Opts::new("docpipe_breaker_opens_total", "Circuit breaker open transitions"),
            &["provider", "model"],
        )
        .unwrap();
        let provider_requests_total = IntCounterVec::new(
            Opts::new("docpipe_provider_requests_total", "Requests sent per provider/model/outcome"),
            &["provider", "model", "outcome"],
        )
        .unwrap();
        let queue_stream_depth = IntGauge::new("docpipe_queue_stream_depth", "Pending entries in the main dispatch stream").unwrap();
        let queue_delayed_depth = IntGauge::new("docpipe_queue_delayed_depth", "Entries waiting in the delayed retry set").unwrap();
        let queue_dlq_depth = IntGauge::new("docpipe_queue_dlq_depth", "Entries in the dead letter queue").unwrap();

        for c in [&page_attempts_total, &pages_succeeded_total, &pages_failed_total, &page_retries_total] {
            registry.register(Box::new(c.clone())).unwrap();
        }
        registry.register(Box::new(page_latency_seconds.clone())).unwrap();
        registry.register(Box::new(breaker_opens_total.clone())).unwrap();
        registry.register(Box::new(provider_requests_total.clone())).unwrap();
        for g in [&queue_stream_depth, &queue_delayed_depth, &queue_dlq_depth] {
            registry.register(Box::new(g.clone())).unwrap();
        }

        Self {
            registry,
            page_attempts_total,
            pages_succeeded_total,
            pages_failed_total,
            page_retries_total,
            page_latency_seconds,
            breaker_opens_total,
            provider_requests_total,
            queue_stream_depth,
            queue_delayed_depth,
            queue_dlq_depth,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
