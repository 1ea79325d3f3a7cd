//! Per-(provider,model) circuit breaker registry (§4.2).
//!
//! State machine: `closed` (implicit, record absent) → `open` (requests
//! skipped until `retry_at`) → `half_open` (one probe allowed) → `closed`
//! (success) or back to `open` with a larger backoff (failure).
//!
//! Grounded on the pack's circuit-breaker vocabulary (`tower-resilience`'s
//! `CircuitBreakerConfig`/state terminology and `riptide-intelligence`'s
//! `IntelligenceError::CircuitOpen` failure signal) but backed by a shared
//! Redis hash per pair — `cb:{provider}:{model}` — rather than in-process
//! state, since the registry must be visible to every worker task.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Breaker state as persisted in the `cb:{provider}:{model}` hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// TTL on the breaker hash itself — a bounded inactivity window after which
/// a stale record (e.g. a crashed mover leaving `open` forever) expires back
/// to the implicit `closed` state.
const BREAKER_RECORD_TTL: Duration = Duration::from_secs(600);

fn breaker_key(provider: &str, model: &str) -> String {
    format!("cb:{provider}:{model}")
}

fn now_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// The circuit breaker registry, backed by Redis.
pub struct BreakerRegistry {
    client: redis::Client,
    base: Duration,
    max: Duration,
}

impl BreakerRegistry {
    pub fn new(redis_url: &str, base: Duration, max: Duration) -> Result<Self, crate::error::ServiceError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| crate::error::ServiceError::Queue(format!("invalid redis url: {e}")))?;
        Ok(Self { client, base, max })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, crate::error::ServiceError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(crate::error::ServiceError::from)
    }

    /// `IsOpen(p,m)`: performs the open→half_open transition if the cooldown
    /// has elapsed, and reports whether the caller should skip this attempt.
    pub async fn is_open(&self, provider: &str, model: &str) -> Result<bool, crate::error::ServiceError> {
        let mut conn = self.conn().await?;
        let key = breaker_key(provider, model);

        let fields: Vec<(String, String)> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(false); // implicit closed
        }
        let map: std::collections::HashMap<String, String> = fields.into_iter().collect();
        let state = map.get("state").map(String::as_str).unwrap_or("closed");
        let retry_at: u64 = map.get("retry_at").and_then(|s| s.parse().ok()).unwrap_or(0);

        match state {
            "open" => {
                if now_epoch() >= retry_at {
                    // Transition to half_open; one probe allowed.
                    let _: () = conn.hset(&key, "state", "half_open").await?;
                    debug!(provider, model, "breaker transitioned open -> half_open");
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
            "half_open" => Ok(false), // allow the probe through
            _ => Ok(false),
        }
    }

    /// `Open(p,m)`: record a transient failure, widening the backoff.
    pub async fn open(&self, provider: &str, model: &str) -> Result<(), crate::error::ServiceError> {
        let mut conn = self.conn().await?;
        let key = breaker_key(provider, model);

        let failures: u32 = conn
            .hget::<_, _, Option<String>>(&key, "failures")
            .await?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let failures = failures + 1;

        // retry_at = now + min(base * 2^(failures-1), max) — literal per §4.2,
        // including the `failures-1` exponent (an intentionally preserved
        // off-by-one choice; see DESIGN.md).
        let backoff_secs = self
            .base
            .as_secs()
            .saturating_mul(1u64.checked_shl(failures.saturating_sub(1)).unwrap_or(u64::MAX))
            .min(self.max.as_secs());
        let retry_at = now_epoch() + backoff_secs;

        let _: () = redis::pipe()
            .hset(&key, "state", "open")
            .ignore()
            .hset(&key, "retry_at", retry_at)
            .ignore()
            .hset(&key, "failures", failures)
            .ignore()
            .hset_nx(&key, "opened_at", now_epoch())
            .ignore()
            .expire(&key, BREAKER_RECORD_TTL.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        info!(provider, model, failures, retry_at, "breaker opened");
        Ok(())
    }

    /// `Close(p,m)`: a success resets the breaker — the record is deleted,
    /// returning the pair to the implicit `closed` state.
    pub async fn close(&self, provider: &str, model: &str) -> Result<(), crate::error::ServiceError> {
        let mut conn = self.conn().await?;
        let key = breaker_key(provider, model);
        let _: () = conn.del(&key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_formula_matches_spec() {
        // retry_at - now <= min(base * 2^(k-1), max) for k consecutive failures.
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        let expected = [30u64, 60, 120, 240, 300, 300];
        for (k, &want) in expected.iter().enumerate() {
            let failures = (k + 1) as u32;
            let backoff = base
                .as_secs()
                .saturating_mul(1u64.checked_shl(failures.saturating_sub(1)).unwrap_or(u64::MAX))
                .min(max.as_secs());
            assert_eq!(backoff, want, "failures={failures}");
        }
    }
}
