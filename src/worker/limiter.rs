//! Local in-process concurrency cap per (provider, model) (§4.2): bounds how
//! many failover attempts against one provider/model pair this worker
//! process has outstanding at once. Independent of the [`crate::breaker`]
//! registry, which is cross-process and failure-driven rather than
//! capacity-driven. A non-admitted call is treated as "skipped", the same
//! as an open breaker, and the chain falls through to the next step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct InflightLimiter {
    max_per_model: usize,
    semaphores: Mutex<HashMap<(String, String), Arc<Semaphore>>>,
}

impl InflightLimiter {
    pub fn new(max_per_model: usize) -> Self {
        Self {
            max_per_model: max_per_model.max(1),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore_for(&self, provider: &str, model: &str) -> Arc<Semaphore> {
        let mut map = self.semaphores.lock().unwrap();
        map.entry((provider.to_string(), model.to_string()))
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_model)))
            .clone()
    }

    /// Try to admit one in-flight call for (provider, model). `None` means
    /// the cap is saturated; the caller should skip this step. The returned
    /// permit releases its slot when dropped.
    pub fn try_admit(&self, provider: &str, model: &str) -> Option<OwnedSemaphorePermit> {
        self.semaphore_for(provider, model).try_acquire_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_configured_cap() {
        let limiter = InflightLimiter::new(2);
        let a = limiter.try_admit("openai", "gpt-4o");
        let b = limiter.try_admit("openai", "gpt-4o");
        let c = limiter.try_admit("openai", "gpt-4o");
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
    }

    #[test]
    fn releasing_a_permit_frees_a_slot() {
        let limiter = InflightLimiter::new(1);
        let a = limiter.try_admit("openai", "gpt-4o");
        assert!(a.is_some());
        drop(a);
        let b = limiter.try_admit("openai", "gpt-4o");
        assert!(b.is_some());
    }

    #[test]
    fn distinct_model_pairs_have_independent_caps() {
        let limiter = InflightLimiter::new(1);
        let a = limiter.try_admit("openai", "gpt-4o");
        let b = limiter.try_admit("anthropic", "claude-sonnet-4-20250514");
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
