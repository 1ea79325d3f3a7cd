//! The delayed mover: a single logical background task that promotes due
//! entries from the delayed set to the main stream (§4.1).
//!
//! Runs as an independent `tokio::spawn` task, the same shape the controller
//! monitor and worker loop use — a `loop { sleep; do_work }` tied to the
//! process lifetime, not to any individual job.

use super::Queue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

const BATCH_LIMIT: usize = 100;

/// Run the delayed-mover loop forever, polling every `interval`.
///
/// Multiple movers running concurrently is safe: `ZRANGEBYSCORE` + `XADD` +
/// `ZREM` may race and move the same entry twice, but duplicate page work
/// items are absorbed downstream by the idempotency keyset.
pub async fn run(queue: Arc<dyn Queue>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match queue.move_due_delayed(BATCH_LIMIT).await {
            Ok(0) => {}
            Ok(n) => debug!(moved = n, "delayed mover promoted due entries"),
            Err(e) => error!(error = %e, "delayed mover tick failed"),
        }
    }
}
