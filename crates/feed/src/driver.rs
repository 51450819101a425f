//! Change-feed driver: pump `watch()` into the registry, reconnect with backoff.

use std::time::Duration;

use futures::StreamExt;
use lumen_core::LumenError;
use lumen_store::Registry;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Aborts the driver task when cancelled.
pub struct FeedHandle {
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }

    pub fn is_finished(&self) -> bool { self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true) }
}

/// Start the driver on the registry's runtime. Events are dispatched one at
/// a time, each awaited before the next is read.
pub fn run_feed(registry: Registry) -> FeedHandle {
    let task = registry.runtime().clone().spawn(drive(registry));
    FeedHandle { task: Some(task) }
}

async fn drive(registry: Registry) {
    let initial = registry.config().watch_backoff_initial;
    let max = registry.config().watch_backoff_max;
    let mut backoff = initial;
    // Set once any connection attempt or stream has failed.
    let mut degraded = false;
    loop {
        match registry.source().watch().await {
            Ok(mut stream) => {
                backoff = initial;
                if degraded {
                    info!(entries = registry.len(), "change feed reconnected");
                    registry.resync().await;
                } else {
                    info!("change feed connected");
                }
                let cause = loop {
                    match stream.next().await {
                        Some(Ok(raw)) => {
                            registry.on_raw_event(&raw).await;
                        }
                        Some(Err(e)) => break LumenError::unavailable(&e),
                        None => break LumenError::SourceUnavailable("change stream ended".into()),
                    }
                };
                registry.report_fault(None, cause);
            }
            Err(e) => registry.report_fault(None, LumenError::unavailable(&e)),
        }
        degraded = true;
        counter!("lumen_feed_reconnects_total", 1u64);
        warn!(backoff_ms = %backoff.as_millis(), "change feed down; retrying");
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff, max);
    }
}

fn next_backoff(cur: Duration, max: Duration) -> Duration { cur.saturating_mul(2).min(max) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let max = Duration::from_secs(2);
        let mut b = Duration::from_millis(500);
        let mut seen = Vec::new();
        for _ in 0..4 {
            b = next_backoff(b, max);
            seen.push(b.as_millis());
        }
        assert_eq!(seen, vec![1000, 2000, 2000, 2000]);
    }
}
