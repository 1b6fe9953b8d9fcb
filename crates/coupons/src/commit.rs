//! Asynchronous "mark used" writes for claimed coupons.
//!
//! Claims are committed to the durable store off the request path through a
//! bounded channel. Each write is retried with a fixed backoff. On
//! cancellation the worker drains what is already queued before exiting;
//! jobs still queued when the process dies are lost, and the claim key is
//! then the only record of the redemption until it expires.

use crate::metadata::CouponMetadataCache;
use flashsale_core::config::CouponConfig;
use flashsale_core::store::CouponRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle for queueing mark-used writes. Cheap to clone.
#[derive(Clone)]
pub struct UsageCommitter {
    sender: mpsc::Sender<String>,
}

impl UsageCommitter {
    /// Create the queue and spawn its background worker.
    pub fn spawn(
        coupons: Arc<dyn CouponRepository>,
        metadata: Arc<CouponMetadataCache>,
        config: &CouponConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel::<String>(config.commit_queue_capacity.max(1));

        let worker = CommitWorker {
            coupons,
            metadata,
            max_attempts: config.commit_max_attempts.max(1),
            backoff: config.commit_retry_backoff(),
        };
        let handle = tokio::spawn(worker.run(receiver, cancel));

        info!(
            capacity = config.commit_queue_capacity,
            max_attempts = config.commit_max_attempts,
            "Coupon usage committer started"
        );
        (Self { sender }, handle)
    }

    /// Queue `code` to be marked used (non-blocking). Returns `false` if the
    /// job was dropped.
    pub fn submit(&self, code: &str) -> bool {
        if let Err(e) = self.sender.try_send(code.to_string()) {
            metrics::counter!("coupon.commit_dropped").increment(1);
            warn!(code = %code, "Coupon commit dropped: {}", e);
            false
        } else {
            metrics::counter!("coupon.commit_queued").increment(1);
            true
        }
    }
}

struct CommitWorker {
    coupons: Arc<dyn CouponRepository>,
    metadata: Arc<CouponMetadataCache>,
    max_attempts: u32,
    backoff: Duration,
}

impl CommitWorker {
    async fn run(self, mut receiver: mpsc::Receiver<String>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                job = receiver.recv() => match job {
                    Some(code) => self.commit(&code).await,
                    None => return,
                },
            }
        }

        receiver.close();
        let mut drained = 0usize;
        while let Some(code) = receiver.recv().await {
            self.commit(&code).await;
            drained += 1;
        }
        info!(drained = drained, "Coupon usage committer stopped");
    }

    async fn commit(&self, code: &str) {
        for attempt in 1..=self.max_attempts {
            match self.coupons.mark_used(code).await {
                Ok(true) => {
                    self.metadata.invalidate(code).await;
                    metrics::counter!("coupon.committed").increment(1);
                    debug!(code = %code, attempt = attempt, "Coupon marked used");
                    return;
                }
                Ok(false) => {
                    metrics::counter!("coupon.commit_failed").increment(1);
                    warn!(code = %code, "Coupon disappeared before it could be marked used");
                    return;
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!(code = %code, attempt = attempt, error = %e, "Coupon commit failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => {
                    metrics::counter!("coupon.commit_failed").increment(1);
                    error!(
                        code = %code,
                        attempts = attempt,
                        error = %e,
                        "Coupon commit abandoned"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use flashsale_cache::InMemoryCounterStore;
    use flashsale_core::types::CouponRecord;
    use flashsale_store::InMemoryDurableStore;

    fn config(max_attempts: u32) -> CouponConfig {
        CouponConfig {
            commit_max_attempts: max_attempts,
            commit_retry_backoff_ms: 1,
            ..CouponConfig::default()
        }
    }

    fn setup(max_attempts: u32) -> (Arc<InMemoryDurableStore>, UsageCommitter, JoinHandle<()>, CancellationToken) {
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.upsert_coupon(CouponRecord {
            code: "C1".into(),
            discount: 10,
            valid_until: Utc::now() + ChronoDuration::days(1),
            used: false,
        });
        let metadata = Arc::new(CouponMetadataCache::new(
            Arc::new(InMemoryCounterStore::new()),
            durable.clone(),
        ));
        let cancel = CancellationToken::new();
        let (committer, handle) =
            UsageCommitter::spawn(durable.clone(), metadata, &config(max_attempts), cancel.clone());
        (durable, committer, handle, cancel)
    }

    #[tokio::test]
    async fn test_retries_until_write_succeeds() {
        let (durable, committer, handle, cancel) = setup(5);
        durable.fail_next_writes(3);

        assert!(committer.submit("C1"));
        cancel.cancel();
        handle.await.unwrap();

        assert!(durable.find_coupon("C1").await.unwrap().unwrap().used);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (durable, committer, handle, cancel) = setup(2);
        durable.fail_next_writes(2);

        assert!(committer.submit("C1"));
        cancel.cancel();
        handle.await.unwrap();

        assert!(!durable.find_coupon("C1").await.unwrap().unwrap().used);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let (_, committer, handle, cancel) = setup(1);
        cancel.cancel();
        handle.await.unwrap();

        assert!(!committer.submit("C1"));
    }
}
