//! Periodic background jobs with explicit cancellation.
//!
//! Jobs are plain Tokio tasks driven by an interval. They are not tied to any
//! request. Each may be guarded by a [`JobLease`] so that only one replica
//! runs it per period.

use crate::keys;
use crate::store::CounterStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run_once(&self) -> anyhow::Result<()>;
}

/// Counter-store lease that elects one runner per period.
///
/// The lease key expires just before the next tick, so every tick is a fresh
/// election and a crashed holder never blocks the job for longer than one
/// period.
#[derive(Clone)]
pub struct JobLease {
    store: Arc<dyn CounterStore>,
    holder: String,
}

impl JobLease {
    pub fn new(store: Arc<dyn CounterStore>, holder: impl Into<String>) -> Self {
        Self {
            store,
            holder: holder.into(),
        }
    }

    /// Lease lifetime for a job ticking every `interval`.
    pub fn ttl_for(interval: Duration) -> Duration {
        let ttl = interval.mul_f64(0.9);
        if ttl.is_zero() {
            Duration::from_millis(1)
        } else {
            ttl
        }
    }

    /// Try to take the lease for `job`. Store failures count as not acquired.
    pub async fn try_acquire(&self, job: &str, interval: Duration) -> bool {
        let key = keys::job_lease(job);
        match self
            .store
            .set_if_absent(&key, &self.holder, Some(Self::ttl_for(interval)))
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(job = job, error = %e, "Failed to acquire job lease, skipping run");
                false
            }
        }
    }
}

/// Spawn `job` on its interval until `cancel` fires.
///
/// The first run happens on the first tick, immediately after spawning. A
/// failed run is logged and the loop continues.
pub fn spawn_periodic(
    job: Arc<dyn PeriodicJob>,
    lease: Option<JobLease>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = job.name();
        let period = job.interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(job = name, interval_ms = period.as_millis() as u64, "Periodic job started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Some(lease) = &lease {
                if !lease.try_acquire(name, period).await {
                    debug!(job = name, "Lease held elsewhere, skipping run");
                    metrics::counter!("jobs.skipped").increment(1);
                    continue;
                }
            }

            match job.run_once().await {
                Ok(()) => {
                    metrics::counter!("jobs.completed").increment(1);
                }
                Err(e) => {
                    metrics::counter!("jobs.failed").increment(1);
                    error!(job = name, error = %e, "Periodic job run failed");
                }
            }
        }

        info!(job = name, "Periodic job stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run_once(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_job_runs_until_cancelled() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let cancel = CancellationToken::new();
        let handle = spawn_periodic(job.clone(), None, cancel.clone());

        tokio::time::sleep(Duration::from_millis(55)).await;
        cancel.cancel();
        handle.await.unwrap();

        let runs = job.runs.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected several runs, got {runs}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn test_failed_runs_do_not_stop_the_loop() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let cancel = CancellationToken::new();
        let handle = spawn_periodic(job.clone(), None, cancel.clone());

        tokio::time::sleep(Duration::from_millis(45)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(job.runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_lease_ttl_is_below_interval() {
        let ttl = JobLease::ttl_for(Duration::from_secs(120));
        assert!(ttl < Duration::from_secs(120));
        assert_eq!(JobLease::ttl_for(Duration::ZERO), Duration::from_millis(1));
    }
}
