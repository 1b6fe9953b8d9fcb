//! Periodic-job lease election against the in-memory counter store.

use async_trait::async_trait;
use flashsale_cache::InMemoryCounterStore;
use flashsale_core::jobs::{spawn_periodic, JobLease, PeriodicJob};
use flashsale_core::store::CounterStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct TickJob {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl PeriodicJob for TickJob {
    fn name(&self) -> &'static str {
        "tick"
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(40)
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_only_one_holder_per_period() {
    let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
    let node_a = JobLease::new(store.clone(), "node-a");
    let node_b = JobLease::new(store.clone(), "node-b");
    let interval = Duration::from_millis(50);

    assert!(node_a.try_acquire("reconciliation", interval).await);
    assert!(!node_b.try_acquire("reconciliation", interval).await);
    assert_eq!(
        store.get("jobs:lease:reconciliation").await.unwrap().as_deref(),
        Some("node-a")
    );

    // The lease lapses before the next tick.
    tokio::time::sleep(interval).await;
    assert!(node_b.try_acquire("reconciliation", interval).await);
}

#[tokio::test]
async fn test_two_replicas_do_not_double_run_a_tick() {
    let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    let handles: Vec<_> = ["node-a", "node-b"]
        .into_iter()
        .map(|node| {
            spawn_periodic(
                Arc::new(TickJob { runs: runs.clone() }),
                Some(JobLease::new(store.clone(), node)),
                cancel.clone(),
            )
        })
        .collect();

    // Both replicas tick immediately; only one of them may run.
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
