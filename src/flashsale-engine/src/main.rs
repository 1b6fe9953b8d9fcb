//! Flash-sale engine: atomic stock reservation, single-use coupons and the
//! background jobs that keep cached state consistent.
//!
//! Main entry point that wires the stores and services and runs the jobs
//! until interrupted.

use anyhow::Context;
use clap::Parser;
use flashsale_cache::{InMemoryCounterStore, RedisCounterStore};
use flashsale_catalog::{FlashSaleWindowCache, PopularityRefreshJob, ProductDetailCache};
use flashsale_core::config::AppConfig;
use flashsale_core::jobs::{spawn_periodic, JobLease};
use flashsale_core::types::OrderLine;
use flashsale_core::CounterStore;
use flashsale_coupons::{CouponLockService, CouponMetadataCache, UsageCommitter};
use flashsale_inventory::{
    CounterPreloader, FlashSaleCheckout, StockReconciliationJob, StockReservationService,
};
use flashsale_store::InMemoryDurableStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "flashsale-engine")]
#[command(about = "Flash-sale inventory reservation and cache-consistency engine")]
#[command(version)]
struct Cli {
    /// Node identifier, also the job lease holder (overrides config)
    #[arg(long, env = "FLASHSALE__NODE_ID")]
    node_id: Option<String>,

    /// Use the in-process counter store instead of Redis
    #[arg(long, default_value_t = false)]
    in_memory: bool,

    /// Do not run the periodic jobs on this node
    #[arg(long, default_value_t = false)]
    no_jobs: bool,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "FLASHSALE__METRICS__PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flashsale=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Flash-sale engine starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        in_memory = cli.in_memory,
        jobs = !cli.no_jobs,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );

    if let Err(e) = start_metrics(config.metrics.port) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let durable = Arc::new(InMemoryDurableStore::with_demo_data());

    let counters: Arc<dyn CounterStore> = if cli.in_memory {
        let local = Arc::new(InMemoryCounterStore::new());
        tasks.push(spawn_maintenance(local.clone(), cancel.clone()));
        info!("Using in-memory counter store (development mode)");
        local
    } else {
        Arc::new(
            RedisCounterStore::new(&config.redis)
                .await
                .context("Redis connection required")?,
        )
    };

    let created = CounterPreloader::new(counters.clone(), durable.clone())
        .preload()
        .await?;
    info!(created = created, "Stock counters ready");

    let windows = Arc::new(FlashSaleWindowCache::new(counters.clone(), durable.clone()));
    let active = windows.get_active_windows().await?;
    info!(active_windows = active.len(), "Flash-sale windows cached");

    let products = Arc::new(ProductDetailCache::new(
        counters.clone(),
        durable.clone(),
        config.popularity.product_ttl(),
    ));
    let reservations = Arc::new(StockReservationService::new(counters.clone(), durable.clone()));
    let checkout = FlashSaleCheckout::new(
        reservations,
        windows,
        products.clone(),
        durable.clone(),
        config.reservation.require_active_window,
    );

    let metadata = Arc::new(CouponMetadataCache::new(counters.clone(), durable.clone()));
    let (committer, commit_worker) =
        UsageCommitter::spawn(durable.clone(), metadata.clone(), &config.coupons, cancel.clone());
    tasks.push(commit_worker);
    let coupons = CouponLockService::new(counters.clone(), metadata, committer, &config.coupons);

    if cli.no_jobs {
        info!("Periodic jobs disabled on this node");
    } else {
        let lease = config
            .jobs
            .lease_enabled
            .then(|| JobLease::new(counters.clone(), config.node_id.clone()));

        if config.reconciliation.enabled {
            let job = StockReconciliationJob::new(counters.clone(), durable.clone(), &config.reconciliation);
            tasks.push(spawn_periodic(Arc::new(job), lease.clone(), cancel.clone()));
        }
        if config.popularity.enabled {
            let job = PopularityRefreshJob::new(counters.clone(), products.clone(), &config.popularity);
            tasks.push(spawn_periodic(Arc::new(job), lease.clone(), cancel.clone()));
        }
    }

    if cli.in_memory {
        run_demo(&checkout, &coupons).await;
    }

    info!("Flash-sale engine is ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Flash-sale engine stopped");
    Ok(())
}

fn start_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()?;
    info!(port = port, "Metrics exporter started");
    Ok(())
}

fn spawn_maintenance(store: Arc<InMemoryCounterStore>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = store.evict_expired();
                    if evicted > 0 {
                        debug!(evicted = evicted, remaining = store.len(), "Expired counter entries evicted");
                    }
                }
            }
        }
    })
}

/// One purchase and one coupon redemption against the demo data.
async fn run_demo(checkout: &FlashSaleCheckout, coupons: &CouponLockService) {
    match checkout
        .buy(1, vec![OrderLine::new(1, 1), OrderLine::new(2, 1)])
        .await
    {
        Ok(order) => info!(order_id = %order.id, total_cents = order.total_cents, "Demo order placed"),
        Err(e) => warn!(error = %e, "Demo order failed"),
    }

    match coupons.apply_coupon("WELCOME10", 1).await {
        Ok(applied) => info!(applied = applied, "Demo coupon redeemed"),
        Err(e) => warn!(error = %e, "Demo coupon failed"),
    }
}
