use serde::Deserialize;
use std::time::Duration;

/// Root engine configuration. Loaded from environment variables
/// with the prefix `FLASHSALE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub reservation: ReservationConfig,
    #[serde(default)]
    pub coupons: CouponConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub popularity: PopularityConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReservationConfig {
    /// Reject checkout lines whose product is not in an active window.
    #[serde(default = "default_require_active_window")]
    pub require_active_window: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CouponConfig {
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    #[serde(default)]
    pub validate_before_claim: bool,
    #[serde(default = "default_commit_queue_capacity")]
    pub commit_queue_capacity: usize,
    #[serde(default = "default_commit_max_attempts")]
    pub commit_max_attempts: u32,
    #[serde(default = "default_commit_retry_backoff_ms")]
    pub commit_retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_job_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PopularityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_job_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_product_ttl_secs")]
    pub product_ttl_secs: u64,
    /// Fraction of `product_ttl_secs` at or below which a hot entry is refreshed.
    #[serde(default = "default_low_water_ratio")]
    pub low_water_ratio: f64,
    /// Ranking members kept after each refresh pass; never below `top_n`.
    #[serde(default = "default_max_ranked")]
    pub max_ranked: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Guard each periodic job with a counter-store lease so only one
    /// replica runs it per interval.
    #[serde(default = "default_true")]
    pub lease_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_require_active_window() -> bool {
    true
}
fn default_claim_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_commit_queue_capacity() -> usize {
    10_000
}
fn default_commit_max_attempts() -> u32 {
    5
}
fn default_commit_retry_backoff_ms() -> u64 {
    200
}
fn default_true() -> bool {
    true
}
fn default_job_interval_secs() -> u64 {
    120
}
fn default_top_n() -> usize {
    20
}
fn default_product_ttl_secs() -> u64 {
    600
}
fn default_low_water_ratio() -> f64 {
    0.2
}
fn default_max_ranked() -> usize {
    200
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            require_active_window: default_require_active_window(),
        }
    }
}

impl Default for CouponConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: default_claim_ttl_secs(),
            validate_before_claim: false,
            commit_queue_capacity: default_commit_queue_capacity(),
            commit_max_attempts: default_commit_max_attempts(),
            commit_retry_backoff_ms: default_commit_retry_backoff_ms(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_job_interval_secs(),
        }
    }
}

impl Default for PopularityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_job_interval_secs(),
            top_n: default_top_n(),
            product_ttl_secs: default_product_ttl_secs(),
            low_water_ratio: default_low_water_ratio(),
            max_ranked: default_max_ranked(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            lease_enabled: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            redis: RedisConfig::default(),
            reservation: ReservationConfig::default(),
            coupons: CouponConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            popularity: PopularityConfig::default(),
            jobs: JobsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl CouponConfig {
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn commit_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.commit_retry_backoff_ms)
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl PopularityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn product_ttl(&self) -> Duration {
        Duration::from_secs(self.product_ttl_secs)
    }

    /// Remaining TTL at or below which a hot product entry is re-cached.
    pub fn low_water_mark(&self) -> Duration {
        self.product_ttl().mul_f64(self.low_water_ratio.clamp(0.0, 1.0))
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("FLASHSALE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
