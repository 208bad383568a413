//! Configuration for TULVA
//!
//! Every knob has a default; `PipelineConfig::from_env` overrides them from
//! `TULVA_*` environment variables.

use crate::error::{PipelineError, Result};
use crate::point::Priority;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for a pipeline instance
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Window within which identical hashes are duplicates
    pub freshness_window: Duration,

    /// Upper bound on tracked dedup hashes (oldest evicted first)
    pub dedup_max_entries: usize,

    /// Granularity timestamps are rounded down to before hashing
    pub hash_granularity: Duration,

    /// Queue capacities by priority
    pub queue_capacity: QueueCapacities,

    /// Critical items slower than this are logged
    pub critical_latency_target: Duration,

    /// How long processors may drain their queues after shutdown
    pub shutdown_timeout: Duration,

    /// Health monitor period
    pub health_interval: Duration,

    /// Metrics reporter period
    pub metrics_interval: Duration,

    /// Cache janitor period
    pub janitor_interval: Duration,

    /// First reconnect delay
    pub backoff_base: Duration,

    /// Largest reconnect delay
    pub backoff_cap: Duration,

    /// Push streams disconnected longer than this are degraded
    pub disconnect_threshold: Duration,

    /// Consecutive connection failures before a stream is degraded
    pub max_consecutive_failures: u32,

    /// Accumulated errors before a stream is degraded
    pub error_threshold: u64,

    /// Raw messages buffered between a transport and its ingest loop
    pub raw_channel_capacity: usize,

    /// Prefix for external pub/sub channels (`{prefix}.{data_type}`)
    pub channel_prefix: String,

    /// Log level
    pub log_level: String,

    /// Log format (json or pretty)
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Per-priority queue capacities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCapacities {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QueueCapacities {
    /// Capacity for a given priority
    pub fn for_priority(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    /// Same capacity for every priority (handy in tests)
    pub fn uniform(capacity: usize) -> Self {
        Self {
            critical: capacity,
            high: capacity,
            medium: capacity,
            low: capacity,
        }
    }
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            critical: 1_000,
            high: 5_000,
            medium: 10_000,
            low: 50_000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(300),
            dedup_max_entries: 100_000,
            hash_granularity: Duration::from_secs(1),
            queue_capacity: QueueCapacities::default(),
            critical_latency_target: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(300),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            disconnect_threshold: Duration::from_secs(60),
            max_consecutive_failures: 5,
            error_threshold: 100,
            raw_channel_capacity: 1024,
            channel_prefix: "tulva".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = PipelineConfig::default();

        if let Some(secs) = parse_var::<u64>("TULVA_FRESHNESS_WINDOW_SECS")? {
            config.freshness_window = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var("TULVA_DEDUP_MAX_ENTRIES")? {
            config.dedup_max_entries = n;
        }
        if let Some(ms) = parse_var::<u64>("TULVA_HASH_GRANULARITY_MS")? {
            config.hash_granularity = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var("TULVA_QUEUE_CRITICAL")? {
            config.queue_capacity.critical = n;
        }
        if let Some(n) = parse_var("TULVA_QUEUE_HIGH")? {
            config.queue_capacity.high = n;
        }
        if let Some(n) = parse_var("TULVA_QUEUE_MEDIUM")? {
            config.queue_capacity.medium = n;
        }
        if let Some(n) = parse_var("TULVA_QUEUE_LOW")? {
            config.queue_capacity.low = n;
        }
        if let Some(ms) = parse_var::<u64>("TULVA_CRITICAL_LATENCY_MS")? {
            config.critical_latency_target = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("TULVA_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>("TULVA_HEALTH_INTERVAL_SECS")? {
            config.health_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("TULVA_METRICS_INTERVAL_SECS")? {
            config.metrics_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("TULVA_JANITOR_INTERVAL_SECS")? {
            config.janitor_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>("TULVA_BACKOFF_BASE_MS")? {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("TULVA_BACKOFF_CAP_MS")? {
            config.backoff_cap = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>("TULVA_DISCONNECT_THRESHOLD_SECS")? {
            config.disconnect_threshold = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var("TULVA_MAX_CONSECUTIVE_FAILURES")? {
            config.max_consecutive_failures = n;
        }
        if let Some(n) = parse_var("TULVA_ERROR_THRESHOLD")? {
            config.error_threshold = n;
        }
        if let Some(n) = parse_var("TULVA_RAW_CHANNEL_CAPACITY")? {
            config.raw_channel_capacity = n;
        }
        if let Ok(prefix) = env::var("TULVA_CHANNEL_PREFIX") {
            config.channel_prefix = prefix;
        }
        if let Ok(level) = env::var("TULVA_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(format) = env::var("TULVA_LOG_FORMAT") {
            config.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(PipelineError::Config(format!(
                        "invalid TULVA_LOG_FORMAT: {other} (expected 'json' or 'pretty')"
                    )));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline misbehave
    pub fn validate(&self) -> Result<()> {
        if self.freshness_window.is_zero() {
            return Err(PipelineError::Config(
                "freshness window must be positive".into(),
            ));
        }
        if self.hash_granularity.is_zero() {
            return Err(PipelineError::Config(
                "hash granularity must be positive".into(),
            ));
        }
        for priority in Priority::ALL {
            if self.queue_capacity.for_priority(priority) == 0 {
                return Err(PipelineError::Config(format!(
                    "queue capacity for {priority} must be positive"
                )));
            }
        }
        if self.backoff_base > self.backoff_cap {
            return Err(PipelineError::Config(format!(
                "backoff base {:?} exceeds cap {:?}",
                self.backoff_base, self.backoff_cap
            )));
        }
        for (name, period) in [
            ("health interval", self.health_interval),
            ("metrics interval", self.metrics_interval),
            ("janitor interval", self.janitor_interval),
        ] {
            if period.is_zero() {
                return Err(PipelineError::Config(format!("{name} must be positive")));
            }
        }
        if self.raw_channel_capacity == 0 {
            return Err(PipelineError::Config(
                "raw channel capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| PipelineError::Config(format!("invalid {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
