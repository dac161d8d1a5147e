//! Configuration management for the aggregator
//!
//! TOML file support, environment variable overrides and defaults. The file
//! sections map onto the runtime configurations of the host tier
//! ([`AggregatorConfig`]), the cluster tier ([`ClusterConfig`]) and the
//! statistic selection ([`StatisticsConfig`]).
//!
//! ```toml
//! [aggregation]
//! cluster = "prod"
//! service = "api"
//! host = "web-1"
//! periods = ["PT1S", "PT1M"]
//! timer_statistics = ["median", "tp90", "tp99", "mean", "count"]
//!
//! [[aggregation.overrides]]
//! pattern = "^latency\\."
//! statistics = ["tp99.9", "histogram"]
//!
//! [cluster]
//! percentile_policy = "from_histogram"
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::cluster::{ClusterConfig, PercentilePolicy};
use crate::error::ValidationError;
use crate::model::{Identity, Period};
use crate::statistics::histogram::{DEFAULT_PRECISION_BITS, MAX_PRECISION_BITS};
use crate::statistics::{Statistic, StatisticFactory, StatisticsConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Host-tier windowing and statistics
    #[serde(default)]
    pub aggregation: AggregationSection,

    /// Histogram settings
    #[serde(default)]
    pub histogram: HistogramSection,

    /// Cluster-tier settings
    #[serde(default)]
    pub cluster: ClusterSection,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringSection,
}

/// Host-tier configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregationSection {
    /// Cluster of records without identity
    #[serde(default = "default_cluster")]
    pub cluster: String,

    /// Service of records without identity
    #[serde(default = "default_service")]
    pub service: String,

    /// Host of records without identity
    #[serde(default = "default_host")]
    pub host: String,

    /// ISO-8601 window lengths
    #[serde(default = "default_periods")]
    pub periods: Vec<String>,

    /// Fixed late-arrival grace; unset uses `min(period / 2, 10 min)`
    #[serde(default)]
    pub late_arrival_grace_ms: Option<u64>,

    /// Housekeeping tick in milliseconds
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,

    /// Statistics computed for counters
    #[serde(default = "default_counter_statistics")]
    pub counter_statistics: Vec<String>,

    /// Statistics computed for gauges
    #[serde(default = "default_gauge_statistics")]
    pub gauge_statistics: Vec<String>,

    /// Statistics computed for timers
    #[serde(default = "default_timer_statistics")]
    pub timer_statistics: Vec<String>,

    /// Per-metric overrides, first match wins
    #[serde(default)]
    pub overrides: Vec<StatisticOverrideSection>,
}

/// One per-metric statistic override
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatisticOverrideSection {
    /// Regular expression over the metric name
    pub pattern: String,
    /// Statistic names replacing the kind's default
    pub statistics: Vec<String>,
}

/// Histogram configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistogramSection {
    /// Mantissa bits kept per bucket
    #[serde(default = "default_precision_bits")]
    pub precision_bits: u8,
}

/// Cluster-tier configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterSection {
    /// Appended to `<cluster>-cluster` in emitted host names
    #[serde(default)]
    pub host_suffix: String,

    /// Grace after window end in milliseconds
    #[serde(default = "default_cluster_grace_ms")]
    pub late_arrival_grace_ms: u64,

    /// How percentiles are combined across hosts
    #[serde(default)]
    pub percentile_policy: PercentilePolicy,

    /// Housekeeping tick in milliseconds
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringSection {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_cluster() -> String { "default".to_string() }
fn default_service() -> String { "default".to_string() }
fn default_host() -> String { "localhost".to_string() }
fn default_periods() -> Vec<String> { vec!["PT1S".to_string(), "PT1M".to_string()] }
fn default_housekeeping_interval_ms() -> u64 { 100 }
fn default_counter_statistics() -> Vec<String> { names(&["mean", "sum", "count"]) }
fn default_gauge_statistics() -> Vec<String> { names(&["min", "max", "mean"]) }
fn default_timer_statistics() -> Vec<String> { names(&["median", "tp90", "tp99", "mean", "count"]) }
fn default_precision_bits() -> u8 { DEFAULT_PRECISION_BITS }
fn default_cluster_grace_ms() -> u64 { 60_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for AggregationSection {
    fn default() -> Self {
        Self {
            cluster: default_cluster(),
            service: default_service(),
            host: default_host(),
            periods: default_periods(),
            late_arrival_grace_ms: None,
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
            counter_statistics: default_counter_statistics(),
            gauge_statistics: default_gauge_statistics(),
            timer_statistics: default_timer_statistics(),
            overrides: Vec::new(),
        }
    }
}

impl Default for HistogramSection {
    fn default() -> Self {
        Self {
            precision_bits: default_precision_bits(),
        }
    }
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            host_suffix: String::new(),
            late_arrival_grace_ms: default_cluster_grace_ms(),
            percentile_policy: PercentilePolicy::default(),
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
        }
    }
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: default_log_level(),
        }
    }
}

impl MonitoringSection {
    /// Install the tracing subscriber at `log_level`; `RUST_LOG` still wins
    pub fn init_logging(&self) -> bool {
        crate::logging::init(&self.log_level)
    }

    /// Prometheus text exposition, or `None` when metrics are disabled
    pub fn metrics_text(&self) -> Result<Option<String>, String> {
        if !self.metrics_enabled {
            return Ok(None);
        }
        crate::metrics::gather_text().map(Some)
    }
}

fn out_of_range(field: &str, value: impl ToString, min: impl ToString, max: impl ToString) -> String {
    ValidationError::OutOfRange {
        field: field.to_string(),
        value: value.to_string(),
        min: min.to_string(),
        max: max.to_string(),
    }
    .to_string()
}

fn parse_statistics(field: &str, list: &[String]) -> Result<Vec<Statistic>, String> {
    list.iter()
        .map(|name| {
            StatisticFactory::get_statistic(name)
                .map_err(|e| {
                    ValidationError::InvalidFormat {
                        field: format!("aggregation.{}", field),
                        message: e.to_string(),
                    }
                    .to_string()
                })
        })
        .collect()
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Identity
        if let Ok(cluster) = std::env::var("TSDAGG_CLUSTER") {
            self.aggregation.cluster = cluster;
        }
        if let Ok(service) = std::env::var("TSDAGG_SERVICE") {
            self.aggregation.service = service;
        }
        if let Ok(host) = std::env::var("TSDAGG_HOST") {
            self.aggregation.host = host;
        }

        // Windowing
        if let Ok(grace) = std::env::var("TSDAGG_LATE_ARRIVAL_GRACE_MS") {
            if let Ok(ms) = grace.parse() {
                self.aggregation.late_arrival_grace_ms = Some(ms);
            }
        }
        if let Ok(bits) = std::env::var("TSDAGG_HISTOGRAM_PRECISION_BITS") {
            if let Ok(b) = bits.parse() {
                self.histogram.precision_bits = b;
            }
        }

        // Monitoring
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let aggregation = &self.aggregation;
        for (field, value) in [
            ("aggregation.cluster", &aggregation.cluster),
            ("aggregation.service", &aggregation.service),
            ("aggregation.host", &aggregation.host),
        ] {
            if value.is_empty() {
                return Err(ValidationError::MissingField(field.to_string()).to_string());
            }
        }

        if aggregation.periods.is_empty() {
            return Err(ValidationError::MissingField("aggregation.periods".to_string()).to_string());
        }
        self.periods()?;

        for (field, value) in [
            ("aggregation.housekeeping_interval_ms", aggregation.housekeeping_interval_ms),
            ("cluster.housekeeping_interval_ms", self.cluster.housekeeping_interval_ms),
        ] {
            if value == 0 {
                return Err(out_of_range(field, value, 1, u64::MAX));
            }
        }

        let bits = self.histogram.precision_bits;
        if bits == 0 || bits > MAX_PRECISION_BITS {
            return Err(out_of_range("histogram.precision_bits", bits, 1, MAX_PRECISION_BITS));
        }

        self.statistics_config()?;

        if self.monitoring.log_level.is_empty() {
            return Err(ValidationError::MissingField("monitoring.log_level".to_string()).to_string());
        }
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&self.monitoring.log_level) {
            return Err(ValidationError::InvalidFormat {
                field: "monitoring.log_level".to_string(),
                message: e.to_string(),
            }
            .to_string());
        }
        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path, e))
    }

    /// Parsed window lengths
    pub fn periods(&self) -> Result<Vec<Period>, String> {
        self.aggregation
            .periods
            .iter()
            .map(|p| {
                Period::parse(p).map_err(|e| {
                    ValidationError::InvalidFormat {
                        field: "aggregation.periods".to_string(),
                        message: e.to_string(),
                    }
                    .to_string()
                })
            })
            .collect()
    }

    /// Statistic selection for the host tier
    pub fn statistics_config(&self) -> Result<StatisticsConfig, String> {
        let aggregation = &self.aggregation;
        let mut config = StatisticsConfig::new(
            parse_statistics("counter_statistics", &aggregation.counter_statistics)?,
            parse_statistics("gauge_statistics", &aggregation.gauge_statistics)?,
            parse_statistics("timer_statistics", &aggregation.timer_statistics)?,
        );
        for o in &aggregation.overrides {
            let statistics = parse_statistics("overrides", &o.statistics)?;
            config = config
                .with_override(&o.pattern, statistics)
                .map_err(|e| e.to_string())?;
        }
        config
            .with_precision_bits(self.histogram.precision_bits)
            .map_err(|e| e.to_string())
    }

    /// Runtime configuration of the host tier
    pub fn aggregator_config(&self) -> Result<AggregatorConfig, String> {
        let aggregation = &self.aggregation;
        Ok(AggregatorConfig {
            identity: Identity::new(
                aggregation.cluster.clone(),
                aggregation.service.clone(),
                aggregation.host.clone(),
            ),
            periods: self.periods()?,
            late_arrival_grace: aggregation.late_arrival_grace_ms.map(Duration::from_millis),
            housekeeping_interval: Duration::from_millis(aggregation.housekeeping_interval_ms),
            statistics: Arc::new(self.statistics_config()?),
        })
    }

    /// Runtime configuration of the cluster tier
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            host_suffix: self.cluster.host_suffix.clone(),
            late_arrival_grace: Duration::from_millis(self.cluster.late_arrival_grace_ms),
            percentile_policy: self.cluster.percentile_policy,
            housekeeping_interval: Duration::from_millis(self.cluster.housekeeping_interval_ms),
        }
    }
}
