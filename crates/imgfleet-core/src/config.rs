//! imgfleet.toml configuration parser.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Durations are written as strings ("500ms", "30s", "5m").

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{format_duration, serde_str};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub scaling: ScalingConfig,
    pub tracker: TrackerConfig,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub gateway: GatewayConfig,
    pub server: ServerConfig,
}

/// Scaling controller tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingConfig {
    /// Control loop period.
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Backlog a single worker is expected to absorb.
    pub jobs_per_worker_target: u32,
    pub min_pool: u32,
    pub max_pool: u32,
    /// Oldest-message age above which the pool is escalated by one.
    #[serde(with = "serde_str")]
    pub latency_threshold: Duration,
    /// Scale-down suppression window after a scale-up.
    #[serde(with = "serde_str")]
    pub cooldown: Duration,
    pub max_in_flight_launches: u32,
    /// A busy worker may only be terminated once its job is older than this.
    #[serde(with = "serde_str")]
    pub hard_staleness_timeout: Duration,
    pub worker_image: String,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            jobs_per_worker_target: 10,
            min_pool: 1,
            max_pool: 20,
            latency_threshold: Duration::from_secs(60),
            cooldown: Duration::from_secs(120),
            max_in_flight_launches: 5,
            hard_staleness_timeout: Duration::from_secs(900),
            worker_image: "imgfleet-worker:latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_attempts: u32,
    /// A processing job with no progress for this long may be re-claimed.
    #[serde(with = "serde_str")]
    pub heartbeat_window: Duration,
    /// Jobs idle in `Submitted` this long are re-enqueued by the controller.
    #[serde(with = "serde_str")]
    pub redispatch_after: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            heartbeat_window: Duration::from_secs(60),
            redispatch_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Bounded wait for a single queue poll.
    #[serde(with = "serde_str")]
    pub poll_wait: Duration,
    #[serde(with = "serde_str")]
    pub heartbeat_interval: Duration,
    /// Missed-heartbeat threshold after which a worker is unresponsive.
    #[serde(with = "serde_str")]
    pub unresponsive_after: Duration,
    /// How often a busy worker reports progress and extends visibility.
    #[serde(with = "serde_str")]
    pub progress_interval: Duration,
    /// Visibility delay applied to a message after a retryable failure.
    #[serde(with = "serde_str")]
    pub retry_delay: Duration,
    pub processor: ProcessorConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            unresponsive_after: Duration::from_secs(30),
            progress_interval: Duration::from_secs(15),
            retry_delay: Duration::from_secs(5),
            processor: ProcessorConfig::default(),
        }
    }
}

/// External image tool invoked by the command processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessorConfig {
    pub program: String,
    /// Arguments; `{input}` and `{output}` are replaced by temp file paths.
    pub args: Vec<String>,
    #[serde(with = "serde_str")]
    pub timeout: Duration,
    /// Let a job's operation replace `args`. Operation arguments may only
    /// name the temp files through placeholders, never other paths.
    pub allow_operation_args: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            program: "convert".to_string(),
            args: [
                "{input}",
                "-resize",
                "512x512",
                "-background",
                "white",
                "-gravity",
                "center",
                "-extent",
                "512x512",
                "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout: Duration::from_secs(60),
            allow_operation_args: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(with = "serde_str")]
    pub visibility_timeout: Duration,
    /// Publish a completion notice per finished job on a results queue.
    /// Off by default; job status and `/output` are the primary way to
    /// fetch results.
    pub publish_results: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            publish_results: false,
        }
    }
}

/// Retry budget for gateway calls that fail with `Unavailable`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub max_retries: u32,
    #[serde(with = "serde_str")]
    pub base_backoff: Duration,
    #[serde(with = "serde_str")]
    pub max_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the controller or tracker cannot operate with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.scaling;
        if s.min_pool > s.max_pool {
            anyhow::bail!(
                "scaling.min_pool ({}) exceeds scaling.max_pool ({})",
                s.min_pool,
                s.max_pool
            );
        }
        if s.jobs_per_worker_target == 0 {
            anyhow::bail!("scaling.jobs_per_worker_target must be at least 1");
        }
        if self.tracker.max_attempts == 0 {
            anyhow::bail!("tracker.max_attempts must be at least 1");
        }
        if self.worker.processor.program.trim().is_empty() {
            anyhow::bail!("worker.processor.program must not be empty");
        }
        self.validate_timings()
    }

    /// Liveness settings have to nest: a healthy worker must always report
    /// before anyone is allowed to give up on it.
    fn validate_timings(&self) -> anyhow::Result<()> {
        let w = &self.worker;
        if self.tracker.heartbeat_window <= w.progress_interval {
            anyhow::bail!(
                "tracker.heartbeat_window ({}) must exceed worker.progress_interval ({})",
                format_duration(self.tracker.heartbeat_window),
                format_duration(w.progress_interval)
            );
        }
        if w.progress_interval >= self.queue.visibility_timeout {
            anyhow::bail!(
                "worker.progress_interval ({}) must be shorter than queue.visibility_timeout ({})",
                format_duration(w.progress_interval),
                format_duration(self.queue.visibility_timeout)
            );
        }
        if w.heartbeat_interval >= w.unresponsive_after {
            anyhow::bail!(
                "worker.heartbeat_interval ({}) must be shorter than worker.unresponsive_after ({})",
                format_duration(w.heartbeat_interval),
                format_duration(w.unresponsive_after)
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config, FleetConfig::default());
        assert_eq!(config.tracker.max_attempts, 3);
        assert_eq!(config.worker.processor.program, "convert");
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[scaling]
jobs_per_worker_target = 25
max_pool = 50
cooldown = "5m"

[tracker]
heartbeat_window = "90s"

[worker.processor]
timeout = "2m"
"#;
        let config = FleetConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.scaling.jobs_per_worker_target, 25);
        assert_eq!(config.scaling.max_pool, 50);
        assert_eq!(config.scaling.min_pool, 1);
        assert_eq!(config.scaling.cooldown, Duration::from_secs(300));
        assert_eq!(config.tracker.heartbeat_window, Duration::from_secs(90));
        assert_eq!(config.worker.processor.timeout, Duration::from_secs(120));
        assert_eq!(config.worker.processor.args.len(), 10);
        assert!(!config.worker.processor.allow_operation_args);
        assert!(!config.queue.publish_results);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = FleetConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("visibility_timeout = \"30s\""));
        assert_eq!(FleetConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn invalid_duration_is_an_error() {
        let err = FleetConfig::from_toml_str("[queue]\nvisibility_timeout = \"later\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn validate_rejects_inverted_pool_bounds() {
        let mut config = FleetConfig::default();
        config.scaling.min_pool = 5;
        config.scaling.max_pool = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_target_and_attempts() {
        let mut config = FleetConfig::default();
        config.scaling.jobs_per_worker_target = 0;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.tracker.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_heartbeat_window_not_above_progress_interval() {
        let toml_str = r#"
[tracker]
heartbeat_window = "50ms"

[worker]
progress_interval = "200ms"
"#;
        let err = FleetConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("tracker.heartbeat_window"));

        let mut config = FleetConfig::default();
        config.tracker.heartbeat_window = config.worker.progress_interval;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_progress_interval_not_below_visibility_timeout() {
        let mut config = FleetConfig::default();
        config.worker.progress_interval = Duration::from_secs(30);
        config.queue.visibility_timeout = Duration::from_secs(30);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue.visibility_timeout"));
    }

    #[test]
    fn validate_rejects_heartbeat_interval_not_below_unresponsive_after() {
        let mut config = FleetConfig::default();
        config.worker.heartbeat_interval = Duration::from_secs(45);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worker.unresponsive_after"));
    }

    #[test]
    fn overflowing_duration_is_an_error() {
        let err = FleetConfig::from_toml_str("[scaling]\ncooldown = \"400000000000000000m\"\n");
        assert!(err.is_err());
    }
}
