//! Daemon configuration.
//!
//! Loaded once from `FLEETD_`-prefixed environment variables and treated as
//! immutable for the life of the process. Validation failures are fatal at
//! startup; the reconcilers receive an already-validated struct.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Compute provider API.
    pub cloud_api_url: String,
    pub cloud_api_token: String,

    /// Job-host API and registration scope (repository or organization).
    pub jobhost_api_url: String,
    pub jobhost_api_token: String,
    pub jobhost_scope: String,

    /// Fleet identity; instances are tagged with and named after it.
    pub fleet_name: String,

    /// Runner instance shape.
    pub runner_image: String,
    pub runner_cpu_cores: u32,
    pub runner_memory_mb: u64,

    /// Hard ceiling on fleet size, whatever the source says.
    pub max_runners: u32,

    /// Desired count when neither a queue nor a planner is configured.
    pub static_runners: u32,

    /// Desired count while the planner stream is down.
    pub fallback_runners: u32,

    pub reconcile_interval: Duration,

    /// Pressure-mode delete loop interval.
    pub delete_interval: Duration,

    /// How long an unregistered instance may boot before counting as stale.
    pub registration_grace: Duration,

    /// Per-request timeout for every external call.
    pub api_timeout: Duration,

    /// Planner stream reconnect backoff schedule.
    pub stream_backoff_base: Duration,
    pub stream_backoff_cap: Duration,

    /// Skip the registration-list step when remaining job-host quota drops
    /// below this.
    pub rate_limit_floor: u32,

    /// Queue-depth source; present selects queue mode.
    pub queue_url: Option<String>,

    /// Planner pressure stream; present selects pressure mode.
    pub planner_url: Option<String>,
    pub planner_token: Option<String>,

    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            cloud_api_url: require("FLEETD_CLOUD_API_URL")?,
            cloud_api_token: require("FLEETD_CLOUD_API_TOKEN")?,
            jobhost_api_url: require("FLEETD_JOBHOST_API_URL")?,
            jobhost_api_token: require("FLEETD_JOBHOST_API_TOKEN")?,
            jobhost_scope: require("FLEETD_JOBHOST_SCOPE")?,
            fleet_name: env_or("FLEETD_FLEET_NAME", "ci-fleet"),
            runner_image: require("FLEETD_RUNNER_IMAGE")?,
            runner_cpu_cores: env_parse("FLEETD_RUNNER_CPU_CORES", 2)?,
            runner_memory_mb: env_parse("FLEETD_RUNNER_MEMORY_MB", 4096)?,
            max_runners: env_parse("FLEETD_MAX_RUNNERS", 16)?,
            static_runners: env_parse("FLEETD_STATIC_RUNNERS", 0)?,
            fallback_runners: env_parse("FLEETD_FALLBACK_RUNNERS", 1)?,
            reconcile_interval: Duration::from_secs(env_parse(
                "FLEETD_RECONCILE_INTERVAL_SECS",
                30,
            )?),
            delete_interval: Duration::from_secs(env_parse("FLEETD_DELETE_INTERVAL_SECS", 30)?),
            registration_grace: Duration::from_secs(env_parse(
                "FLEETD_REGISTRATION_GRACE_SECS",
                120,
            )?),
            api_timeout: Duration::from_secs(env_parse("FLEETD_API_TIMEOUT_SECS", 30)?),
            stream_backoff_base: Duration::from_millis(env_parse(
                "FLEETD_STREAM_BACKOFF_BASE_MS",
                500,
            )?),
            stream_backoff_cap: Duration::from_secs(env_parse(
                "FLEETD_STREAM_BACKOFF_CAP_SECS",
                60,
            )?),
            rate_limit_floor: env_parse("FLEETD_RATE_LIMIT_FLOOR", 10)?,
            queue_url: std::env::var("FLEETD_QUEUE_URL").ok(),
            planner_url: std::env::var("FLEETD_PLANNER_URL").ok(),
            planner_token: std::env::var("FLEETD_PLANNER_TOKEN").ok(),
            log_level: env_or("FLEETD_LOG_LEVEL", "info"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_runners == 0 {
            bail!("FLEETD_MAX_RUNNERS must be at least 1");
        }
        if self.static_runners > self.max_runners {
            bail!(
                "FLEETD_STATIC_RUNNERS ({}) exceeds FLEETD_MAX_RUNNERS ({})",
                self.static_runners,
                self.max_runners
            );
        }
        if self.fallback_runners > self.max_runners {
            bail!(
                "FLEETD_FALLBACK_RUNNERS ({}) exceeds FLEETD_MAX_RUNNERS ({})",
                self.fallback_runners,
                self.max_runners
            );
        }
        if self.stream_backoff_base.is_zero()
            || self.stream_backoff_base > self.stream_backoff_cap
        {
            bail!("FLEETD_STREAM_BACKOFF_BASE_MS must be non-zero and at most the cap");
        }
        if self.queue_url.is_some() && self.planner_url.is_some() {
            bail!("FLEETD_QUEUE_URL and FLEETD_PLANNER_URL are mutually exclusive");
        }
        Ok(())
    }

    /// Grace period as a chrono duration for timestamp arithmetic.
    pub fn registration_grace_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.registration_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(120))
    }
}

fn require(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("{key} must be set"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("invalid {key}")),
        Err(_) => Ok(default),
    }
}
