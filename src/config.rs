//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable prefix for every setting.
const ENV_PREFIX: &str = "GENOME_QUEUE_";

/// Time-to-live thresholds for the three resource classes the reaper manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttls {
    /// Raw uploaded genome files.
    pub upload: Duration,
    /// Packaged report archives.
    pub artifact: Duration,
    /// Job records themselves.
    pub job: Duration,
}

impl Ttls {
    pub const fn new(upload: Duration, artifact: Duration, job: Duration) -> Self {
        Self {
            upload,
            artifact,
            job,
        }
    }

    /// Expire everything immediately.
    pub const fn zero() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }
}

impl Default for Ttls {
    fn default() -> Self {
        Self {
            upload: Duration::from_secs(24 * 3600),      // 24 hours
            artifact: Duration::from_secs(7 * 24 * 3600), // 7 days
            job: Duration::from_secs(30 * 24 * 3600),     // 30 days
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Root directory for all runtime state.
    pub runtime_dir: PathBuf,
    /// SQLite database holding the job table.
    pub db_path: PathBuf,
    /// Sleep between polls when no job is queued.
    pub poll_interval: Duration,
    /// Number of concurrent worker tasks.
    pub worker_count: usize,
    /// Reaper thresholds.
    pub ttls: Ttls,
    /// Interval between reaper sweeps.
    pub reaper_interval: Duration,
    /// External analyzer program followed by its fixed arguments.
    pub analyzer_command: Option<Vec<String>>,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl QueueConfig {
    /// Build a config rooted at `runtime_dir` with default tunables.
    pub fn with_runtime_dir(runtime_dir: impl Into<PathBuf>) -> Self {
        let runtime_dir = runtime_dir.into();
        Self {
            db_path: runtime_dir.join("jobs.sqlite3"),
            runtime_dir,
            poll_interval: Duration::from_millis(1500),
            worker_count: 1,
            ttls: Ttls::default(),
            reaper_interval: Duration::from_secs(3600), // 1 hour
            analyzer_command: None,
            log_dir: None,
        }
    }

    /// Load configuration from `GENOME_QUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };

        let runtime_dir = get("RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("genome_platform_runtime"));
        let mut config = Self::with_runtime_dir(runtime_dir);

        if let Some(path) = get("DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(ms) = get("POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_number("POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(workers) = get("WORKERS") {
            let workers = parse_number("WORKERS", &workers)?;
            if workers == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}WORKERS"),
                    message: "must be at least 1".to_string(),
                });
            }
            config.worker_count = workers as usize;
        }
        if let Some(hours) = get("UPLOAD_TTL_HOURS") {
            config.ttls.upload = hours_to_duration(parse_number("UPLOAD_TTL_HOURS", &hours)?);
        }
        if let Some(days) = get("ARTIFACT_TTL_DAYS") {
            config.ttls.artifact = hours_to_duration(parse_number("ARTIFACT_TTL_DAYS", &days)?.saturating_mul(24));
        }
        if let Some(days) = get("JOB_TTL_DAYS") {
            config.ttls.job = hours_to_duration(parse_number("JOB_TTL_DAYS", &days)?.saturating_mul(24));
        }
        if let Some(secs) = get("REAPER_INTERVAL_SECS") {
            let secs = parse_number("REAPER_INTERVAL_SECS", &secs)?;
            config.reaper_interval = Duration::from_secs(secs.max(1));
        }
        config.analyzer_command = get("ANALYZER_CMD")
            .map(|cmd| cmd.split_whitespace().map(str::to_string).collect());
        config.log_dir = get("LOG_DIR").map(PathBuf::from);

        Ok(config)
    }

    /// Directory holding uploaded genome files.
    pub fn uploads_dir(&self) -> PathBuf {
        self.runtime_dir.join("uploads")
    }

    /// Directory holding per-job report working directories.
    pub fn reports_dir(&self) -> PathBuf {
        self.runtime_dir.join("reports")
    }

    /// Directory backing the local artifact store.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.runtime_dir.join("artifacts")
    }

    /// The analyzer command, or an error naming the variable to set.
    pub fn require_analyzer(&self) -> Result<&[String], ConfigError> {
        match self.analyzer_command.as_deref() {
            Some(cmd) if !cmd.is_empty() => Ok(cmd),
            _ => Err(ConfigError::MissingEnvVar(format!("{ENV_PREFIX}ANALYZER_CMD"))),
        }
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{name}"),
        message: format!("{value:?}: {e}"),
    })
}

fn hours_to_duration(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}
