//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tasksync_protocol::{BackendId, ConflictPolicy};

/// Configuration for sync cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncConfig {
    /// How conflicts are settled.
    pub conflict_policy: ConflictPolicy,
    /// Backends in decreasing priority, used to break timestamp ties.
    pub backend_priority: Vec<BackendId>,
    /// Retry configuration for fetches and remote writes.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with last-writer-wins and default retries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the conflict policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the backend priority order, highest first.
    pub fn with_priority<I>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = BackendId>,
    {
        self.backend_priority = backends.into_iter().collect();
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks the configuration for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a backend is listed twice in the priority order
    /// or no attempt is allowed.
    pub fn validate(&self) -> SyncResult<()> {
        let mut seen = BTreeSet::new();
        for backend in &self.backend_priority {
            if !seen.insert(backend) {
                return Err(SyncError::Config(format!(
                    "backend {backend} listed twice in backendPriority"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retryAttempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Parses a JSON configuration document.
    ///
    /// ```json
    /// {
    ///   "conflictPolicy": "last-writer-wins",
    ///   "backendPriority": ["calendar", "tracker"],
    ///   "retryAttempts": 3,
    ///   "retryBackoffBaseMs": 100
    /// }
    /// ```
    ///
    /// Every field is optional.
    ///
    /// # Errors
    ///
    /// Returns `Config` on malformed JSON, unknown fields or invalid values.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let file: ConfigFile =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        let config = Self::from(file);
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> SyncResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Renders the configuration in its JSON file form.
    pub fn to_json(&self) -> String {
        let file = ConfigFile::from(self);
        serde_json::to_string_pretty(&file).unwrap_or_default()
    }
}

/// On-disk form of [`SyncConfig`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    conflict_policy: ConflictPolicy,
    #[serde(default)]
    backend_priority: Vec<BackendId>,
    #[serde(default = "default_attempts")]
    retry_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    retry_backoff_base_ms: u64,
}

fn default_attempts() -> u32 {
    RetryConfig::DEFAULT_ATTEMPTS
}

fn default_backoff_ms() -> u64 {
    RetryConfig::DEFAULT_INITIAL_DELAY_MS
}

impl From<ConfigFile> for SyncConfig {
    fn from(file: ConfigFile) -> Self {
        Self {
            conflict_policy: file.conflict_policy,
            backend_priority: file.backend_priority,
            retry: RetryConfig::new(file.retry_attempts)
                .with_initial_delay(Duration::from_millis(file.retry_backoff_base_ms)),
        }
    }
}

impl From<&SyncConfig> for ConfigFile {
    fn from(config: &SyncConfig) -> Self {
        Self {
            conflict_policy: config.conflict_policy,
            backend_priority: config.backend_priority.clone(),
            retry_attempts: config.retry.max_attempts,
            retry_backoff_base_ms: config.retry.initial_delay.as_millis() as u64,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    const DEFAULT_ATTEMPTS: u32 = 3;
    const DEFAULT_INITIAL_DELAY_MS: u64 = 100;

    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(Self::DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Retries immediately, without sleeping. Meant for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::no_retry()
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ATTEMPTS)
    }
}
