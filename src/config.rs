//! Configuration types, loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Top-level bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Telegram Bot API token. `None` only when running on the CLI gateway.
    pub telegram_token: Option<SecretString>,
    /// Usernames or numeric ids allowed to talk to the bot (`*` = everyone).
    pub allowed_users: Vec<String>,
    /// Use stdin/stdout instead of Telegram.
    pub use_cli: bool,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// How long a pending command waits for its follow-up message.
    pub session_ttl: Duration,
    pub scanner: ScannerConfig,
    pub jobs: JobWorkerConfig,
}

impl BotConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let use_cli = env_flag("TASKBOT_CLI");

        let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(SecretString::from);
        if telegram_token.is_none() && !use_cli {
            return Err(ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()));
        }

        let allowed_users: Vec<String> = std::env::var("TELEGRAM_ALLOWED_USERS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let db_path = std::env::var("TASKBOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/taskbot.db"));

        Ok(Self {
            telegram_token,
            allowed_users,
            use_cli,
            db_path,
            session_ttl: Duration::from_secs(env_u64("TASKBOT_SESSION_TTL_SECS", 60)?),
            scanner: ScannerConfig::from_env()?,
            jobs: JobWorkerConfig::from_env()?,
        })
    }
}

/// Deadline scanner configuration.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Time between scans.
    pub interval: Duration,
    /// How far an overdue deadline is pushed.
    pub reschedule_by: chrono::Duration,
    /// Send an "upcoming deadline" message on every tick for tasks with
    /// reminders enabled, in addition to the queued reminder job.
    pub repeat_upcoming_notice: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            reschedule_by: chrono::Duration::hours(24),
            repeat_upcoming_notice: false,
        }
    }
}

impl ScannerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let secs = env_u64("TASKBOT_SCAN_INTERVAL_SECS", 60)?;
        if secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKBOT_SCAN_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(Self {
            interval: Duration::from_secs(secs),
            repeat_upcoming_notice: env_flag("TASKBOT_REPEAT_UPCOMING_NOTICE"),
            ..Self::default()
        })
    }
}

/// Delayed job worker configuration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Time between queue polls.
    pub poll_interval: Duration,
    /// Jobs claimed per poll.
    pub batch_size: usize,
    /// How long a claimed job stays invisible to other polls.
    pub lease: Duration,
    /// Attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// First retry delay; doubles with each attempt.
    pub retry_base: Duration,
    /// Upper bound on the retry delay.
    pub retry_cap: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 32,
            lease: Duration::from_secs(300),
            max_attempts: 5,
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(3600),
        }
    }
}

impl JobWorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let poll = env_u64("TASKBOT_JOB_POLL_SECS", 5)?;
        let max_attempts = env_u64("TASKBOT_JOB_MAX_ATTEMPTS", 5)?;
        if poll == 0 || max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKBOT_JOB_POLL_SECS/TASKBOT_JOB_MAX_ATTEMPTS".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(Self {
            poll_interval: Duration::from_secs(poll),
            max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
            ..Self::default()
        })
    }

    /// Delay before retrying a job that has failed `attempts` times.
    pub fn backoff_for(&self, attempts: u32) -> chrono::Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let delay = self
            .retry_base
            .saturating_mul(1u32 << exp)
            .min(self.retry_cap);
        chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a whole number, got {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_defaults() {
        let cfg = ScannerConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.reschedule_by, chrono::Duration::hours(24));
        assert!(!cfg.repeat_upcoming_notice);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = JobWorkerConfig::default();
        assert_eq!(cfg.backoff_for(1), chrono::Duration::seconds(30));
        assert_eq!(cfg.backoff_for(2), chrono::Duration::seconds(60));
        assert_eq!(cfg.backoff_for(3), chrono::Duration::seconds(120));
        assert_eq!(cfg.backoff_for(30), chrono::Duration::hours(1));
    }

    #[test]
    fn env_u64_falls_back_to_default() {
        assert_eq!(env_u64("TASKBOT_TEST_UNSET_VARIABLE", 7).unwrap(), 7);
    }
}
