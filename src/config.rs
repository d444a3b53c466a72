use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Runtime configuration, loaded once at startup from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port (`PORT`).
    pub port: u16,

    /// Downstream URL batches are POSTed to (`ENDPOINT`).
    pub endpoint: String,

    /// Number of buffered payloads that triggers a flush (`BATCH_SIZE`).
    pub batch_size: usize,

    /// Period of the interval flush trigger (`BATCH_INTERVAL`, seconds).
    pub batch_interval: Duration,

    /// Maximum batches dispatched concurrently (`MAX_IN_FLIGHT`). Default: 4.
    pub max_in_flight: usize,

    /// Development mode (`ENV=development` or `ENV=dev`).
    pub development: bool,
}

fn default_max_in_flight() -> usize {
    4
}

impl Config {
    /// Load configuration from the process environment, seeding it from a
    /// dotenv file first when one exists.
    ///
    /// Variables already set in the environment win over the file.
    pub fn from_env(env_file: &Path) -> Result<Self> {
        match dotenvy::from_path(env_file) {
            Ok(()) => {
                tracing::debug!(path = %env_file.display(), "loaded env file");
            }
            Err(e) if e.not_found() => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("loading env file {}", env_file.display()));
            }
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = required_parsed(&lookup, "PORT")?;
        let endpoint = required(&lookup, "ENDPOINT")?;
        let batch_size = required_parsed(&lookup, "BATCH_SIZE")?;
        let batch_interval_secs: u64 = required_parsed(&lookup, "BATCH_INTERVAL")?;

        let max_in_flight = match optional(&lookup, "MAX_IN_FLIGHT") {
            Some(raw) => parse_value("MAX_IN_FLIGHT", &raw)?,
            None => default_max_in_flight(),
        };

        let development = optional(&lookup, "ENV")
            .map(|env| is_development(&env))
            .unwrap_or(false);

        let cfg = Self {
            port,
            endpoint,
            batch_size,
            batch_interval: Duration::from_secs(batch_interval_secs),
            max_in_flight,
            development,
        };

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate ranges that parsing alone cannot enforce.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            bail!("ENDPOINT must not be empty");
        }

        if self.batch_size == 0 {
            bail!("BATCH_SIZE must be positive");
        }

        if self.batch_interval.is_zero() {
            bail!("BATCH_INTERVAL must be positive");
        }

        if self.max_in_flight == 0 {
            bail!("MAX_IN_FLIGHT must be positive");
        }

        Ok(())
    }
}

/// Returns true for the environment names treated as development.
pub fn is_development(env: &str) -> bool {
    matches!(env, "development" | "dev")
}

fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match optional(lookup, key) {
        Some(v) => Ok(v),
        None => bail!("required environment variable {key} is not set"),
    }
}

fn required_parsed<F, T>(lookup: &F, key: &str) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = required(lookup, key)?;
    parse_value(key, &raw)
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .with_context(|| format!("environment variable {key} is not a valid integer: {raw:?}"))
}
