//! Engine configuration loaded from `STREAMFOLD_*` environment variables.
//!
//! Absent variables fall back to the option structs' defaults; a variable that is
//! present but unparsable is an error rather than being silently ignored.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::projections::ProjectionManagerOptions;
use crate::repository::{RepositoryOptions, SnapshotPolicy};
use crate::subscriptions::manager::DEFAULT_SUBSCRIPTION_BUFFER;
use crate::subscriptions::{DurableSubscriptionOptions, RetryPolicy};

pub const SNAPSHOT_FREQUENCY: &str = "STREAMFOLD_SNAPSHOT_FREQUENCY";
pub const SUBSCRIPTION_BUFFER: &str = "STREAMFOLD_SUBSCRIPTION_BUFFER";
pub const DURABLE_MAX_SUBSCRIBERS: &str = "STREAMFOLD_DURABLE_MAX_SUBSCRIBERS";
pub const DURABLE_MIN_CHECKPOINT: &str = "STREAMFOLD_DURABLE_MIN_CHECKPOINT";
pub const DURABLE_MAX_CHECKPOINT: &str = "STREAMFOLD_DURABLE_MAX_CHECKPOINT";
pub const RECONNECT_INITIAL_MS: &str = "STREAMFOLD_RECONNECT_INITIAL_MS";
pub const RECONNECT_MAX_MS: &str = "STREAMFOLD_RECONNECT_MAX_MS";
pub const RECONNECT_MAX_ATTEMPTS: &str = "STREAMFOLD_RECONNECT_MAX_ATTEMPTS";
pub const PROJECTION_RETRY_MS: &str = "STREAMFOLD_PROJECTION_RETRY_MS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub snapshot_frequency: u64,
    pub subscription_buffer: usize,
    pub durable_max_subscribers: usize,
    pub durable_min_checkpoint: u64,
    pub durable_max_checkpoint: u64,
    pub reconnect: RetryPolicy,
    /// Initial backoff of a failing projection source.
    pub projection_retry: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_frequency: SnapshotPolicy::DEFAULT_FREQUENCY,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            durable_max_subscribers: DurableSubscriptionOptions::DEFAULT_MAX_SUBSCRIBERS,
            durable_min_checkpoint: DurableSubscriptionOptions::DEFAULT_MIN_EVENTS_BEFORE_CHECKPOINT,
            durable_max_checkpoint: DurableSubscriptionOptions::DEFAULT_MAX_EVENTS_BEFORE_CHECKPOINT,
            reconnect: RetryPolicy::default(),
            projection_retry: ProjectionManagerOptions::default().retry.initial_backoff,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse(&lookup, key)?.map_or(default, Duration::from_millis))
        };

        Ok(Self {
            snapshot_frequency: parse(&lookup, SNAPSHOT_FREQUENCY)?.unwrap_or(defaults.snapshot_frequency),
            subscription_buffer: parse(&lookup, SUBSCRIPTION_BUFFER)?.unwrap_or(defaults.subscription_buffer),
            durable_max_subscribers: parse(&lookup, DURABLE_MAX_SUBSCRIBERS)?
                .unwrap_or(defaults.durable_max_subscribers),
            durable_min_checkpoint: parse(&lookup, DURABLE_MIN_CHECKPOINT)?
                .unwrap_or(defaults.durable_min_checkpoint),
            durable_max_checkpoint: parse(&lookup, DURABLE_MAX_CHECKPOINT)?
                .unwrap_or(defaults.durable_max_checkpoint),
            reconnect: RetryPolicy {
                initial_backoff: millis(RECONNECT_INITIAL_MS, defaults.reconnect.initial_backoff)?,
                max_backoff: millis(RECONNECT_MAX_MS, defaults.reconnect.max_backoff)?,
                max_attempts: parse(&lookup, RECONNECT_MAX_ATTEMPTS)?.or(defaults.reconnect.max_attempts),
            },
            projection_retry: millis(PROJECTION_RETRY_MS, defaults.projection_retry)?,
        })
    }

    pub fn repository_options(&self) -> RepositoryOptions {
        RepositoryOptions {
            snapshot_policy: SnapshotPolicy::from_frequency(self.snapshot_frequency),
        }
    }

    /// Durable options for `durable_name` with the configured limits applied.
    pub fn durable_options(&self, durable_name: impl Into<String>) -> DurableSubscriptionOptions {
        DurableSubscriptionOptions::new(durable_name)
            .max_subscribers(self.durable_max_subscribers)
            .checkpoint_window(self.durable_min_checkpoint, self.durable_max_checkpoint)
            .retry(self.reconnect.clone())
    }

    pub fn projection_options(&self) -> ProjectionManagerOptions {
        let mut options = ProjectionManagerOptions::default();
        options.retry.initial_backoff = self.projection_retry;
        options.retry.max_backoff = options.retry.max_backoff.max(self.projection_retry);
        options
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        })
}
