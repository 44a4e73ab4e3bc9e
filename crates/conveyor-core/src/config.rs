//! Environment-based configuration for the coordinator and engines.

use std::env;

use conveyor_job::EventType;

/// Logical channel names the lifecycle events are published on.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub started: String,
    pub progress: String,
    pub completed: String,
    pub failed: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            started: "conveyor:jobs:started".to_string(),
            progress: "conveyor:jobs:progress".to_string(),
            completed: "conveyor:jobs:completed".to_string(),
            failed: "conveyor:jobs:failed".to_string(),
        }
    }
}

impl ChannelConfig {
    /// Route an event type to its channel. Stop shares the failed
    /// channel so subscribers watching for non-success see both.
    pub fn channel_for(&self, event_type: EventType) -> &str {
        match event_type {
            EventType::JobStarted | EventType::StepStarting => &self.started,
            EventType::StepCompleted => &self.progress,
            EventType::JobCompleted => &self.completed,
            EventType::JobFailed | EventType::JobStopped => &self.failed,
        }
    }
}

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bounded wait for the metadata lock before a trigger fails fast.
    pub queue_timeout_secs: u64,
    /// Concurrent job bodies allowed in flight.
    pub worker_count: usize,
    /// Records buffered by the streaming aggregator between flushes.
    pub flush_size: usize,
    /// Aggregation key-family depth (1..=3).
    pub aggregation_depth: u8,
    /// Attempts for metadata creation against the execution store.
    pub metadata_retry_attempts: u32,
    /// Base backoff between metadata retries, in milliseconds.
    pub metadata_retry_backoff_ms: u64,
    pub channels: ChannelConfig,
    /// Optional Redis REST endpoint for the event publisher.
    pub redis_url: Option<String>,
    pub redis_token: Option<String>,
    /// Optional PostgreSQL connection string for the durable stores.
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_timeout_secs: 120,
            worker_count: 4,
            flush_size: 5_000,
            aggregation_depth: 3,
            metadata_retry_attempts: 3,
            metadata_retry_backoff_ms: 100,
            channels: ChannelConfig::default(),
            redis_url: None,
            redis_token: None,
            database_url: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            queue_timeout_secs: env_parse("CONVEYOR_QUEUE_TIMEOUT_SECS", defaults.queue_timeout_secs),
            worker_count: env_parse("CONVEYOR_WORKER_COUNT", defaults.worker_count),
            flush_size: env_parse("CONVEYOR_FLUSH_SIZE", defaults.flush_size).max(1),
            aggregation_depth: env_parse("CONVEYOR_AGGREGATION_DEPTH", defaults.aggregation_depth)
                .clamp(1, 3),
            metadata_retry_attempts: env_parse(
                "CONVEYOR_METADATA_RETRY_ATTEMPTS",
                defaults.metadata_retry_attempts,
            )
            .max(1),
            metadata_retry_backoff_ms: env_parse(
                "CONVEYOR_METADATA_RETRY_BACKOFF_MS",
                defaults.metadata_retry_backoff_ms,
            ),
            channels: ChannelConfig {
                started: env_or("CONVEYOR_CHANNEL_STARTED", &defaults.channels.started),
                progress: env_or("CONVEYOR_CHANNEL_PROGRESS", &defaults.channels.progress),
                completed: env_or("CONVEYOR_CHANNEL_COMPLETED", &defaults.channels.completed),
                failed: env_or("CONVEYOR_CHANNEL_FAILED", &defaults.channels.failed),
            },
            redis_url: env::var("CONVEYOR_REDIS_URL").ok(),
            redis_token: env::var("CONVEYOR_REDIS_TOKEN").ok(),
            database_url: env::var("DATABASE_URL").ok(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
