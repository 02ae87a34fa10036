// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;

use crate::cleanup_worker::CleanupWorkerConfig;
use crate::scheduler::SchedulerConfig;

/// strand-core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Scheduler loop settings
    pub scheduler: SchedulerConfig,
    /// Retention worker settings
    pub cleanup: CleanupWorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STRAND_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `STRAND_WORKER_COUNT`: concurrent dispatches (default: 8)
    /// - `STRAND_LEASE_TTL_SECS`: lease duration (default: 120)
    /// - `STRAND_POLL_INTERVAL_MS`: idle poll interval (default: 1000)
    /// - `STRAND_YIELD_BACKOFF_SECS`: child wait backoff (default: 5)
    /// - `STRAND_CLEANUP_ENABLED`: run the retention worker (default: false)
    /// - `STRAND_CLEANUP_POLL_INTERVAL_SECS`: retention pass interval (default: 3600)
    /// - `STRAND_CLEANUP_MAX_AGE_DAYS`: retention period (default: 30)
    /// - `STRAND_CLEANUP_BATCH_SIZE`: deletions per pass (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STRAND_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STRAND_DATABASE_URL"))?;

        Ok(Self {
            database_url,
            scheduler: SchedulerConfig::from_env()?,
            cleanup: CleanupWorkerConfig::from_env()?,
        })
    }

    /// Whether the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

/// Read and parse an optional environment variable.
pub(crate) fn env_or<T: FromStr>(
    key: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, expected)),
        Err(_) => Ok(default),
    }
}

/// Read a strictly positive integer.
pub(crate) fn env_positive(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env_or(key, default, "must be a positive integer")? {
        0 => Err(ConfigError::Invalid(key, "must be a positive integer")),
        value => Ok(value),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
