// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for cleaning up finished strands.
//!
//! Terminal strands older than the configured retention period are deleted
//! together with their signals. A child is kept while a running parent may
//! still collect it; once collected, or once the parent is gone or finished,
//! it is eligible like any other strand.
//!
//! The worker is opt-in. Applications that keep strands as an audit trail, or
//! delete them themselves, leave it disabled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::{ConfigError, env_or, env_positive};
use crate::error::CoreError;
use crate::persistence::Persistence;

/// Configuration for the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Whether cleanup is enabled.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Maximum age of terminal strands before deletion.
    pub max_age: Duration,
    /// Maximum strands to delete per batch (keeps transactions short).
    pub batch_size: i64,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(30 * 24 * 3600),
            batch_size: 100,
        }
    }
}

fn parse_flag(key: &'static str) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be true or false")),
        },
        Err(_) => Ok(false),
    }
}

impl CleanupWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STRAND_CLEANUP_ENABLED`: "true" or "1" to enable (default: false)
    /// - `STRAND_CLEANUP_POLL_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `STRAND_CLEANUP_MAX_AGE_DAYS`: days before terminal strands are deleted (default: 30)
    /// - `STRAND_CLEANUP_BATCH_SIZE`: max strands per batch (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let enabled = parse_flag("STRAND_CLEANUP_ENABLED")?;
        let poll_interval_secs = env_positive("STRAND_CLEANUP_POLL_INTERVAL_SECS", 3600)?;
        let max_age_days: u64 = env_or(
            "STRAND_CLEANUP_MAX_AGE_DAYS",
            30,
            "must be a non-negative integer",
        )?;
        let batch_size = env_positive("STRAND_CLEANUP_BATCH_SIZE", 100)?;

        Ok(Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_age: Duration::from_secs(max_age_days.saturating_mul(24 * 3600)),
            batch_size: i64::try_from(batch_size)
                .map_err(|_| ConfigError::Invalid("STRAND_CLEANUP_BATCH_SIZE", "too large"))?,
        })
    }
}

/// Background worker that deletes old terminal strands.
pub struct CleanupWorker {
    persistence: Arc<dyn Persistence>,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(persistence: Arc<dyn Persistence>, config: CleanupWorkerConfig) -> Self {
        Self {
            persistence,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until shutdown is signalled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Strand cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_days = self.config.max_age.as_secs() / 86400,
            batch_size = self.config.batch_size,
            "Strand cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Strand cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "Failed to clean up old strands");
                    }
                }
            }
        }

        info!("Strand cleanup worker stopped");
    }

    /// Run one cleanup cycle as of `now`. Returns the number of deleted strands.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let max_age =
            chrono::Duration::from_std(self.config.max_age).map_err(|e| CoreError::ValidationError {
                field: "max_age".to_string(),
                message: e.to_string(),
            })?;
        let cutoff = now - max_age;

        let mut total_deleted = 0u64;

        loop {
            let ids = self
                .persistence
                .get_collectable_records(cutoff, self.config.batch_size)
                .await?;

            if ids.is_empty() {
                break;
            }

            let batch_size = ids.len();
            let deleted = self.persistence.delete_records_batch(&ids).await?;
            total_deleted += deleted;

            debug!(
                batch_size = batch_size,
                deleted = deleted,
                total_deleted = total_deleted,
                "Cleaned up batch of strands"
            );

            // A short batch means nothing older is left.
            if batch_size < self.config.batch_size as usize || deleted == 0 {
                break;
            }
        }

        if total_deleted > 0 {
            info!(
                total_deleted = total_deleted,
                cutoff = %cutoff,
                "Strand cleanup cycle completed"
            );
        } else {
            debug!("Strand cleanup cycle completed, no old strands found");
        }

        Ok(total_deleted)
    }
}
