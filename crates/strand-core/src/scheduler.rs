// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler loop.
//!
//! Polls for due strands, leases them and dispatches each on a bounded pool of
//! tokio tasks. Every dispatch gets its own lease token, so a strand is never
//! executed by two workers at once, within or across processes.
//!
//! A dispatch that outlives [`SchedulerConfig::step_timeout`] is dropped. Its
//! lease is left in place and the strand is picked up again once the lease
//! expires, from its last committed state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, env_positive};
use crate::dispatcher::{DEFAULT_YIELD_BACKOFF, DispatchOutcome, Dispatcher};
use crate::error::CoreError;
use crate::persistence::Persistence;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrent dispatches.
    pub worker_count: usize,
    /// How long a dispatch owns its strand.
    pub lease_ttl: Duration,
    /// How long to wait between polls when nothing is due.
    pub poll_interval: Duration,
    /// Backoff used by `Yield`.
    pub yield_backoff: Duration,
    /// Prefix of the lease tokens issued by this scheduler.
    pub scheduler_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            lease_ttl: Duration::from_secs(120),
            poll_interval: Duration::from_millis(1000),
            yield_backoff: DEFAULT_YIELD_BACKOFF,
            scheduler_id: format!("scheduler-{}", Uuid::new_v4()),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `STRAND_WORKER_COUNT` (default: 8)
    /// - `STRAND_LEASE_TTL_SECS` (default: 120)
    /// - `STRAND_POLL_INTERVAL_MS` (default: 1000)
    /// - `STRAND_YIELD_BACKOFF_SECS` (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_count = env_positive("STRAND_WORKER_COUNT", 8)?;

        Ok(Self {
            worker_count: usize::try_from(worker_count)
                .map_err(|_| ConfigError::Invalid("STRAND_WORKER_COUNT", "too large"))?,
            lease_ttl: Duration::from_secs(env_positive("STRAND_LEASE_TTL_SECS", 120)?),
            poll_interval: Duration::from_millis(env_positive("STRAND_POLL_INTERVAL_MS", 1000)?),
            yield_backoff: Duration::from_secs(env_positive("STRAND_YIELD_BACKOFF_SECS", 5)?),
            ..Self::default()
        })
    }

    /// Upper bound on a single dispatch. A quarter of the lease, so a step
    /// that hangs is abandoned well before anyone else may take the strand.
    pub fn step_timeout(&self) -> Duration {
        self.lease_ttl / 4
    }
}

/// Scheduler that runs as a background task.
pub struct Scheduler {
    persistence: Arc<dyn Persistence>,
    dispatcher: Dispatcher,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    wakeup: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        dispatcher: Dispatcher,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            persistence,
            dispatcher,
            permits: Arc::new(Semaphore::new(config.worker_count.max(1))),
            config,
            wakeup: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Dispatches currently running.
    pub fn in_flight(&self) -> usize {
        self.config.worker_count.max(1) - self.permits.available_permits()
    }

    /// Run the scheduler loop until shutdown is signalled, then wait for
    /// in-flight dispatches to finish.
    pub async fn run(&self) {
        info!(
            scheduler_id = %self.config.scheduler_id,
            worker_count = self.config.worker_count,
            lease_ttl_secs = self.config.lease_ttl.as_secs(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Scheduler started"
        );

        loop {
            if let Err(e) = self.tick().await {
                error!(error = %e, "Failed to poll due strands");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler shutting down");
                    break;
                }
                // A finished dispatch may have made its strand (or a parent) due again.
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        let all = u32::try_from(self.config.worker_count.max(1)).unwrap_or(u32::MAX);
        if self.permits.acquire_many(all).await.is_ok() {
            debug!("All in-flight dispatches finished");
        }

        info!("Scheduler stopped");
    }

    /// One polling pass: lease as many due strands as there are free
    /// workers and spawn their dispatches. Returns how many were started.
    pub async fn tick(&self) -> Result<usize, CoreError> {
        let available = self.permits.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.lease_ttl).map_err(|e| {
            CoreError::ValidationError {
                field: "lease_ttl".to_string(),
                message: e.to_string(),
            }
        })?;

        let due = self.persistence.poll_due(now, available as i64).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut started = 0;
        for id in due {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };

            let owner = format!("{}/{}", self.config.scheduler_id, Uuid::new_v4());
            if !self.persistence.try_lease(id, &owner, now + ttl, now).await? {
                debug!(strand_id = %id, "Lost lease race, skipping");
                continue;
            }

            let dispatcher = self.dispatcher.clone();
            let wakeup = self.wakeup.clone();
            let step_timeout = self.config.step_timeout();

            tokio::spawn(async move {
                let _permit = permit;

                match tokio::time::timeout(step_timeout, dispatcher.dispatch(id, &owner, Utc::now()))
                    .await
                {
                    Ok(Ok(DispatchOutcome::Committed(record))) => {
                        debug!(
                            strand_id = %id,
                            label = %record.label,
                            status = %record.status,
                            "Dispatch committed"
                        );
                    }
                    Ok(Ok(outcome)) => {
                        debug!(strand_id = %id, outcome = ?outcome, "Dispatch finished");
                    }
                    Ok(Err(e)) => {
                        error!(strand_id = %id, error = %e, "Dispatch failed");
                    }
                    Err(_) => {
                        warn!(
                            strand_id = %id,
                            timeout_secs = step_timeout.as_secs(),
                            "Step timed out, retrying after lease expiry"
                        );
                    }
                }

                wakeup.notify_one();
            });

            started += 1;
        }

        if started > 0 {
            debug!(count = started, "Dispatched due strands");
        }

        Ok(started)
    }
}
