// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for strand-core.
//!
//! [`StrandRuntime`] wires an [`Engine`] to its background tasks (the
//! scheduler loop and, when enabled, the cleanup worker) inside an existing
//! tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strand_core::persistence::PostgresPersistence;
//! use strand_core::runtime::StrandRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     strand_core::migrations::run_postgres(&pool).await?;
//!
//!     let runtime = StrandRuntime::builder()
//!         .persistence(Arc::new(PostgresPersistence::new(pool)))
//!         .registry(registry)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.engine().create_record("Vm", serde_json::json!({})).await?;
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use crate::config::Config;
use crate::engine::Engine;
use crate::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use crate::registry::WorkflowRegistry;
use crate::scheduler::SchedulerConfig;

/// Connect to the database named by `config` and run its migrations.
pub async fn connect(config: &Config) -> Result<Arc<dyn Persistence>> {
    let max_connections = u32::try_from(config.scheduler.worker_count + 2).unwrap_or(u32::MAX);

    if config.is_sqlite() {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&config.database_url)
            .await
            .context("failed to connect to SQLite")?;
        crate::migrations::run_sqlite(&pool)
            .await
            .context("failed to run SQLite migrations")?;
        info!("SQLite connection established");
        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(&config.database_url)
            .await
            .context("failed to connect to PostgreSQL")?;
        crate::migrations::run_postgres(&pool)
            .await
            .context("failed to run PostgreSQL migrations")?;
        info!("PostgreSQL connection established");
        Ok(Arc::new(PostgresPersistence::new(pool)))
    }
}

/// Builder for creating a [`StrandRuntime`].
#[derive(Default)]
pub struct StrandRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    registry: Option<Arc<WorkflowRegistry>>,
    scheduler: SchedulerConfig,
    cleanup: CleanupWorkerConfig,
}

impl std::fmt::Debug for StrandRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrandRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl StrandRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the workflow registry (required).
    pub fn registry(mut self, registry: WorkflowRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Set the scheduler configuration.
    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Set the cleanup worker configuration. Disabled by default.
    pub fn cleanup_config(mut self, config: CleanupWorkerConfig) -> Self {
        self.cleanup = config;
        self
    }

    /// Take scheduler and cleanup settings from a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.scheduler_config(config.scheduler.clone())
            .cleanup_config(config.cleanup.clone())
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<StrandRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;

        if registry.is_empty() {
            anyhow::bail!("registry has no workflows");
        }

        Ok(StrandRuntimeConfig {
            engine: Engine::new(persistence, registry).with_config(&self.scheduler),
            scheduler: self.scheduler,
            cleanup: self.cleanup,
        })
    }
}

/// Configuration for a [`StrandRuntime`].
pub struct StrandRuntimeConfig {
    engine: Engine,
    scheduler: SchedulerConfig,
    cleanup: CleanupWorkerConfig,
}

impl std::fmt::Debug for StrandRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrandRuntimeConfig")
            .field("engine", &"...")
            .field("scheduler", &self.scheduler)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl Worker {
    async fn stop(self, name: &str) -> Result<()> {
        self.shutdown.notify_one();
        self.handle.await.map_err(|e| {
            error!("{} task panicked: {}", name, e);
            anyhow::anyhow!("{} task panicked: {}", name, e)
        })
    }
}

impl StrandRuntimeConfig {
    /// Start the runtime, spawning the scheduler (and cleanup) tasks.
    pub async fn start(self) -> Result<StrandRuntime> {
        let scheduler = self.engine.scheduler(self.scheduler);
        let scheduler_worker = Worker {
            shutdown: scheduler.shutdown_handle(),
            handle: tokio::spawn(async move { scheduler.run().await }),
        };

        let cleanup_worker = if self.cleanup.enabled {
            let worker = CleanupWorker::new(self.engine.persistence().clone(), self.cleanup);
            Some(Worker {
                shutdown: worker.shutdown_handle(),
                handle: tokio::spawn(async move { worker.run().await }),
            })
        } else {
            None
        };

        info!(
            cleanup = cleanup_worker.is_some(),
            "StrandRuntime started"
        );

        Ok(StrandRuntime {
            engine: self.engine,
            scheduler: scheduler_worker,
            cleanup: cleanup_worker,
        })
    }
}

/// A running strand engine embedded in an application.
///
/// The runtime manages:
/// - the scheduler loop dispatching due strands
/// - the cleanup worker, when enabled
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct StrandRuntime {
    engine: Engine,
    scheduler: Worker,
    cleanup: Option<Worker>,
}

impl StrandRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> StrandRuntimeBuilder {
        StrandRuntimeBuilder::new()
    }

    /// The engine API, for creating strands and raising signals.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        self.engine.persistence()
    }

    /// Check if the scheduler is still running.
    pub fn is_running(&self) -> bool {
        !self.scheduler.handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops polling, waits for in-flight dispatches to finish, then stops
    /// the cleanup worker.
    pub async fn shutdown(self) -> Result<()> {
        info!("StrandRuntime shutting down...");

        self.scheduler.stop("scheduler").await?;
        if let Some(cleanup) = self.cleanup {
            cleanup.stop("cleanup worker").await?;
        }

        info!("StrandRuntime shutdown complete");
        Ok(())
    }
}
