//! Platform lifecycle: builds every shared component once and tears them
//! down in order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::agent::{build_agent, Agent};
use crate::config::{Config, TaskConfig};
use crate::error::PlatformResult;
use crate::events::{install_exporters, EventBus, Exporters, SystemEvent};
use crate::pipeline::{CancelToken, Pipeline, TaskResult};
use crate::pool::PoolManager;
use crate::sandbox::SandboxManager;
use crate::sink::Sinks;
use crate::usage::UsageTracker;

/// Every long-lived component of a run.
pub struct Platform {
    config: Config,
    bus: Arc<EventBus>,
    pools: Arc<PoolManager>,
    sandbox: Arc<SandboxManager>,
    usage: Arc<UsageTracker>,
    pipeline: Pipeline,
    sinks: Sinks,
    exporters: Mutex<Exporters>,
    shut_down: AtomicBool,
}

impl Platform {
    /// Validates `config` and builds the platform with the configured agent.
    pub async fn init(config: Config) -> Result<Self> {
        config.validate()?;
        let agent = build_agent(&config.agent).context("Failed to build agent")?;
        Self::init_with_agent(config, agent).await
    }

    /// Builds the platform around a given agent.
    pub async fn init_with_agent(config: Config, agent: Arc<dyn Agent>) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(config.events.buffer_capacity));
        let exporters = install_exporters(&bus, &config.events.exporters)?;

        let pools = Arc::new(PoolManager::from_config(&config.pools, &bus)?);
        pools.start_maintenance(Duration::from_secs(config.pool_maintenance.interval_secs));

        let sandbox = Arc::new(SandboxManager::from_config(&config.sandbox, Arc::clone(&bus)));
        if let Err(e) = sandbox.cleanup_orphaned().await {
            warn!("Failed to clean up orphaned sandboxes: {}", e);
        }

        let usage = Arc::new(UsageTracker::new(config.agent.pricing));
        let pipeline = Pipeline::new(
            Arc::clone(&pools),
            Arc::clone(&sandbox),
            agent,
            Arc::clone(&bus),
            Arc::clone(&usage),
        );
        let sinks = Sinks::from_config(&config.sink);

        bus.emit(
            &SystemEvent::Init {
                agent: pipeline.agent_name().to_string(),
                pools: pools.names(),
                strategies: sandbox.strategy_names(),
            },
            None,
        );
        info!(
            agent = pipeline.agent_name(),
            pools = config.pools.len(),
            strategies = config.sandbox.strategies.len(),
            tasks = config.tasks.len(),
            sinks = ?sinks.names(),
            "Platform initialized"
        );

        Ok(Self {
            config,
            bus,
            pools,
            sandbox,
            usage,
            pipeline,
            sinks,
            exporters: Mutex::new(exporters),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn sandbox(&self) -> &Arc<SandboxManager> {
        &self.sandbox
    }

    /// Configured tasks matching `ids`, or all of them when `ids` is empty.
    pub fn select_tasks(&self, ids: &[String]) -> Result<Vec<&TaskConfig>> {
        if ids.is_empty() {
            return Ok(self.config.tasks.iter().collect());
        }
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        for id in &wanted {
            if !self.config.tasks.iter().any(|t| t.id == *id) {
                bail!("No task named '{id}' in the configuration");
            }
        }
        Ok(self
            .config
            .tasks
            .iter()
            .filter(|t| wanted.contains(t.id.as_str()))
            .collect())
    }

    /// Runs one task and hands a fresh result to the sinks.
    pub async fn run_task(&self, task: &TaskConfig, cancel: &CancelToken) -> PlatformResult<TaskResult> {
        let cached = self.pipeline.result(&task.id).is_some();
        let result = self.pipeline.run(task, cancel).await?;
        if !cached {
            self.sinks.deliver(&result, &self.bus).await;
        }
        Ok(result)
    }

    /// Runs `tasks` concurrently. Results come back in input order.
    pub async fn run_tasks(
        &self,
        tasks: &[&TaskConfig],
        cancel: &CancelToken,
    ) -> Vec<PlatformResult<TaskResult>> {
        join_all(tasks.iter().map(|task| self.run_task(task, cancel))).await
    }

    /// Stops maintenance, closes pools and publishes final usage. Only
    /// the first call does anything.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down platform");
        self.pools.shutdown().await;
        self.usage.publish(&self.bus);
        self.bus.emit(
            &SystemEvent::Shutdown {
                events_published: self.bus.published_total(),
            },
            None,
        );
        info!(
            events_published = self.bus.published_total(),
            events_dropped = self.bus.dropped_total(),
            "Platform stopped"
        );
        self.exporters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
    }
}
