//! Dependency pools: bounded, validated, reusable handles lent to tasks.
//!
//! A [`PoolManager`] owns every configured [`DependencyPool`] and routes
//! acquire and release calls by pool name. Pools are registered once at
//! platform init and never added afterwards.

#[allow(clippy::module_inception)]
mod pool;
mod resource;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use pool::{DependencyPool, PoolSettings, PoolStats, PooledInstance, ReleaseRejected};
pub use resource::{PoolKind, ResourceHandle};
#[cfg(test)]
pub(crate) use resource::FilesystemFactory;
use resource::build_factory;

use crate::config::PoolConfig;
use crate::error::{PlatformError, PlatformResult};
use crate::events::EventBus;

/// Routes pool operations by name and runs periodic idle cleanup.
pub struct PoolManager {
    pools: HashMap<String, DependencyPool>,
    maintenance: Mutex<Option<Maintenance>>,
}

struct Maintenance {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PoolManager {
    /// Creates a manager with no pools.
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
            maintenance: Mutex::new(None),
        }
    }

    /// Builds every configured pool.
    pub fn from_config(
        configs: &BTreeMap<String, PoolConfig>,
        bus: &Arc<EventBus>,
    ) -> PlatformResult<Self> {
        let mut manager = Self::new();
        for (name, config) in configs {
            let factory = build_factory(name, config)
                .map_err(|e| PlatformError::configuration(format!("{e:#}")))?;
            manager.register(DependencyPool::new(
                name.clone(),
                factory,
                config.settings(),
                Arc::clone(bus),
            ));
        }
        Ok(manager)
    }

    /// Adds a pool. A pool with the same name is replaced.
    pub fn register(&mut self, pool: DependencyPool) {
        debug!(pool = pool.name(), resource = pool.resource_type(), "Registered pool");
        self.pools.insert(pool.name().to_string(), pool);
    }

    /// Looks up a pool by name.
    pub fn pool(&self, name: &str) -> PlatformResult<&DependencyPool> {
        self.pools
            .get(name)
            .ok_or_else(|| PlatformError::configuration(format!("Unknown pool '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    /// Registered pool names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn acquire(
        &self,
        owner: &str,
        pool: &str,
        timeout: Duration,
    ) -> PlatformResult<PooledInstance> {
        self.pool(pool)?.acquire(owner, timeout).await
    }

    /// Returns `instance` to the pool it came from.
    pub async fn release(&self, owner: &str, instance: PooledInstance) -> Result<(), ReleaseRejected> {
        match self.pools.get(instance.pool()) {
            Some(pool) => pool.release(owner, instance).await,
            None => Err(ReleaseRejected {
                error: PlatformError::configuration(format!(
                    "Unknown pool '{}'",
                    instance.pool()
                )),
                instance,
            }),
        }
    }

    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    /// Runs idle cleanup on every pool. Returns destroyed counts by pool.
    pub async fn cleanup_expired(&self) -> BTreeMap<String, usize> {
        let mut removed = BTreeMap::new();
        for (name, pool) in &self.pools {
            removed.insert(name.clone(), pool.cleanup_expired().await);
        }
        removed
    }

    /// Starts a background task that runs [`Self::cleanup_expired`] every
    /// `interval`. A zero interval disables maintenance.
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            debug!("Pool maintenance disabled");
            return;
        }
        let mut slot = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed: usize = manager.cleanup_expired().await.values().sum();
                        if removed > 0 {
                            info!(removed, "Pool maintenance removed idle instances");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        info!(interval_secs = interval.as_secs(), "Started pool maintenance");
        *slot = Some(Maintenance { stop, task });
    }

    /// Stops the maintenance task, if running, and waits for it to exit.
    pub async fn stop_maintenance(&self) {
        let maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Maintenance { stop, task }) = maintenance {
            let _ = stop.send(true);
            if let Err(e) = task.await {
                warn!("Pool maintenance task ended abnormally: {}", e);
            }
        }
    }

    /// Stops maintenance and shuts down every pool.
    pub async fn shutdown(&self) {
        self.stop_maintenance().await;
        for pool in self.pools.values() {
            pool.shutdown().await;
        }
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fs_config(path: &str, max_instances: usize) -> PoolConfig {
        PoolConfig {
            kind: PoolKind::Filesystem,
            max_instances,
            paths: vec![path.to_string()],
            binary: None,
            max_replacements: 1,
            max_idle_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_manager_routes_by_pool_name() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new(64));
        let mut configs = BTreeMap::new();
        configs.insert(
            "workspace".to_string(),
            fs_config(&dir.path().to_string_lossy(), 1),
        );
        let manager = PoolManager::from_config(&configs, &bus).unwrap();

        let instance = manager
            .acquire("t1", "workspace", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(instance.pool(), "workspace");
        assert_eq!(manager.stats()["workspace"].in_use, 1);

        manager.release("t1", instance).await.unwrap();
        assert_eq!(manager.stats()["workspace"].available, 1);
    }

    #[tokio::test]
    async fn test_unknown_pool_is_configuration_error() {
        let manager = PoolManager::new();
        let err = manager
            .acquire("t1", "nope", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_agent_cli_pool_requires_binary() {
        let bus = Arc::new(EventBus::new(8));
        let mut configs = BTreeMap::new();
        configs.insert(
            "cli".to_string(),
            PoolConfig {
                kind: PoolKind::AgentCli,
                binary: None,
                ..fs_config("/tmp", 1)
            },
        );
        let err = PoolManager::from_config(&configs, &bus).err().unwrap();
        assert!(err.to_string().contains("requires 'binary'"));
    }

    #[tokio::test]
    async fn test_maintenance_cleans_idle_instances() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new(64));
        let mut configs = BTreeMap::new();
        configs.insert("ws".to_string(), fs_config(&dir.path().to_string_lossy(), 2));
        let manager = Arc::new(PoolManager::from_config(&configs, &bus).unwrap());

        let instance = manager.acquire("t1", "ws", Duration::from_secs(1)).await.unwrap();
        manager.release("t1", instance).await.unwrap();

        manager.start_maintenance(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        manager.stop_maintenance().await;

        assert_eq!(manager.stats()["ws"].available, 0);
        assert_eq!(manager.stats()["ws"].total_destroyed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_pools() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new(64));
        let mut configs = BTreeMap::new();
        configs.insert("ws".to_string(), fs_config(&dir.path().to_string_lossy(), 1));
        let manager = PoolManager::from_config(&configs, &bus).unwrap();

        manager.shutdown().await;
        let err = manager
            .acquire("t1", "ws", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::PoolClosed { .. }));
    }
}
