//! A bounded pool of reusable handles with FIFO waiters.
//!
//! Capacity is counted as `available + in_use + creating + checking` and
//! never exceeds `max_instances`. Freed capacity (a released instance or an
//! abandoned creation slot) goes to the longest-waiting acquirer first.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::resource::{ResourceFactory, ResourceHandle};
use crate::error::{PlatformError, PlatformResult};
use crate::events::{DependencyPoolEvent, EventBus, PoolAction};

/// Pool-unique instance identifier.
pub type InstanceId = u64;

/// A handle on loan from a pool.
#[derive(Debug)]
pub struct PooledInstance {
    id: InstanceId,
    pool: String,
    handle: ResourceHandle,
    created_at: DateTime<Utc>,
    last_validated_at: DateTime<Utc>,
    idle_since: Instant,
    use_count: u64,
}

impl PooledInstance {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Name of the pool that owns this instance.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_validated_at(&self) -> DateTime<Utc> {
        self.last_validated_at
    }

    /// How many times this instance has been lent out.
    pub fn use_count(&self) -> u64 {
        self.use_count
    }
}

/// Sizing and lifetime limits for one pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_instances: usize,
    /// Creation or validation failures tolerated per acquire.
    pub max_replacements: u32,
    pub max_idle: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_instances: 5,
            max_replacements: 3,
            max_idle: Duration::from_secs(3600),
        }
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool: String,
    pub resource_type: String,
    pub max_instances: usize,
    pub in_use: usize,
    pub available: usize,
    pub creating: usize,
    pub waiting: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    /// Instance id to owner.
    pub owners: BTreeMap<InstanceId, String>,
}

/// A release the pool refused. The instance is handed back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ReleaseRejected {
    pub error: PlatformError,
    pub instance: PooledInstance,
}

/// A bounded, validating resource pool. Cheap to clone.
#[derive(Clone)]
pub struct DependencyPool {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    factory: Arc<dyn ResourceFactory>,
    settings: PoolSettings,
    bus: Arc<EventBus>,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    available: VecDeque<PooledInstance>,
    in_use: HashMap<InstanceId, String>,
    creating: usize,
    checking: usize,
    waiters: VecDeque<Waiter>,
    next_instance: InstanceId,
    next_waiter: u64,
    total_created: u64,
    total_destroyed: u64,
    closed: bool,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.available.len() + self.in_use.len() + self.creating + self.checking
    }
}

struct Waiter {
    id: u64,
    owner: String,
    tx: oneshot::Sender<ClaimGuard>,
}

/// What an acquirer holds while it validates or creates.
enum Claim {
    /// An existing instance, already recorded as in use by the acquirer.
    Instance(PooledInstance),
    /// Permission to create one instance, counted in `creating`.
    Slot,
    Spent,
}

/// Returns its claim to the pool if dropped before being consumed, so an
/// abandoned acquire never leaks capacity.
struct ClaimGuard {
    claim: Claim,
    inner: Arc<Inner>,
}

impl ClaimGuard {
    fn take_instance(&mut self) -> Option<PooledInstance> {
        match std::mem::replace(&mut self.claim, Claim::Spent) {
            Claim::Instance(instance) => Some(instance),
            other => {
                self.claim = other;
                None
            }
        }
    }

    /// Turns a held instance that failed validation into a creation slot.
    fn discard_instance(&mut self) -> Option<PooledInstance> {
        let instance = self.take_instance()?;
        let mut state = self.inner.lock();
        state.in_use.remove(&instance.id);
        state.creating += 1;
        state.total_destroyed += 1;
        drop(state);
        self.claim = Claim::Slot;
        Some(instance)
    }

    /// Turns a held creation slot into a new instance owned by `owner`.
    fn fill(&mut self, handle: ResourceHandle, owner: &str) -> PooledInstance {
        let mut state = self.inner.lock();
        if matches!(self.claim, Claim::Slot) {
            state.creating -= 1;
        }
        self.claim = Claim::Spent;
        let id = state.next_instance;
        state.next_instance += 1;
        state.total_created += 1;
        state.in_use.insert(id, owner.to_string());
        let now = Utc::now();
        PooledInstance {
            id,
            pool: self.inner.name.clone(),
            handle,
            created_at: now,
            last_validated_at: now,
            idle_since: Instant::now(),
            use_count: 1,
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let claim = std::mem::replace(&mut self.claim, Claim::Spent);
        if matches!(claim, Claim::Spent) {
            return;
        }
        let orphan = {
            let mut state = self.inner.lock();
            if let Claim::Instance(instance) = &claim {
                state.in_use.remove(&instance.id);
            }
            self.inner.recycle(&mut state, claim)
        };
        if let Some(instance) = orphan {
            self.inner.destroy_detached(instance);
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offers freed capacity to waiters in arrival order, then parks it.
    /// Returns an instance that must be destroyed because the pool is closed.
    fn recycle(self: &Arc<Self>, state: &mut PoolState, mut claim: Claim) -> Option<PooledInstance> {
        if state.closed {
            return match claim {
                Claim::Instance(instance) => {
                    state.total_destroyed += 1;
                    Some(instance)
                }
                Claim::Slot => {
                    state.creating -= 1;
                    None
                }
                Claim::Spent => None,
            };
        }

        while let Some(waiter) = state.waiters.pop_front() {
            if let Claim::Instance(instance) = &claim {
                state.in_use.insert(instance.id, waiter.owner.clone());
            }
            let guard = ClaimGuard {
                claim: std::mem::replace(&mut claim, Claim::Spent),
                inner: Arc::clone(self),
            };
            match waiter.tx.send(guard) {
                Ok(()) => {
                    debug!(pool = %self.name, owner = %waiter.owner, "Handed capacity to waiter");
                    return None;
                }
                Err(mut returned) => {
                    claim = std::mem::replace(&mut returned.claim, Claim::Spent);
                    if let Claim::Instance(instance) = &claim {
                        state.in_use.remove(&instance.id);
                    }
                }
            }
        }

        match claim {
            Claim::Instance(instance) => state.available.push_back(instance),
            Claim::Slot => state.creating -= 1,
            Claim::Spent => {}
        }
        None
    }

    fn destroy_detached(&self, instance: PooledInstance) {
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let factory = Arc::clone(&self.factory);
            runtime.spawn(async move { factory.destroy(instance.handle).await });
        }
    }

    fn emit(
        &self,
        action: PoolAction,
        owner: Option<&str>,
        instance: Option<InstanceId>,
        detail: Option<String>,
    ) {
        let (in_use, available) = {
            let state = self.lock();
            (state.in_use.len(), state.available.len())
        };
        let event = DependencyPoolEvent {
            action,
            pool: self.name.clone(),
            resource_type: self.factory.resource_type().to_string(),
            owner: owner.map(String::from),
            instance,
            in_use,
            available,
            detail,
        };
        self.bus.emit(&event, owner);
    }
}

impl DependencyPool {
    /// Creates an empty pool. Instances are created lazily on acquire.
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn ResourceFactory>,
        settings: PoolSettings,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                factory,
                settings,
                bus,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn resource_type(&self) -> &str {
        self.inner.factory.resource_type()
    }

    pub fn settings(&self) -> PoolSettings {
        self.inner.settings
    }

    /// Lends an instance to `owner`, waiting at most `timeout` for capacity.
    ///
    /// A zero timeout never waits. Reused instances are validated first;
    /// instances that fail are destroyed and replaced, up to
    /// `max_replacements` failures before the pool reports exhaustion.
    pub async fn acquire(&self, owner: &str, timeout: Duration) -> PlatformResult<PooledInstance> {
        let mut guard = self.wait_for_claim(owner, timeout).await?;
        let mut failures = 0u32;

        loop {
            match &guard.claim {
                Claim::Instance(instance) => {
                    let id = instance.id;
                    if self.inner.factory.validate(&instance.handle).await {
                        if let Some(mut instance) = guard.take_instance() {
                            instance.last_validated_at = Utc::now();
                            instance.use_count += 1;
                            self.inner.emit(PoolAction::Acquire, Some(owner), Some(id), None);
                            return Ok(instance);
                        }
                    } else if let Some(stale) = guard.discard_instance() {
                        failures += 1;
                        warn!(pool = %self.inner.name, instance = id, "Pooled instance failed validation, replacing");
                        self.inner.emit(
                            PoolAction::ValidationFailed,
                            Some(owner),
                            Some(id),
                            None,
                        );
                        self.inner.factory.destroy(stale.handle).await;
                    }
                }
                Claim::Slot => {
                    if failures > self.inner.settings.max_replacements {
                        return Err(PlatformError::pool_exhausted(
                            self.inner.name.clone(),
                            format!("{failures} consecutive creation or validation failures"),
                        ));
                    }
                    match self.inner.factory.create().await {
                        Ok(handle) => {
                            let instance = guard.fill(handle, owner);
                            debug!(pool = %self.inner.name, instance = instance.id, owner, "Created pooled instance");
                            self.inner.emit(
                                PoolAction::Acquire,
                                Some(owner),
                                Some(instance.id),
                                Some("created".to_string()),
                            );
                            return Ok(instance);
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(pool = %self.inner.name, error = %e, "Failed to create pooled instance");
                            self.inner.emit(
                                PoolAction::CreateFailed,
                                Some(owner),
                                None,
                                Some(format!("{e:#}")),
                            );
                        }
                    }
                }
                Claim::Spent => {
                    return Err(PlatformError::pool_exhausted(
                        self.inner.name.clone(),
                        "claim lost during acquire",
                    ));
                }
            }
        }
    }

    async fn wait_for_claim(&self, owner: &str, timeout: Duration) -> PlatformResult<ClaimGuard> {
        let (waiter_id, mut rx) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(PlatformError::PoolClosed {
                    pool: self.inner.name.clone(),
                });
            }
            state.waiters.retain(|w| !w.tx.is_closed());

            if state.waiters.is_empty() {
                if let Some(instance) = state.available.pop_front() {
                    state.in_use.insert(instance.id, owner.to_string());
                    return Ok(self.guard(Claim::Instance(instance)));
                }
                if state.occupied() < self.inner.settings.max_instances {
                    state.creating += 1;
                    return Ok(self.guard(Claim::Slot));
                }
            }

            if timeout.is_zero() {
                drop(state);
                self.inner.emit(PoolAction::Timeout, Some(owner), None, None);
                return Err(PlatformError::pool_timeout(self.inner.name.clone(), timeout));
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push_back(Waiter {
                id,
                owner: owner.to_string(),
                tx,
            });
            (id, rx)
        };

        debug!(pool = %self.inner.name, owner, "Waiting for pool capacity");
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(guard)) => Ok(guard),
            Ok(Err(_)) => Err(PlatformError::PoolClosed {
                pool: self.inner.name.clone(),
            }),
            Err(_) => {
                let still_queued = {
                    let mut state = self.inner.lock();
                    match state.waiters.iter().position(|w| w.id == waiter_id) {
                        Some(pos) => {
                            state.waiters.remove(pos);
                            true
                        }
                        None => false,
                    }
                };
                if still_queued {
                    self.inner.emit(PoolAction::Timeout, Some(owner), None, None);
                    return Err(PlatformError::pool_timeout(self.inner.name.clone(), timeout));
                }
                // Capacity was handed over as the deadline passed.
                rx.try_recv().map_err(|_| PlatformError::PoolClosed {
                    pool: self.inner.name.clone(),
                })
            }
        }
    }

    fn guard(&self, claim: Claim) -> ClaimGuard {
        ClaimGuard {
            claim,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns `instance` to the pool. Only its current owner may release it.
    pub async fn release(
        &self,
        owner: &str,
        mut instance: PooledInstance,
    ) -> Result<(), ReleaseRejected> {
        let id = instance.id;
        let orphan = {
            let mut state = self.inner.lock();
            let owned = instance.pool == self.inner.name
                && state.in_use.get(&id).is_some_and(|current| current == owner);
            if !owned {
                drop(state);
                warn!(pool = %self.inner.name, instance = id, owner, "Rejected release from non-owner");
                self.inner.emit(
                    PoolAction::ReleaseRejected,
                    Some(owner),
                    Some(id),
                    Some("caller does not own this instance".to_string()),
                );
                return Err(ReleaseRejected {
                    error: PlatformError::NotOwner {
                        pool: self.inner.name.clone(),
                        instance: id,
                        owner: owner.to_string(),
                    },
                    instance,
                });
            }
            state.in_use.remove(&id);
            instance.idle_since = Instant::now();
            self.inner.recycle(&mut state, Claim::Instance(instance))
        };

        let detail = if let Some(instance) = orphan {
            self.inner.factory.destroy(instance.handle).await;
            Some("destroyed (pool shut down)".to_string())
        } else {
            None
        };
        self.inner.emit(PoolAction::Release, Some(owner), Some(id), detail);
        Ok(())
    }

    /// Destroys idle instances older than `max_idle` and idle instances that
    /// no longer validate. Returns how many were destroyed.
    pub async fn cleanup_expired(&self) -> usize {
        let max_idle = self.inner.settings.max_idle;
        let (expired, candidates) = {
            let mut state = self.inner.lock();
            let (expired, candidates): (Vec<_>, Vec<_>) = state
                .available
                .drain(..)
                .partition(|i| i.idle_since.elapsed() >= max_idle);
            state.checking += candidates.len();
            state.total_destroyed += expired.len() as u64;
            (expired, candidates)
        };

        let mut healthy = Vec::with_capacity(candidates.len());
        let mut broken = Vec::new();
        for instance in candidates {
            if self.inner.factory.validate(&instance.handle).await {
                healthy.push(instance);
            } else {
                broken.push(instance);
            }
        }

        let mut orphans = Vec::new();
        {
            let mut state = self.inner.lock();
            state.checking -= healthy.len() + broken.len();
            state.total_destroyed += broken.len() as u64;
            for instance in healthy {
                if let Some(orphan) = self.inner.recycle(&mut state, Claim::Instance(instance)) {
                    orphans.push(orphan);
                }
            }
        }

        let removed = expired.len() + broken.len();
        for instance in expired.into_iter().chain(broken).chain(orphans) {
            self.inner.factory.destroy(instance.handle).await;
        }
        if removed > 0 {
            info!(pool = %self.inner.name, removed, "Cleaned up idle pool instances");
            self.inner.emit(
                PoolAction::Cleanup,
                None,
                None,
                Some(format!("destroyed {removed} idle or invalid instances")),
            );
        }
        removed
    }

    /// Closes the pool: waiters fail with `PoolClosed`, idle instances are
    /// destroyed and in-use instances are destroyed when released.
    pub async fn shutdown(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.available.drain(..).collect();
            state.total_destroyed += idle.len() as u64;
            (idle, std::mem::take(&mut state.waiters))
        };
        let woken = waiters.len();
        drop(waiters);

        let destroyed = idle.len();
        for instance in idle {
            self.inner.factory.destroy(instance.handle).await;
        }
        info!(pool = %self.inner.name, destroyed, woken, "Pool shut down");
        self.inner.emit(
            PoolAction::Shutdown,
            None,
            None,
            Some(format!("destroyed {destroyed} idle instances, woke {woken} waiters")),
        );
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            pool: self.inner.name.clone(),
            resource_type: self.inner.factory.resource_type().to_string(),
            max_instances: self.inner.settings.max_instances,
            in_use: state.in_use.len(),
            available: state.available.len(),
            creating: state.creating + state.checking,
            waiting: state.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            total_created: state.total_created,
            total_destroyed: state.total_destroyed,
            owners: state
                .in_use
                .iter()
                .map(|(id, owner)| (*id, owner.clone()))
                .collect(),
        }
    }
}
