//! Plugin lifecycle management
//!
//! Drives initialize, health-check and shutdown transitions of the plugins in
//! one [`Registry`]. Batch operations follow dependency order with bounded
//! concurrency: independent plugins start in parallel, but a plugin never
//! starts before all of its hard dependencies are `Active`, and never stops
//! before its dependents have stopped. Failures are reported per key.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::api::PluginKey;
use crate::error::{ConfigurationError, DependencyError, LifecycleError};
use crate::events::PluginEvent;
use crate::registry::{PluginInstance, Registry};
use crate::runtime::duration_ms;

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Registered, never initialized
    Uninitialized,
    /// Initialize hook running
    Initializing,
    /// Ready for execution
    Active,
    /// Shut down; may be initialized again
    Inactive,
    /// Initialization, shutdown or health checks failed
    Error,
    /// Administratively disabled
    Disabled,
    /// Administratively held for an update
    Updating,
}

impl PluginStatus {
    /// Whether `self -> to` is an edge of the lifecycle state machine
    pub fn can_transition_to(self, to: Self) -> bool {
        use PluginStatus::*;
        match (self, to) {
            (Error, Error) => false,
            (_, Error) => true,
            (Uninitialized | Inactive | Error, Initializing) => true,
            (Initializing, Active) => true,
            (Active, Inactive) => true,
            (Uninitialized | Inactive | Error, Disabled | Updating) => true,
            (Disabled | Updating, Inactive) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
            Self::Disabled => "disabled",
            Self::Updating => "updating",
        })
    }
}

/// Plugin lifecycle configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Timeout of each initialize/shutdown hook
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
    /// Lifecycle hooks allowed to run at once
    pub max_concurrent_operations: usize,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_timeout: Duration,
    /// Consecutive failed probes that move an active plugin to `Error`
    pub health_failure_threshold: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_concurrent_operations: 10,
            health_check_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
            health_failure_threshold: 3,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.default_timeout.is_zero()
            || self.health_check_interval.is_zero()
            || self.health_check_timeout.is_zero()
        {
            return Err(ConfigurationError::InvalidRuntimeConfig(
                "lifecycle timeouts and intervals must be positive".to_string(),
            ));
        }
        if self.max_concurrent_operations == 0 || self.health_failure_threshold == 0 {
            return Err(ConfigurationError::InvalidRuntimeConfig(
                "lifecycle max_concurrent_operations and health_failure_threshold must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-key outcome of a batch operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: BTreeMap<PluginKey, Result<(), LifecycleError>>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(Result::is_ok)
    }

    pub fn succeeded(&self) -> Vec<PluginKey> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn failed(&self) -> BTreeMap<PluginKey, LifecycleError> {
        self.outcomes
            .iter()
            .filter_map(|(key, outcome)| outcome.clone().err().map(|err| (key.clone(), err)))
            .collect()
    }

    pub fn outcome(&self, key: &PluginKey) -> Option<&Result<(), LifecycleError>> {
        self.outcomes.get(key)
    }
}

/// Health of one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub key: PluginKey,
    pub status: PluginStatus,
    pub healthy: bool,
    pub uptime: Option<Duration>,
    pub error_count: u64,
    pub success_count: u64,
    pub consecutive_failures: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Handle of the background health monitor; stops the task when dropped.
#[derive(Debug)]
pub struct HealthMonitor {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Stop the monitor and wait for its task to end
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// Moves an instance to `Error` if the operation that armed it is dropped
/// before completing.
struct InFlight<'a> {
    manager: &'a LifecycleManager,
    instance: &'a PluginInstance,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.mark_failed(
                self.instance,
                &LifecycleError::Cancelled {
                    key: self.instance.key().clone(),
                },
            );
        }
    }
}

/// Plugin lifecycle manager
#[derive(Clone)]
pub struct LifecycleManager {
    registry: Arc<Registry>,
    config: Arc<LifecycleConfig>,
    permits: Arc<Semaphore>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("config", &self.config)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(registry: Arc<Registry>, config: LifecycleConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_operations.max(1)));
        Self {
            registry,
            config: Arc::new(config),
            permits,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn instance(&self, key: &PluginKey) -> Result<Arc<PluginInstance>, LifecycleError> {
        self.registry
            .get(key)
            .ok_or_else(|| LifecycleError::NotFound(key.clone()))
    }

    fn set_status(&self, instance: &PluginInstance, to: PluginStatus) -> Result<(), LifecycleError> {
        let from = instance.transition(to)?;
        info!(plugin = %instance.key(), %from, %to, "Plugin status changed");
        self.registry.events().emit(&PluginEvent::StatusChanged {
            key: instance.key().clone(),
            from,
            to,
        });
        Ok(())
    }

    fn mark_failed(&self, instance: &PluginInstance, err: &LifecycleError) {
        warn!(plugin = %instance.key(), error = %err, "Plugin lifecycle operation failed");
        if instance.status() != PluginStatus::Error {
            let _ = self.set_status(instance, PluginStatus::Error);
        }
        self.registry.events().emit(&PluginEvent::ErrorOccurred {
            key: instance.key().clone(),
            message: err.to_string(),
        });
    }

    /// Initialize one plugin. Already-active plugins are left alone.
    ///
    /// Every hard dependency must be `Active`. On failure or timeout the
    /// plugin moves to `Error`.
    pub async fn initialize(&self, key: &PluginKey) -> Result<(), LifecycleError> {
        let instance = self.instance(key)?;
        let _serial = instance.lifecycle_lock.lock().await;
        self.initialize_locked(&instance).await
    }

    async fn initialize_locked(&self, instance: &PluginInstance) -> Result<(), LifecycleError> {
        let key = instance.key();
        if instance.status() == PluginStatus::Active {
            return Ok(());
        }

        self.registry.resolution_order(std::slice::from_ref(key))?;
        for dependency in instance.metadata().dependencies() {
            let status = self
                .registry
                .get(dependency)
                .map(|dep| dep.status())
                .ok_or_else(|| DependencyError::MissingDependency {
                    key: key.clone(),
                    missing: dependency.clone(),
                })?;
            if status != PluginStatus::Active {
                return Err(LifecycleError::DependencyNotActive {
                    key: key.clone(),
                    dependency: dependency.clone(),
                    status,
                });
            }
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LifecycleError::Cancelled { key: key.clone() })?;
        self.set_status(instance, PluginStatus::Initializing)?;
        let in_flight = InFlight {
            manager: self,
            instance,
            armed: true,
        };

        let timeout = self.config.default_timeout;
        let outcome =
            tokio::time::timeout(timeout, instance.plugin().initialize(instance.context())).await;
        in_flight.disarm();

        let err = match outcome {
            Ok(Ok(())) => {
                instance.reset_health_failures();
                self.set_status(instance, PluginStatus::Active)?;
                return Ok(());
            }
            Ok(Err(fault)) => LifecycleError::InitializationFailed {
                key: key.clone(),
                reason: fault.to_string(),
            },
            Err(_) => LifecycleError::Timeout {
                key: key.clone(),
                operation: "initialize",
                timeout,
            },
        };
        self.mark_failed(instance, &err);
        Err(err)
    }

    /// Shut one plugin down. Plugins that are not `Active` are left alone.
    pub async fn shutdown(&self, key: &PluginKey) -> Result<(), LifecycleError> {
        let instance = self.instance(key)?;
        let _serial = instance.lifecycle_lock.lock().await;
        self.shutdown_locked(&instance).await
    }

    async fn shutdown_locked(&self, instance: &PluginInstance) -> Result<(), LifecycleError> {
        if instance.status() != PluginStatus::Active {
            return Ok(());
        }
        let key = instance.key();
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LifecycleError::Cancelled { key: key.clone() })?;
        // Leaving `Active` first stops new executions from being admitted.
        self.set_status(instance, PluginStatus::Inactive)?;

        let timeout = self.config.default_timeout;
        let err = match tokio::time::timeout(timeout, instance.plugin().shutdown(instance.context())).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(fault)) => LifecycleError::ShutdownFailed {
                key: key.clone(),
                reason: fault.to_string(),
            },
            Err(_) => LifecycleError::Timeout {
                key: key.clone(),
                operation: "shutdown",
                timeout,
            },
        };
        self.mark_failed(instance, &err);
        Err(err)
    }

    /// Initialize every registered plugin
    pub async fn initialize_all(&self) -> BatchReport {
        self.initialize_batch(&self.registry.keys()).await
    }

    /// Initialize `keys` in dependency order.
    ///
    /// Keys whose dependency chain is broken fail individually; a plugin whose
    /// in-batch hard dependency failed is reported as `DependencyFailed`
    /// without being attempted.
    pub async fn initialize_batch(&self, keys: &[PluginKey]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut runnable = Vec::new();
        for key in keys.iter().collect::<BTreeSet<_>>() {
            if !self.registry.contains(key) {
                report
                    .outcomes
                    .insert(key.clone(), Err(LifecycleError::NotFound(key.clone())));
                continue;
            }
            match self.registry.resolution_order(std::slice::from_ref(key)) {
                Ok(_) => runnable.push(key.clone()),
                Err(err) => {
                    report.outcomes.insert(key.clone(), Err(err.into()));
                }
            }
        }

        let order = match self.registry.resolution_order(&runnable) {
            Ok(order) => order,
            Err(err) => {
                for key in runnable {
                    report.outcomes.insert(key, Err(err.clone().into()));
                }
                return report;
            }
        };
        debug!(order = ?order, "Initializing plugins");

        let batch: BTreeSet<PluginKey> = order.iter().cloned().collect();
        let waits: BTreeMap<PluginKey, Vec<PluginKey>> = order
            .iter()
            .map(|key| {
                let deps = self
                    .registry
                    .dependencies_of(key)
                    .map(|deps| deps.all().filter(|d| batch.contains(*d)).cloned().collect())
                    .unwrap_or_default();
                (key.clone(), deps)
            })
            .collect();

        let hard: BTreeMap<PluginKey, BTreeSet<PluginKey>> = order
            .iter()
            .map(|key| {
                let required = self
                    .registry
                    .dependencies_of(key)
                    .map(|deps| deps.required)
                    .unwrap_or_default();
                (key.clone(), required)
            })
            .collect();

        let mut outcomes = self
            .run_scheduled(order.clone(), waits, move |manager, key, finished| {
                let required = hard.get(&key).cloned().unwrap_or_default();
                async move {
                    if let Some((dependency, _)) = finished
                        .iter()
                        .find(|(dep, ok)| !ok && required.contains(dep))
                    {
                        return Err(LifecycleError::DependencyFailed {
                            key: key.clone(),
                            dependency: dependency.clone(),
                        });
                    }
                    manager.initialize(&key).await
                }
            })
            .await;
        report.outcomes.append(&mut outcomes);
        report
    }

    /// Shut every registered plugin down
    pub async fn shutdown_all(&self) -> BatchReport {
        self.shutdown_batch(&self.registry.keys()).await
    }

    /// Shut `keys` down; each plugin stops only after its in-batch dependents
    /// have finished stopping.
    pub async fn shutdown_batch(&self, keys: &[PluginKey]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut batch = BTreeSet::new();
        for key in keys {
            if self.registry.contains(key) {
                batch.insert(key.clone());
            } else {
                report
                    .outcomes
                    .insert(key.clone(), Err(LifecycleError::NotFound(key.clone())));
            }
        }

        // Reverse edges: a dependency waits for every dependent in the batch.
        let mut waits: BTreeMap<PluginKey, Vec<PluginKey>> =
            batch.iter().map(|key| (key.clone(), Vec::new())).collect();
        for dependent in &batch {
            if let Some(deps) = self.registry.dependencies_of(dependent) {
                for dep in deps.all().filter(|d| batch.contains(*d)) {
                    if let Some(waiting) = waits.get_mut(dep) {
                        waiting.push(dependent.clone());
                    }
                }
            }
        }

        let order: Vec<PluginKey> = batch.into_iter().rev().collect();
        let mut outcomes = self
            .run_scheduled(order, waits, |manager, key, _finished| async move {
                manager.shutdown(&key).await
            })
            .await;
        report.outcomes.append(&mut outcomes);
        report
    }


    /// Run `op` for every key once all keys it waits for have finished.
    ///
    /// `op` receives whether each awaited key succeeded. Keys whose task never
    /// reported back are recorded as `Cancelled`.
    async fn run_scheduled<F, Fut>(
        &self,
        order: Vec<PluginKey>,
        waits: BTreeMap<PluginKey, Vec<PluginKey>>,
        op: F,
    ) -> BTreeMap<PluginKey, Result<(), LifecycleError>>
    where
        F: Fn(LifecycleManager, PluginKey, Vec<(PluginKey, bool)>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), LifecycleError>> + Send + 'static,
    {
        let op = Arc::new(op);
        let mut senders = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for key in &order {
            let (tx, rx) = watch::channel(None::<bool>);
            senders.insert(key.clone(), tx);
            receivers.insert(key.clone(), rx);
        }

        let mut tasks = JoinSet::new();
        for key in &order {
            let prerequisites: Vec<(PluginKey, watch::Receiver<Option<bool>>)> = waits
                .get(key)
                .into_iter()
                .flatten()
                .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
                .collect();
            let done = senders.remove(key);
            let manager = self.clone();
            let op = Arc::clone(&op);
            let key = key.clone();

            tasks.spawn(async move {
                let mut finished = Vec::with_capacity(prerequisites.len());
                for (dep, mut rx) in prerequisites {
                    let ok = match rx.wait_for(Option::is_some).await {
                        Ok(state) => matches!(*state, Some(true)),
                        Err(_) => false,
                    };
                    finished.push((dep, ok));
                }
                let outcome = op(manager, key.clone(), finished).await;
                if let Some(done) = done {
                    let _ = done.send(Some(outcome.is_ok()));
                }
                (key, outcome)
            });
        }
        drop(receivers);

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, outcome)) => {
                    outcomes.insert(key, outcome);
                }
                Err(err) => warn!(error = %err, "Lifecycle task failed"),
            }
        }
        for key in order {
            outcomes
                .entry(key.clone())
                .or_insert(Err(LifecycleError::Cancelled { key }));
        }
        outcomes
    }

    /// Probe every active plugin once.
    ///
    /// A healthy probe resets the failure streak; reaching the configured
    /// threshold of consecutive failures moves the plugin to `Error`.
    pub async fn run_health_checks(&self) -> BTreeMap<PluginKey, bool> {
        let mut probes = JoinSet::new();
        for key in self.registry.keys() {
            let Some(instance) = self.registry.get(&key) else {
                continue;
            };
            if instance.status() != PluginStatus::Active {
                continue;
            }
            let timeout = self.config.health_check_timeout;
            probes.spawn(async move {
                let healthy = matches!(
                    tokio::time::timeout(timeout, instance.plugin().health_check(instance.context())).await,
                    Ok(Ok(true))
                );
                (instance, healthy)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = probes.join_next().await {
            let Ok((instance, healthy)) = joined else {
                continue;
            };
            results.insert(instance.key().clone(), healthy);
            if healthy {
                instance.reset_health_failures();
                continue;
            }

            let failures = instance.record_health_failure();
            warn!(plugin = %instance.key(), failures, "Plugin health check failed");
            if failures >= self.config.health_failure_threshold
                && instance.status() == PluginStatus::Active
            {
                let _serial = instance.lifecycle_lock.lock().await;
                if instance.status() == PluginStatus::Active {
                    let message = format!("health check failed {failures} consecutive times");
                    warn!(plugin = %instance.key(), %message, "Plugin marked unhealthy");
                    let _ = self.set_status(&instance, PluginStatus::Error);
                    self.registry.events().emit(&PluginEvent::ErrorOccurred {
                        key: instance.key().clone(),
                        message,
                    });
                    instance.reset_health_failures();
                }
            }
        }
        results
    }

    /// Run [`run_health_checks`](Self::run_health_checks) every
    /// `health_check_interval` until the returned handle is stopped or dropped.
    pub fn spawn_health_monitor(&self) -> HealthMonitor {
        let (stop, mut stopped) = watch::channel(false);
        let manager = self.clone();
        let period = self.config.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let results = manager.run_health_checks().await;
                        debug!(probed = results.len(), "Health check round finished");
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Health monitor stopped");
        });
        HealthMonitor {
            stop,
            handle: Some(handle),
        }
    }

    /// Health of one plugin; active plugins are probed on demand
    pub async fn health_report(&self, key: &PluginKey) -> Result<HealthReport, LifecycleError> {
        let instance = self.instance(key)?;
        let status = instance.status();
        let healthy = status == PluginStatus::Active
            && matches!(
                tokio::time::timeout(
                    self.config.health_check_timeout,
                    instance.plugin().health_check(instance.context())
                )
                .await,
                Ok(Ok(true))
            );
        Ok(HealthReport {
            key: key.clone(),
            status,
            healthy,
            uptime: instance.uptime(),
            error_count: instance.error_count(),
            success_count: instance.success_count(),
            consecutive_failures: instance.consecutive_health_failures(),
            last_activity: instance.last_activity(),
        })
    }

    /// Shut the plugin down if needed and move it to `Disabled`
    pub async fn disable(&self, key: &PluginKey) -> Result<(), LifecycleError> {
        self.enter_admin_state(key, PluginStatus::Disabled).await
    }

    /// Move a disabled plugin back to `Inactive`
    pub async fn enable(&self, key: &PluginKey) -> Result<(), LifecycleError> {
        self.leave_admin_state(key, PluginStatus::Disabled).await
    }

    /// Shut the plugin down if needed and hold it in `Updating`
    pub async fn begin_update(&self, key: &PluginKey) -> Result<(), LifecycleError> {
        self.enter_admin_state(key, PluginStatus::Updating).await
    }

    /// Release a plugin held in `Updating` back to `Inactive`
    pub async fn finish_update(&self, key: &PluginKey) -> Result<(), LifecycleError> {
        self.leave_admin_state(key, PluginStatus::Updating).await
    }

    /// Explicit retry: shut down if active, then initialize again
    pub async fn reinitialize(&self, key: &PluginKey) -> Result<(), LifecycleError> {
        let instance = self.instance(key)?;
        let _serial = instance.lifecycle_lock.lock().await;
        self.shutdown_locked(&instance).await?;
        self.initialize_locked(&instance).await
    }

    async fn enter_admin_state(&self, key: &PluginKey, state: PluginStatus) -> Result<(), LifecycleError> {
        let instance = self.instance(key)?;
        let _serial = instance.lifecycle_lock.lock().await;
        self.shutdown_locked(&instance).await?;
        self.set_status(&instance, state)
    }

    async fn leave_admin_state(&self, key: &PluginKey, state: PluginStatus) -> Result<(), LifecycleError> {
        let instance = self.instance(key)?;
        let _serial = instance.lifecycle_lock.lock().await;
        let from = instance.status();
        if from != state {
            return Err(LifecycleError::InvalidTransition {
                key: key.clone(),
                from,
                to: PluginStatus::Inactive,
            });
        }
        self.set_status(&instance, PluginStatus::Inactive)
    }
}
