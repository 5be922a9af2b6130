//! Plugin registry
//!
//! Owns every [`PluginInstance`] of one scope together with the forward
//! (resolver) and reverse (dependents) dependency indices. All three are kept
//! behind a single readers-writer lock and mutated all-or-nothing: every check
//! that can fail runs before the first write.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::api::{MethodTable, Plugin, PluginContext, PluginKey, PluginMetadata};
use crate::error::{ConfigurationError, DependencyError, LifecycleError, RegistryError};
use crate::events::{EventBus, PluginEvent};
use crate::lifecycle::PluginStatus;
use crate::resolver::{Dependencies, DependencyResolver, DEFAULT_MAX_DEPTH};

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of registered plugins
    pub max_plugins: usize,
    /// Reject registrations whose hard dependencies are not registered yet
    pub require_dependencies_at_registration: bool,
    /// Bound on dependency chain depth
    pub max_dependency_depth: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_plugins: 1000,
            require_dependencies_at_registration: false,
            max_dependency_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_plugins == 0 || self.max_dependency_depth == 0 {
            return Err(ConfigurationError::InvalidRuntimeConfig(
                "registry max_plugins and max_dependency_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct StatusCell {
    status: PluginStatus,
    changed_at: DateTime<Utc>,
    activated_at: Option<tokio::time::Instant>,
}

/// A registered plugin and its runtime bookkeeping.
pub struct PluginInstance {
    plugin: Arc<dyn Plugin>,
    metadata: PluginMetadata,
    methods: MethodTable,
    context: PluginContext,
    status: Mutex<StatusCell>,
    success_count: AtomicU64,
    error_count: AtomicU64,
    health_failures: AtomicU32,
    last_activity: Mutex<Option<DateTime<Utc>>>,
    registered_at: DateTime<Utc>,
    /// Serializes lifecycle operations on this plugin
    pub(crate) lifecycle_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("key", self.key())
            .field("status", &self.status())
            .field("success_count", &self.success_count())
            .field("error_count", &self.error_count())
            .finish_non_exhaustive()
    }
}

impl PluginInstance {
    /// Wrap `plugin`, checking its metadata, method table and `config`
    pub fn new(plugin: Arc<dyn Plugin>, config: Value) -> Result<Self, ConfigurationError> {
        let metadata = plugin.metadata().clone();
        metadata.validate()?;
        let key = metadata.key().clone();
        if let Some(schema) = metadata.config_schema() {
            schema
                .validate(&config)
                .map_err(|violations| ConfigurationError::InvalidConfig {
                    key: key.clone(),
                    violations,
                })?;
        }
        let methods = MethodTable::build(&key, plugin.methods())?;

        Ok(Self {
            plugin,
            metadata,
            methods,
            context: PluginContext::new(key, config),
            status: Mutex::new(StatusCell {
                status: PluginStatus::Uninitialized,
                changed_at: Utc::now(),
                activated_at: None,
            }),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            health_failures: AtomicU32::new(0),
            last_activity: Mutex::new(None),
            registered_at: Utc::now(),
            lifecycle_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn key(&self) -> &PluginKey {
        self.metadata.key()
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    pub fn status(&self) -> PluginStatus {
        self.status.lock().status
    }

    pub fn status_changed_at(&self) -> DateTime<Utc> {
        self.status.lock().changed_at
    }

    /// Time since the plugin last became `Active`, while it still is
    pub fn uptime(&self) -> Option<Duration> {
        self.status.lock().activated_at.map(|at| at.elapsed())
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn consecutive_health_failures(&self) -> u32 {
        self.health_failures.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        *self.last_activity.lock()
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Move to `to` along a legal edge, returning the previous status
    pub(crate) fn transition(&self, to: PluginStatus) -> Result<PluginStatus, LifecycleError> {
        let mut cell = self.status.lock();
        let from = cell.status;
        if !from.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition {
                key: self.key().clone(),
                from,
                to,
            });
        }
        cell.status = to;
        cell.changed_at = Utc::now();
        if to == PluginStatus::Active {
            cell.activated_at = Some(tokio::time::Instant::now());
        } else if from == PluginStatus::Active {
            cell.activated_at = None;
        }
        Ok(from)
    }

    pub(crate) fn record_success(&self) {
        saturating_increment(&self.success_count);
        self.touch();
    }

    pub(crate) fn record_failure(&self) {
        saturating_increment(&self.error_count);
        self.touch();
    }

    /// Count a failed probe, returning the consecutive failure count
    pub(crate) fn record_health_failure(&self) -> u32 {
        let previous = self
            .health_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_add(1)))
            .unwrap_or(u32::MAX);
        previous.saturating_add(1)
    }

    pub(crate) fn reset_health_failures(&self) {
        self.health_failures.store(0, Ordering::Release);
    }

    fn touch(&self) {
        *self.last_activity.lock() = Some(Utc::now());
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            domain: self.metadata.domain().to_string(),
            name: self.metadata.name().to_string(),
            version: self.metadata.version().to_string(),
            status: self.status(),
            tags: self.metadata.tags().clone(),
        }
    }
}

fn saturating_increment(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_add(1)));
}

/// Public view of a plugin returned by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    pub domain: String,
    pub name: String,
    pub version: String,
    pub status: PluginStatus,
    pub tags: BTreeSet<String>,
}

/// Discovery filter; every set criterion must match.
#[derive(Debug, Clone, Default)]
pub struct PluginFilter {
    pub domain: Option<String>,
    pub status: Option<PluginStatus>,
    /// All listed tags must be present
    pub tags: BTreeSet<String>,
    /// All listed categories must be present
    pub categories: BTreeSet<String>,
    /// Glob over the plugin name, e.g. `smtp*`
    pub name_glob: Option<glob::Pattern>,
}

impl PluginFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn status(mut self, status: PluginStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.categories.insert(category.into());
        self
    }

    pub fn name_glob(mut self, pattern: &str) -> Result<Self, ConfigurationError> {
        let compiled = glob::Pattern::new(pattern)
            .map_err(|err| ConfigurationError::InvalidFilter(format!("'{pattern}': {err}")))?;
        self.name_glob = Some(compiled);
        Ok(self)
    }

    pub fn matches(&self, instance: &PluginInstance) -> bool {
        let metadata = instance.metadata();
        self.domain.as_deref().map_or(true, |d| d == metadata.domain())
            && self.status.map_or(true, |s| s == instance.status())
            && self.tags.is_subset(metadata.tags())
            && self.categories.is_subset(metadata.categories())
            && self
                .name_glob
                .as_ref()
                .map_or(true, |pattern| pattern.matches(metadata.name()))
    }
}

#[derive(Debug, Default)]
struct RegistryIndex {
    instances: BTreeMap<PluginKey, Arc<PluginInstance>>,
    resolver: DependencyResolver,
    /// Registered plugins declaring the key as a dependency
    dependents: BTreeMap<PluginKey, BTreeSet<PluginKey>>,
}

/// Concurrent store of one scope's plugins.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<RegistryIndex>,
    events: Arc<EventBus>,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(config: RegistryConfig, events: Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(RegistryIndex {
                instances: BTreeMap::new(),
                resolver: DependencyResolver::new(config.max_dependency_depth),
                dependents: BTreeMap::new(),
            }),
            events,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Add `instance`; nothing changes when this fails
    pub fn register(&self, instance: PluginInstance) -> Result<Arc<PluginInstance>, RegistryError> {
        let key = instance.key().clone();
        let deps = Dependencies::of(instance.metadata());
        let instance = Arc::new(instance);
        {
            let mut index = self.inner.write();
            if index.instances.contains_key(&key) {
                return Err(RegistryError::DuplicateKey(key));
            }
            if index.instances.len() >= self.config.max_plugins {
                return Err(RegistryError::CapacityExceeded {
                    maximum: self.config.max_plugins,
                });
            }
            if self.config.require_dependencies_at_registration {
                if let Some(missing) = deps
                    .required
                    .iter()
                    .find(|dep| !index.instances.contains_key(*dep))
                {
                    return Err(DependencyError::MissingDependency {
                        key,
                        missing: missing.clone(),
                    }
                    .into());
                }
            }
            index.resolver.add(key.clone(), deps.clone())?;

            let dependents = index.resolver.dependents(&key);
            index.dependents.insert(key.clone(), dependents);
            for dep in deps.all() {
                if index.instances.contains_key(dep) {
                    index.dependents.entry(dep.clone()).or_default().insert(key.clone());
                }
            }
            index.instances.insert(key.clone(), Arc::clone(&instance));
        }

        info!(plugin = %key, version = instance.metadata().version(), "Plugin registered");
        self.events.emit(&PluginEvent::Registered { key });
        Ok(instance)
    }

    /// Run the removal checks of [`Registry::unregister`] without removing,
    /// treating an `Active` plugin as one that is about to be shut down.
    pub fn check_removable(&self, key: &PluginKey, force: bool) -> Result<(), RegistryError> {
        let index = self.inner.read();
        Self::removal_guard(&index, key, force, true).map(|_| ())
    }

    /// Remove `key`.
    ///
    /// Refused while the plugin itself is running a lifecycle operation or is
    /// active, and while active plugins hard-depend on it unless `force` is set.
    /// Forcing leaves the dependents' status untouched.
    pub fn unregister(&self, key: &PluginKey, force: bool) -> Result<Arc<PluginInstance>, RegistryError> {
        let removed = {
            let mut index = self.inner.write();
            let instance = Self::removal_guard(&index, key, force, false)?;
            let active_dependents = Self::active_dependents_locked(&index, key);
            if !active_dependents.is_empty() {
                warn!(
                    plugin = %key,
                    dependents = ?active_dependents,
                    "Force-removing plugin with active dependents"
                );
            }

            let deps = index.resolver.remove(key).unwrap_or_default();
            index.dependents.remove(key);
            for dep in deps.all() {
                if let Some(set) = index.dependents.get_mut(dep) {
                    set.remove(key);
                }
            }
            index.instances.remove(key);
            instance
        };

        info!(plugin = %key, "Plugin unregistered");
        self.events.emit(&PluginEvent::Unregistered { key: key.clone() });
        Ok(removed)
    }

    fn removal_guard(
        index: &RegistryIndex,
        key: &PluginKey,
        force: bool,
        allow_active: bool,
    ) -> Result<Arc<PluginInstance>, RegistryError> {
        let instance = index
            .instances
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
        let status = instance.status();
        let busy = match status {
            PluginStatus::Active => !allow_active,
            PluginStatus::Initializing | PluginStatus::Updating => true,
            _ => false,
        };
        if busy {
            return Err(RegistryError::PluginBusy {
                key: key.clone(),
                status,
            });
        }
        if !force {
            let active_dependents = Self::active_dependents_locked(index, key);
            if !active_dependents.is_empty() {
                return Err(DependencyError::HasActiveDependents {
                    key: key.clone(),
                    dependents: active_dependents,
                }
                .into());
            }
        }
        Ok(instance)
    }

    fn active_dependents_locked(index: &RegistryIndex, key: &PluginKey) -> Vec<PluginKey> {
        index
            .dependents
            .get(key)
            .into_iter()
            .flatten()
            .filter(|dependent| {
                index
                    .resolver
                    .dependencies(dependent)
                    .is_some_and(|deps| deps.required.contains(key))
            })
            .filter(|dependent| {
                index
                    .instances
                    .get(*dependent)
                    .is_some_and(|instance| instance.status() == PluginStatus::Active)
            })
            .cloned()
            .collect()
    }

    pub fn get(&self, key: &PluginKey) -> Option<Arc<PluginInstance>> {
        self.inner.read().instances.get(key).cloned()
    }

    pub fn contains(&self, key: &PluginKey) -> bool {
        self.inner.read().instances.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().instances.is_empty()
    }

    /// Registered keys in lexical order
    pub fn keys(&self) -> Vec<PluginKey> {
        self.inner.read().instances.keys().cloned().collect()
    }

    pub fn find(&self, filter: &PluginFilter) -> Vec<Arc<PluginInstance>> {
        self.inner
            .read()
            .instances
            .values()
            .filter(|instance| filter.matches(instance))
            .cloned()
            .collect()
    }

    pub fn list_domains(&self) -> Vec<String> {
        let index = self.inner.read();
        let domains: BTreeSet<&str> = index.instances.keys().map(PluginKey::domain).collect();
        domains.into_iter().map(str::to_string).collect()
    }

    pub fn keys_in_domain(&self, domain: &str) -> Vec<PluginKey> {
        self.inner
            .read()
            .instances
            .keys()
            .filter(|key| key.domain() == domain)
            .cloned()
            .collect()
    }

    /// Registered plugins declaring `key` as a dependency, hard or soft
    pub fn dependents_of(&self, key: &PluginKey) -> Vec<PluginKey> {
        self.inner
            .read()
            .dependents
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registered plugins with a hard dependency on `key` that are `Active`
    pub fn active_dependents_of(&self, key: &PluginKey) -> Vec<PluginKey> {
        Self::active_dependents_locked(&self.inner.read(), key)
    }

    pub fn dependencies_of(&self, key: &PluginKey) -> Option<Dependencies> {
        self.inner.read().resolver.dependencies(key).cloned()
    }

    pub fn resolution_order(&self, keys: &[PluginKey]) -> Result<Vec<PluginKey>, DependencyError> {
        self.inner.read().resolver.resolution_order(keys.iter())
    }

    /// Plugins left with a missing hard dependency if `key` were removed
    pub fn removal_impact(&self, key: &PluginKey) -> Vec<PluginKey> {
        self.inner.read().resolver.impact_of_removal(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{InvocationContext, MethodDescriptor};
    use crate::error::PluginFault;
    use crate::validation::{ArgSchema, ValueKind};
    use async_trait::async_trait;
    use serde_json::json;

    struct Stub {
        metadata: PluginMetadata,
    }

    #[async_trait]
    impl Plugin for Stub {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        fn methods(&self) -> Vec<MethodDescriptor> {
            vec![MethodDescriptor::new("ping")]
        }

        async fn initialize(&self, _ctx: &PluginContext) -> Result<(), PluginFault> {
            Ok(())
        }

        async fn invoke(
            &self,
            _method: &str,
            _args: Value,
            _ctx: &InvocationContext,
        ) -> Result<Value, PluginFault> {
            Ok(json!("pong"))
        }
    }

    fn instance(metadata: PluginMetadata) -> PluginInstance {
        PluginInstance::new(Arc::new(Stub { metadata }), Value::Null).unwrap()
    }

    fn plain(domain: &str, name: &str) -> PluginInstance {
        instance(PluginMetadata::builder(domain, name).build().unwrap())
    }

    fn depending(domain: &str, name: &str, dep: &PluginKey) -> PluginInstance {
        instance(
            PluginMetadata::builder(domain, name)
                .depends_on(dep.clone())
                .build()
                .unwrap(),
        )
    }

    fn registry() -> Registry {
        Registry::new(RegistryConfig::default(), Arc::new(EventBus::new()))
    }

    #[test]
    fn test_duplicate_key_leaves_registry_unchanged() {
        let registry = registry();
        registry.register(plain("comm", "smtp")).unwrap();

        let err = registry.register(plain("comm", "smtp")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateKey(PluginKey::new("comm", "smtp")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.keys(), vec![PluginKey::new("comm", "smtp")]);
    }

    #[test]
    fn test_cycle_rejection_leaves_indices_unchanged() {
        let registry = registry();
        let a = PluginKey::new("core", "a");
        let b = PluginKey::new("core", "b");
        registry.register(depending("core", "a", &b)).unwrap();

        let err = registry.register(depending("core", "b", &a)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Dependency(DependencyError::CircularDependency { .. })
        ));
        assert!(!registry.contains(&b));
        assert!(registry.dependents_of(&a).is_empty());
        assert!(registry.dependencies_of(&b).is_none());
    }

    #[test]
    fn test_dependents_index_tracks_late_registration() {
        let registry = registry();
        let db = PluginKey::new("data", "db");
        registry.register(depending("api", "users", &db)).unwrap();
        assert!(registry.dependents_of(&db).is_empty());

        registry.register(plain("data", "db")).unwrap();
        assert_eq!(registry.dependents_of(&db), vec![PluginKey::new("api", "users")]);

        registry.unregister(&PluginKey::new("api", "users"), false).unwrap();
        assert!(registry.dependents_of(&db).is_empty());
    }

    #[test]
    fn test_strict_registration_requires_dependencies() {
        let registry = Registry::new(
            RegistryConfig {
                require_dependencies_at_registration: true,
                ..RegistryConfig::default()
            },
            Arc::new(EventBus::new()),
        );
        let err = registry
            .register(depending("api", "users", &PluginKey::new("data", "db")))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Dependency(DependencyError::MissingDependency { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_guards_active_dependents() {
        let registry = registry();
        let db = PluginKey::new("data", "db");
        let users = PluginKey::new("api", "users");
        registry.register(plain("data", "db")).unwrap();
        let dependent = registry.register(depending("api", "users", &db)).unwrap();
        dependent.transition(PluginStatus::Initializing).unwrap();
        dependent.transition(PluginStatus::Active).unwrap();

        let err = registry.unregister(&db, false).unwrap_err();
        assert_eq!(
            err,
            RegistryError::Dependency(DependencyError::HasActiveDependents {
                key: db.clone(),
                dependents: vec![users.clone()],
            })
        );
        assert!(registry.contains(&db));

        registry.unregister(&db, true).unwrap();
        assert!(!registry.contains(&db));
        assert_eq!(registry.get(&users).unwrap().status(), PluginStatus::Active);
        assert!(registry.resolution_order(&[users]).is_err());
    }

    #[test]
    fn test_active_plugin_cannot_be_removed() {
        let registry = registry();
        let key = PluginKey::new("comm", "smtp");
        let instance = registry.register(plain("comm", "smtp")).unwrap();
        instance.transition(PluginStatus::Initializing).unwrap();
        instance.transition(PluginStatus::Active).unwrap();
        assert!(matches!(
            registry.unregister(&key, true),
            Err(RegistryError::PluginBusy { status: PluginStatus::Active, .. })
        ));
    }

    #[test]
    fn test_check_removable_mirrors_unregister_guards() {
        let registry = registry();
        let db = PluginKey::new("data", "db");
        let db_instance = registry.register(plain("data", "db")).unwrap();
        let dependent = registry.register(depending("api", "users", &db)).unwrap();
        db_instance.transition(PluginStatus::Initializing).unwrap();
        db_instance.transition(PluginStatus::Active).unwrap();

        // active is fine here, the caller shuts it down next
        registry.check_removable(&db, false).unwrap();

        dependent.transition(PluginStatus::Initializing).unwrap();
        assert!(matches!(
            registry.check_removable(&PluginKey::new("api", "users"), false),
            Err(RegistryError::PluginBusy { status: PluginStatus::Initializing, .. })
        ));
        dependent.transition(PluginStatus::Active).unwrap();
        assert!(matches!(
            registry.check_removable(&db, false),
            Err(RegistryError::Dependency(DependencyError::HasActiveDependents { .. }))
        ));
        registry.check_removable(&db, true).unwrap();
        assert_eq!(
            registry.check_removable(&PluginKey::new("data", "ghost"), true),
            Err(RegistryError::NotFound(PluginKey::new("data", "ghost")))
        );
        assert!(registry.contains(&db));
    }

    #[test]
    fn test_capacity_limit() {
        let registry = Registry::new(
            RegistryConfig {
                max_plugins: 1,
                ..RegistryConfig::default()
            },
            Arc::new(EventBus::new()),
        );
        registry.register(plain("a", "one")).unwrap();
        assert_eq!(
            registry.register(plain("a", "two")).unwrap_err(),
            RegistryError::CapacityExceeded { maximum: 1 }
        );
    }

    #[test]
    fn test_find_with_filters() {
        let registry = registry();
        registry
            .register(instance(
                PluginMetadata::builder("comm", "smtp")
                    .tag("email")
                    .tag("outbound")
                    .category("messaging")
                    .build()
                    .unwrap(),
            ))
            .unwrap();
        registry
            .register(instance(
                PluginMetadata::builder("comm", "sms").tag("outbound").build().unwrap(),
            ))
            .unwrap();
        registry.register(plain("auth", "saml")).unwrap();

        assert_eq!(registry.list_domains(), vec!["auth", "comm"]);
        assert_eq!(registry.find(&PluginFilter::new().domain("comm")).len(), 2);
        assert_eq!(registry.find(&PluginFilter::new().tag("outbound").tag("email")).len(), 1);
        assert_eq!(registry.find(&PluginFilter::new().category("messaging")).len(), 1);
        let by_glob = registry.find(&PluginFilter::new().name_glob("s*").unwrap());
        assert_eq!(by_glob.len(), 3);
        let by_glob = registry.find(&PluginFilter::new().name_glob("sm?").unwrap());
        assert_eq!(by_glob.len(), 1);
        assert_eq!(
            registry
                .find(&PluginFilter::new().status(PluginStatus::Active))
                .len(),
            0
        );
        assert!(PluginFilter::new().name_glob("[").is_err());
    }

    #[test]
    fn test_config_schema_is_checked_at_construction() {
        let metadata = PluginMetadata::builder("comm", "smtp")
            .config_schema(ArgSchema::object().required("host", ValueKind::String))
            .build()
            .unwrap();
        let plugin = Arc::new(Stub { metadata });
        let err = PluginInstance::new(plugin.clone(), json!({"port": 25})).unwrap_err();
        match err {
            ConfigurationError::InvalidConfig { violations, .. } => assert_eq!(violations.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(PluginInstance::new(plugin, json!({"host": "mail"})).is_ok());
    }

    #[test]
    fn test_registration_events_fire_after_commit() {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(Registry::new(RegistryConfig::default(), Arc::clone(&events)));
        let observed = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&observed);
        let view = Arc::downgrade(&registry);
        events.subscribe(Arc::new(move |event: &PluginEvent| -> anyhow::Result<()> {
            let present = view.upgrade().is_some_and(|r| r.contains(event.key()));
            seen.lock().push(present);
            Ok(())
        }));

        registry.register(plain("comm", "smtp")).unwrap();
        registry.unregister(&PluginKey::new("comm", "smtp"), false).unwrap();
        assert_eq!(*observed.lock(), vec![true, false]);
    }
}
