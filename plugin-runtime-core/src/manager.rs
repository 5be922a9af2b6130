//! Plugin manager
//!
//! The public entry point of one plugin scope. It owns the registry,
//! lifecycle manager, sandbox, rate limits, schemas, metrics and event bus,
//! and runs every method call through a fixed pipeline:
//!
//! 1. resolve the plugin (`PluginNotFound`)
//! 2. require `Active` status (`PluginNotActive`)
//! 3. resolve the method in the dispatch table (`MethodNotFound`)
//! 4. validate arguments against the method schema (`ValidationFailed`)
//!    and run the code validator (`ExecutionDenied`)
//! 5. admit through the rate limiters (`RateLimited`)
//! 6. run inside a sandbox grant (`ExecutionDenied`, `ExecutionTimeout`,
//!    `ResourceLimitExceeded`, `MethodFailed`)
//! 7. record success/failure on the instance
//! 8. record duration and outcome in the metrics
//!
//! The order is fixed; plugins cannot reorder or skip stages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use logger_redacted::ArgumentRedactor;
use serde_json::Value;
use tracing::{debug, warn, Level};

use crate::api::{InvocationContext, MethodDescriptor, Plugin, PluginKey};
use crate::error::{
    ConfigurationError, ExecutionError, PluginResult, PluginRuntimeError, RegistryError,
};
use crate::events::{EventBus, EventListener, PluginEvent, SubscriptionId};
use crate::lifecycle::{BatchReport, HealthReport, LifecycleManager, PluginStatus};
use crate::metrics::{ExecutionMetrics, ExecutionOutcome, MetricsSnapshot};
use crate::rate_limit::RateLimitPolicy;
use crate::registry::{PluginFilter, PluginInstance, PluginSummary, Registry};
use crate::runtime::RuntimeConfig;
use crate::sandbox::{ResourceLimits, Sandbox};
use crate::security::CodeValidator;
use crate::validation::{ArgSchema, SchemaRegistry};

/// One method call
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub key: PluginKey,
    pub method: String,
    pub args: Value,
    /// Caller identity, used for per-subject rate limiting
    pub subject: Option<String>,
    /// Wall-clock limit for this call; capped by the sandbox limit
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(key: PluginKey, method: impl Into<String>, args: Value) -> Self {
        Self {
            key,
            method: method.into(),
            args,
            subject: None,
            timeout: None,
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Orchestrator for one plugin scope
pub struct PluginManager {
    registry: Arc<Registry>,
    lifecycle: LifecycleManager,
    sandbox: Sandbox,
    rate_limits: RateLimitPolicy,
    schemas: SchemaRegistry,
    resource_limits: DashMap<PluginKey, ResourceLimits>,
    metrics: ExecutionMetrics,
    events: Arc<EventBus>,
    redactor: ArgumentRedactor,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.registry.len())
            .field("active_grants", &self.sandbox.active_grants())
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(Registry::new(config.registry.clone(), Arc::clone(&events)));
        Ok(Self {
            lifecycle: LifecycleManager::new(Arc::clone(&registry), config.lifecycle.clone()),
            registry,
            sandbox: Sandbox::new(config.sandbox.clone()),
            rate_limits: RateLimitPolicy::from_config(&config.rate_limit)?,
            schemas: SchemaRegistry::new(),
            resource_limits: DashMap::new(),
            metrics: ExecutionMetrics::new(),
            events,
            redactor: ArgumentRedactor::default(),
        })
    }

    /// Replace the validator consulted before every call
    pub fn with_code_validator(self, validator: Arc<dyn CodeValidator>) -> Self {
        Self {
            sandbox: self.sandbox.with_validator(validator),
            ..self
        }
    }

    /// Replace the redactor used when logging arguments
    pub fn with_redactor(self, redactor: ArgumentRedactor) -> Self {
        Self { redactor, ..self }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn rate_limits(&self) -> &RateLimitPolicy {
        &self.rate_limits
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register `plugin` with its opaque configuration.
    ///
    /// With `auto_initialize` the plugin is initialized right away; if that
    /// fails it stays registered in `Error` and the failure is returned.
    pub async fn register_plugin(
        &self,
        plugin: Arc<dyn Plugin>,
        config: Value,
        auto_initialize: bool,
    ) -> PluginResult<PluginSummary> {
        let instance = PluginInstance::new(plugin, config)?;
        let instance = self.registry.register(instance)?;
        if auto_initialize {
            self.lifecycle.initialize(instance.key()).await?;
        }
        Ok(instance.summary())
    }

    /// Shut `key` down and remove it.
    ///
    /// Refused while active plugins hard-depend on it, unless `force` is set;
    /// forcing leaves those dependents running.
    pub async fn unregister_plugin(&self, key: &PluginKey, force: bool) -> PluginResult<()> {
        self.registry.check_removable(key, force).map_err(removal_error)?;
        let was_active = self
            .registry
            .get(key)
            .is_some_and(|instance| instance.status() == PluginStatus::Active);

        if let Err(err) = self.lifecycle.shutdown(key).await {
            // The plugin is in `Error` now and can still be removed.
            warn!(plugin = %key, error = %err, "Shutdown before unregistration failed");
        }
        if let Err(err) = self.registry.unregister(key, force) {
            // A dependent came up while shutting down; put the plugin back.
            if was_active {
                if let Err(restart) = self.lifecycle.initialize(key).await {
                    warn!(plugin = %key, error = %restart, "Restart after refused unregistration failed");
                }
            }
            return Err(removal_error(err));
        }

        self.schemas.remove_plugin(key);
        self.resource_limits.remove(key);
        self.rate_limits.reset_plugin(key);
        self.metrics.remove_plugin(key);
        Ok(())
    }

    /// Summaries of every plugin matching `filter`
    pub fn find_plugins(&self, filter: &PluginFilter) -> Vec<PluginSummary> {
        self.registry
            .find(filter)
            .iter()
            .map(|instance| instance.summary())
            .collect()
    }

    pub fn list_domains(&self) -> Vec<String> {
        self.registry.list_domains()
    }

    /// Every plugin that would lose a dependency if `key` were removed
    pub fn removal_impact(&self, key: &PluginKey) -> Vec<PluginKey> {
        self.registry.removal_impact(key)
    }

    /// Register an argument schema, overriding the one the plugin declares
    pub fn register_schema(&self, key: PluginKey, method: impl Into<String>, schema: ArgSchema) {
        self.schemas.register(key, method, schema);
    }

    /// Use `limits` instead of the sandbox defaults for calls to `key`
    pub fn set_resource_limits(&self, key: PluginKey, limits: ResourceLimits) -> Result<(), ConfigurationError> {
        limits.validate()?;
        self.resource_limits.insert(key, limits);
        Ok(())
    }

    pub async fn initialize_plugin(&self, key: &PluginKey) -> PluginResult<()> {
        Ok(self.lifecycle.initialize(key).await?)
    }

    pub async fn shutdown_plugin(&self, key: &PluginKey) -> PluginResult<()> {
        Ok(self.lifecycle.shutdown(key).await?)
    }

    pub async fn initialize_all(&self) -> BatchReport {
        self.lifecycle.initialize_all().await
    }

    pub async fn shutdown_all(&self) -> BatchReport {
        self.lifecycle.shutdown_all().await
    }

    /// Status, probe result, uptime and counters of `key`
    pub async fn health_check(&self, key: &PluginKey) -> PluginResult<HealthReport> {
        Ok(self.lifecycle.health_report(key).await?)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> SubscriptionId {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Call `method` of `key` with `args`
    pub async fn execute(&self, key: &PluginKey, method: &str, args: Value) -> Result<Value, ExecutionError> {
        self.execute_request(ExecutionRequest::new(key.clone(), method, args))
            .await
    }

    /// Run one request through the execution pipeline
    pub async fn execute_request(&self, request: ExecutionRequest) -> Result<Value, ExecutionError> {
        let key = &request.key;
        let Some(instance) = self.registry.get(key) else {
            let err = ExecutionError::PluginNotFound {
                key: key.clone(),
                available: self.registry.keys_in_domain(key.domain()),
            };
            warn!(plugin = %key, method = %request.method, error = %err, "Execution rejected");
            return Err(err);
        };

        let status = instance.status();
        if status != PluginStatus::Active {
            let err = ExecutionError::PluginNotActive {
                key: key.clone(),
                status,
            };
            warn!(plugin = %key, method = %request.method, %status, "Execution rejected");
            return Err(err);
        }

        let Some(descriptor) = instance.methods().get(&request.method) else {
            let err = ExecutionError::MethodNotFound {
                key: key.clone(),
                method: request.method.clone(),
                available: instance.methods().names(),
            };
            warn!(plugin = %key, method = %request.method, "Execution rejected: unknown method");
            return Err(err);
        };

        let started = Instant::now();
        let result = self.run_pipeline(&instance, descriptor, &request).await;
        let elapsed = started.elapsed();
        let outcome = ExecutionOutcome::of(&result);
        self.metrics.record(key, &descriptor.name, outcome, elapsed);

        match &result {
            Ok(_) => {
                if tracing::enabled!(Level::DEBUG) {
                    debug!(
                        plugin = %key,
                        method = %descriptor.name,
                        args = %self.redactor.redact(&request.args),
                        elapsed_ms = elapsed.as_millis(),
                        "Plugin method executed"
                    );
                }
            }
            Err(err) => warn!(
                plugin = %key,
                method = %descriptor.name,
                outcome = outcome.as_str(),
                error = %err,
                "Plugin method failed"
            ),
        }
        result
    }

    async fn run_pipeline(
        &self,
        instance: &PluginInstance,
        descriptor: &MethodDescriptor,
        request: &ExecutionRequest,
    ) -> Result<Value, ExecutionError> {
        let key = instance.key();

        if let Some(schema) = self.schemas.resolve(key, descriptor) {
            schema
                .validate(&request.args)
                .map_err(|violations| ExecutionError::ValidationFailed {
                    key: key.clone(),
                    method: descriptor.name.clone(),
                    violations,
                })?;
        }

        self.sandbox.validate_code(instance.metadata(), descriptor)?;

        self.rate_limits
            .check(key, &descriptor.name, request.subject.as_deref())?;

        let limits = self.resource_limits.get(key).map(|entry| *entry.value());
        let grant = self
            .sandbox
            .enter(key, limits, instance.metadata().declared_permissions());
        let ctx = InvocationContext::new(
            instance.context(),
            descriptor.name.clone(),
            request.subject.clone(),
            grant.handle().clone(),
        );
        let result = self
            .sandbox
            .run(
                &grant,
                descriptor,
                request.timeout.or(descriptor.timeout),
                instance.plugin().invoke(&descriptor.name, request.args.clone(), &ctx),
            )
            .await;
        drop(grant);

        match &result {
            Ok(_) => instance.record_success(),
            Err(err) => {
                instance.record_failure();
                self.events.emit(&PluginEvent::ErrorOccurred {
                    key: key.clone(),
                    message: err.to_string(),
                });
            }
        }
        result
    }
}

/// Surface a refused removal by its root cause
fn removal_error(err: RegistryError) -> PluginRuntimeError {
    match err {
        RegistryError::Dependency(dependency) => dependency.into(),
        other => other.into(),
    }
}
