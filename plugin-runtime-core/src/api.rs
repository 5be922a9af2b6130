//! Plugin API definitions and interfaces
//!
//! Defines the contract every plugin implements: its immutable metadata,
//! the closed table of methods it exposes, and the async hooks the runtime
//! drives (initialize, shutdown, health probe, invoke).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigurationError, PluginFault};
use crate::sandbox::GrantHandle;
use crate::security::Capability;
use crate::validation::ArgSchema;

/// Unique `(domain, name)` identity of a plugin within one registry.
///
/// Ordering is lexical by domain, then name; the dependency resolver relies on
/// it for deterministic tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginKey {
    domain: String,
    name: String,
}

impl PluginKey {
    /// Create a key. Emptiness is checked when metadata is built.
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
        }
    }

    /// Plugin domain
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Plugin name within its domain
    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self) -> bool {
        !self.domain.trim().is_empty() && !self.name.trim().is_empty()
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.name)
    }
}

impl FromStr for PluginKey {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, name) = s
            .split_once('/')
            .ok_or_else(|| ConfigurationError::InvalidKey(s.to_string()))?;
        let key = Self::new(domain, name);
        if key.is_valid() && !name.contains('/') {
            Ok(key)
        } else {
            Err(ConfigurationError::InvalidKey(s.to_string()))
        }
    }
}

/// Immutable plugin description, fixed once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    key: PluginKey,
    version: String,
    description: String,
    dependencies: BTreeSet<PluginKey>,
    optional_dependencies: BTreeSet<PluginKey>,
    declared_permissions: BTreeSet<Capability>,
    config_schema: Option<ArgSchema>,
    tags: BTreeSet<String>,
    categories: BTreeSet<String>,
}

impl PluginMetadata {
    /// Start building metadata for `domain/name`
    pub fn builder(domain: impl Into<String>, name: impl Into<String>) -> PluginMetadataBuilder {
        PluginMetadataBuilder {
            metadata: Self {
                key: PluginKey::new(domain, name),
                version: "0.1.0".to_string(),
                description: String::new(),
                dependencies: BTreeSet::new(),
                optional_dependencies: BTreeSet::new(),
                declared_permissions: BTreeSet::new(),
                config_schema: None,
                tags: BTreeSet::new(),
                categories: BTreeSet::new(),
            },
        }
    }

    pub fn key(&self) -> &PluginKey {
        &self.key
    }

    pub fn domain(&self) -> &str {
        self.key.domain()
    }

    pub fn name(&self) -> &str {
        self.key.name()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Hard dependencies; each must be `Active` before this plugin initializes
    pub fn dependencies(&self) -> &BTreeSet<PluginKey> {
        &self.dependencies
    }

    /// Soft dependencies; ordered before this plugin when present
    pub fn optional_dependencies(&self) -> &BTreeSet<PluginKey> {
        &self.optional_dependencies
    }

    pub fn declared_permissions(&self) -> &BTreeSet<Capability> {
        &self.declared_permissions
    }

    pub fn config_schema(&self) -> Option<&ArgSchema> {
        self.config_schema.as_ref()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn categories(&self) -> &BTreeSet<String> {
        &self.categories
    }

    /// Check the invariants a builder cannot enforce for deserialized metadata
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.key.is_valid() {
            return Err(ConfigurationError::InvalidMetadata {
                reason: format!("plugin domain and name must be non-empty (got '{}')", self.key),
            });
        }
        if self.version.trim().is_empty() {
            return Err(ConfigurationError::InvalidMetadata {
                reason: format!("plugin {} has an empty version", self.key),
            });
        }
        if let Some(dep) = self
            .dependencies
            .iter()
            .chain(&self.optional_dependencies)
            .find(|dep| !dep.is_valid())
        {
            return Err(ConfigurationError::InvalidMetadata {
                reason: format!("plugin {} declares an invalid dependency key '{dep}'", self.key),
            });
        }
        Ok(())
    }
}

/// Builder for [`PluginMetadata`]
#[derive(Debug, Clone)]
pub struct PluginMetadataBuilder {
    metadata: PluginMetadata,
}

impl PluginMetadataBuilder {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.metadata.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn depends_on(mut self, key: PluginKey) -> Self {
        self.metadata.dependencies.insert(key);
        self
    }

    pub fn optionally_depends_on(mut self, key: PluginKey) -> Self {
        self.metadata.optional_dependencies.insert(key);
        self
    }

    pub fn permission(mut self, capability: Capability) -> Self {
        self.metadata.declared_permissions.insert(capability);
        self
    }

    pub fn config_schema(mut self, schema: ArgSchema) -> Self {
        self.metadata.config_schema = Some(schema);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.insert(tag.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.metadata.categories.insert(category.into());
        self
    }

    /// Finish, checking the metadata invariants
    pub fn build(self) -> Result<PluginMetadata, ConfigurationError> {
        self.metadata.validate()?;
        Ok(self.metadata)
    }
}

/// One entry of a plugin's method dispatch table.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    /// Method name as passed to `execute`
    pub name: String,
    /// Argument schema checked by the validation stage
    pub schema: Option<ArgSchema>,
    /// Capabilities the sandbox must grant before the call runs
    pub required_capabilities: BTreeSet<Capability>,
    /// Per-method wall-clock timeout, overriding the sandbox default
    pub timeout: Option<Duration>,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            required_capabilities: BTreeSet::new(),
            timeout: None,
        }
    }

    pub fn with_schema(mut self, schema: ArgSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn requires(mut self, capability: Capability) -> Self {
        self.required_capabilities.insert(capability);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Closed method dispatch table, built once at registration.
///
/// Calls to names outside the table fail before any middleware runs.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: BTreeMap<String, MethodDescriptor>,
}

impl MethodTable {
    /// Build the table for `key`, rejecting empty or duplicate method names
    pub fn build(
        key: &PluginKey,
        descriptors: Vec<MethodDescriptor>,
    ) -> Result<Self, ConfigurationError> {
        let mut methods = BTreeMap::new();
        for descriptor in descriptors {
            if descriptor.name.trim().is_empty() {
                return Err(ConfigurationError::InvalidMetadata {
                    reason: format!("plugin {key} exposes a method with an empty name"),
                });
            }
            if methods.contains_key(&descriptor.name) {
                return Err(ConfigurationError::InvalidMetadata {
                    reason: format!("plugin {key} exposes method '{}' twice", descriptor.name),
                });
            }
            methods.insert(descriptor.name.clone(), descriptor);
        }
        Ok(Self { methods })
    }

    pub fn get(&self, method: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Method names in lexical order
    pub fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Opaque key/value state private to one plugin instance.
pub type PluginState = Arc<DashMap<String, serde_json::Value>>;

/// Context handed to lifecycle hooks.
#[derive(Debug, Clone)]
pub struct PluginContext {
    key: PluginKey,
    config: Arc<serde_json::Value>,
    state: PluginState,
}

impl PluginContext {
    pub(crate) fn new(key: PluginKey, config: serde_json::Value) -> Self {
        Self {
            key,
            config: Arc::new(config),
            state: Arc::new(DashMap::new()),
        }
    }

    pub fn key(&self) -> &PluginKey {
        &self.key
    }

    /// Configuration supplied at registration
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    pub fn state(&self) -> &PluginState {
        &self.state
    }
}

/// Context handed to a single method invocation.
///
/// Carries the call's sandbox grant: capability checks and resource charges
/// made here count against this call only.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    request_id: Uuid,
    key: PluginKey,
    method: String,
    subject: Option<String>,
    config: Arc<serde_json::Value>,
    state: PluginState,
    grant: GrantHandle,
}

impl InvocationContext {
    pub(crate) fn new(
        plugin: &PluginContext,
        method: impl Into<String>,
        subject: Option<String>,
        grant: GrantHandle,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            key: plugin.key.clone(),
            method: method.into(),
            subject,
            config: Arc::clone(&plugin.config),
            state: Arc::clone(&plugin.state),
            grant,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn key(&self) -> &PluginKey {
        &self.key
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Caller-supplied subject (user, client, ...) the call is made for
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    pub fn state(&self) -> &PluginState {
        &self.state
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.grant.has_capability(capability)
    }

    /// Fail with [`PluginFault::CapabilityDenied`] unless `capability` is granted
    pub fn require_capability(&self, capability: &Capability) -> Result<(), PluginFault> {
        self.grant.require_capability(capability)
    }

    /// Account `bytes` of memory against the grant's ceiling
    pub fn charge_memory(&self, bytes: u64) -> Result<(), PluginFault> {
        self.grant.charge_memory(bytes)
    }

    pub fn release_memory(&self, bytes: u64) {
        self.grant.release_memory(bytes);
    }

    /// Account a file write of `bytes` against the grant's file-size ceiling
    pub fn charge_file_write(&self, bytes: u64) -> Result<(), PluginFault> {
        self.grant.charge_file_write(bytes)
    }

    pub fn grant(&self) -> &GrantHandle {
        &self.grant
    }
}

/// Main plugin API interface
///
/// Implementations use interior mutability for their own state; the runtime
/// only ever holds shared references.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Immutable plugin description
    fn metadata(&self) -> &PluginMetadata;

    /// Methods callable through `execute`
    fn methods(&self) -> Vec<MethodDescriptor>;

    /// Prepare the plugin; runs after every hard dependency is `Active`
    async fn initialize(&self, ctx: &PluginContext) -> Result<(), PluginFault>;

    /// Release plugin resources
    async fn shutdown(&self, _ctx: &PluginContext) -> Result<(), PluginFault> {
        Ok(())
    }

    /// Health probe used by the monitor; `Ok(false)` counts as a failure
    async fn health_check(&self, _ctx: &PluginContext) -> Result<bool, PluginFault> {
        Ok(true)
    }

    /// Run `method`, which is guaranteed to be in the dispatch table
    async fn invoke(
        &self,
        method: &str,
        args: serde_json::Value,
        ctx: &InvocationContext,
    ) -> Result<serde_json::Value, PluginFault>;
}
