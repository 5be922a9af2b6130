//! Plugin runtime error types
//!
//! One error enum per failure family (configuration, dependency graph,
//! registry, lifecycle, execution) plus the aggregate [`PluginRuntimeError`].
//! Denials carry structured detail (`retry_after`, the missing capability,
//! the exhausted resource) so callers can react without parsing messages.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::api::PluginKey;
use crate::lifecycle::PluginStatus;
use crate::sandbox::ResourceKind;
use crate::security::Capability;

/// Bad metadata, schema or runtime configuration. Fatal at registration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Plugin metadata violates an invariant (empty domain/name, bad method table)
    #[error("invalid plugin metadata: {reason}")]
    InvalidMetadata {
        /// What was wrong
        reason: String,
    },

    /// Plugin configuration does not match the declared config schema
    #[error("invalid configuration for plugin {key}: {}", violations.join("; "))]
    InvalidConfig {
        /// Plugin whose configuration was rejected
        key: PluginKey,
        /// Every schema violation found
        violations: Vec<String>,
    },

    /// A plugin key string could not be parsed
    #[error("invalid plugin key '{0}', expected 'domain/name'")]
    InvalidKey(String),

    /// Runtime configuration could not be loaded or failed validation
    #[error("invalid runtime configuration: {0}")]
    InvalidRuntimeConfig(String),

    /// Discovery filter could not be built
    #[error("invalid plugin filter: {0}")]
    InvalidFilter(String),
}

/// Dependency graph failures. Never retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// A hard dependency is not registered
    #[error("plugin {key} depends on {missing}, which is not registered")]
    MissingDependency {
        /// Plugin declaring the dependency
        key: PluginKey,
        /// Dependency that could not be found
        missing: PluginKey,
    },

    /// Adding the edges would close a cycle
    #[error("circular dependency for plugin {key}: {}", format_path(cycle))]
    CircularDependency {
        /// Plugin whose dependencies close the cycle
        key: PluginKey,
        /// The cycle, starting and ending at `key`
        cycle: Vec<PluginKey>,
    },

    /// Dependency chain is deeper than the configured maximum
    #[error("dependency chain below {key} exceeds maximum depth {max_depth}")]
    DependencyDepthExceeded {
        /// Plugin at which the limit was crossed
        key: PluginKey,
        /// Configured maximum depth
        max_depth: usize,
    },

    /// Plugin cannot be removed while active plugins depend on it
    #[error("plugin {key} has active dependents: {}", format_path(dependents))]
    HasActiveDependents {
        /// Plugin being removed
        key: PluginKey,
        /// Active plugins declaring it as a hard dependency
        dependents: Vec<PluginKey>,
    },

    /// Key is not part of the dependency graph at all
    #[error("plugin {0} is not registered")]
    UnknownPlugin(PluginKey),
}

impl DependencyError {
    /// Plugin the error is attributed to
    pub fn key(&self) -> &PluginKey {
        match self {
            Self::MissingDependency { key, .. }
            | Self::CircularDependency { key, .. }
            | Self::DependencyDepthExceeded { key, .. }
            | Self::HasActiveDependents { key, .. }
            | Self::UnknownPlugin(key) => key,
        }
    }
}

/// Registry mutation and lookup failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A plugin with the same `(domain, name)` is already registered
    #[error("plugin {0} is already registered")]
    DuplicateKey(PluginKey),

    /// No plugin with this key
    #[error("plugin {0} is not registered")]
    NotFound(PluginKey),

    /// Registry is at capacity
    #[error("registry is full ({maximum} plugins)")]
    CapacityExceeded {
        /// Configured maximum
        maximum: usize,
    },

    /// Plugin must be shut down before it can be removed
    #[error("plugin {key} is {status} and must be shut down before removal")]
    PluginBusy {
        /// Plugin being removed
        key: PluginKey,
        /// Its current status
        status: PluginStatus,
    },

    /// Dependency index rejected the mutation
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// Metadata or configuration rejected at registration
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Initialization, shutdown and administrative transition failures.
///
/// The affected plugin is moved to `Error`; retrying is an explicit caller action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// No plugin with this key
    #[error("plugin {0} is not registered")]
    NotFound(PluginKey),

    /// Requested status change is not an edge of the state machine
    #[error("plugin {key} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Plugin
        key: PluginKey,
        /// Current status
        from: PluginStatus,
        /// Requested status
        to: PluginStatus,
    },

    /// Plugin's initialize hook failed
    #[error("plugin {key} failed to initialize: {reason}")]
    InitializationFailed {
        /// Plugin
        key: PluginKey,
        /// Failure reported by the plugin
        reason: String,
    },

    /// Plugin's shutdown hook failed
    #[error("plugin {key} failed to shut down: {reason}")]
    ShutdownFailed {
        /// Plugin
        key: PluginKey,
        /// Failure reported by the plugin
        reason: String,
    },

    /// Lifecycle hook did not finish in time
    #[error("{operation} of plugin {key} timed out after {timeout:?}")]
    Timeout {
        /// Plugin
        key: PluginKey,
        /// Hook that timed out
        operation: &'static str,
        /// Timeout that was applied
        timeout: Duration,
    },

    /// A hard dependency exists but is not `Active`
    #[error("plugin {key} requires {dependency} to be active, but it is {status}")]
    DependencyNotActive {
        /// Plugin being initialized
        key: PluginKey,
        /// Dependency
        dependency: PluginKey,
        /// Dependency's current status
        status: PluginStatus,
    },

    /// A hard dependency failed earlier in the same batch
    #[error("plugin {key} skipped because dependency {dependency} failed")]
    DependencyFailed {
        /// Plugin that was skipped
        key: PluginKey,
        /// Dependency that failed
        dependency: PluginKey,
    },

    /// Operation was abandoned before it ran
    #[error("lifecycle operation for plugin {key} was cancelled")]
    Cancelled {
        /// Plugin
        key: PluginKey,
    },

    /// Dependency graph rejected the operation
    #[error(transparent)]
    Dependency(#[from] DependencyError),
}

/// Failures returned to the caller of `execute`.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    /// No plugin with this key; lists what the domain does offer
    #[error("plugin {key} not found (available in domain: {})", format_path(available))]
    PluginNotFound {
        /// Requested key
        key: PluginKey,
        /// Plugins registered in the same domain
        available: Vec<PluginKey>,
    },

    /// Plugin exists but is not `Active`
    #[error("plugin {key} is not active (status: {status})")]
    PluginNotActive {
        /// Plugin
        key: PluginKey,
        /// Its current status
        status: PluginStatus,
    },

    /// Method is not in the plugin's dispatch table
    #[error("plugin {key} has no method '{method}' (available: {})", available.join(", "))]
    MethodNotFound {
        /// Plugin
        key: PluginKey,
        /// Requested method
        method: String,
        /// Methods the plugin exposes
        available: Vec<String>,
    },

    /// Arguments do not match the method schema
    #[error("invalid arguments for {key}::{method}: {}", violations.join("; "))]
    ValidationFailed {
        /// Plugin
        key: PluginKey,
        /// Method
        method: String,
        /// Every violation found
        violations: Vec<String>,
    },

    /// A rate limiter denied the call
    #[error("rate limit '{limiter}' exceeded for plugin {key}, retry after {retry_after:?}")]
    RateLimited {
        /// Plugin
        key: PluginKey,
        /// Which limiter denied the call
        limiter: String,
        /// How long to wait before retrying
        retry_after: Duration,
    },

    /// A capability required by the call was not granted
    #[error("plugin {key} was denied capability '{capability}'")]
    ExecutionDenied {
        /// Plugin
        key: PluginKey,
        /// Missing capability
        capability: Capability,
    },

    /// Wall-clock timeout expired
    #[error("{key}::{method} timed out after {timeout:?}")]
    ExecutionTimeout {
        /// Plugin
        key: PluginKey,
        /// Method
        method: String,
        /// Timeout that was applied
        timeout: Duration,
    },

    /// A sandbox resource ceiling was crossed
    #[error("plugin {key} exceeded its {resource} limit ({used} > {limit})")]
    ResourceLimitExceeded {
        /// Plugin
        key: PluginKey,
        /// Resource that ran out
        resource: ResourceKind,
        /// Ceiling
        limit: u64,
        /// Amount used when the ceiling was crossed
        used: u64,
    },

    /// The plugin method itself failed
    #[error("{key}::{method} failed: {source}")]
    MethodFailed {
        /// Plugin
        key: PluginKey,
        /// Method
        method: String,
        /// Failure reported by the plugin
        #[source]
        source: PluginFault,
    },
}

impl ExecutionError {
    /// Plugin the error is attributed to
    pub fn key(&self) -> &PluginKey {
        match self {
            Self::PluginNotFound { key, .. }
            | Self::PluginNotActive { key, .. }
            | Self::MethodNotFound { key, .. }
            | Self::ValidationFailed { key, .. }
            | Self::RateLimited { key, .. }
            | Self::ExecutionDenied { key, .. }
            | Self::ExecutionTimeout { key, .. }
            | Self::ResourceLimitExceeded { key, .. }
            | Self::MethodFailed { key, .. } => key,
        }
    }

    /// Suggested wait before retrying, for rate-limit denials
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Errors raised by plugin code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginFault {
    /// Generic failure with a message
    #[error("{0}")]
    Failed(String),

    /// Plugin rejected its arguments
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Plugin needed a capability the sandbox did not grant
    #[error("capability '{0}' not granted")]
    CapabilityDenied(Capability),

    /// Plugin tried to use more of a resource than its grant allows
    #[error("{resource} limit exceeded ({used} > {limit})")]
    ResourceExhausted {
        /// Resource that ran out
        resource: ResourceKind,
        /// Ceiling
        limit: u64,
        /// Amount requested
        used: u64,
    },
}

impl PluginFault {
    /// Shorthand for [`PluginFault::Failed`]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Main plugin runtime error type
#[derive(Error, Debug, Clone)]
pub enum PluginRuntimeError {
    /// Configuration error
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Dependency graph error
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// Registry error
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Lifecycle error
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Execution error
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// No scope exists for the tenant
    #[error("tenant '{0}' not found")]
    TenantNotFound(String),
}

/// Plugin runtime result type
pub type PluginResult<T> = Result<T, PluginRuntimeError>;

impl PluginRuntimeError {
    /// Get error category for logging and metrics
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Dependency(_) => ErrorCategory::Dependency,
            Self::Registry(RegistryError::Dependency(_)) => ErrorCategory::Dependency,
            Self::Registry(RegistryError::Configuration(_)) => ErrorCategory::Configuration,
            Self::Registry(_) => ErrorCategory::Registry,
            Self::Lifecycle(LifecycleError::Timeout { .. }) => ErrorCategory::Timeout,
            Self::Lifecycle(LifecycleError::Dependency(_)) => ErrorCategory::Dependency,
            Self::Lifecycle(_) => ErrorCategory::Lifecycle,
            Self::Execution(err) => match err {
                ExecutionError::RateLimited { .. } => ErrorCategory::RateLimit,
                ExecutionError::ExecutionDenied { .. } => ErrorCategory::Security,
                ExecutionError::ExecutionTimeout { .. } => ErrorCategory::Timeout,
                ExecutionError::ResourceLimitExceeded { .. } => ErrorCategory::Resource,
                _ => ErrorCategory::Execution,
            },
            Self::TenantNotFound(_) => ErrorCategory::Tenant,
        }
    }

    /// Whether repeating the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Execution(
                ExecutionError::RateLimited { .. } | ExecutionError::ExecutionTimeout { .. }
            ) | Self::Lifecycle(LifecycleError::Timeout { .. })
        )
    }
}

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Metadata, schema and runtime configuration
    Configuration,
    /// Dependency graph
    Dependency,
    /// Registry bookkeeping
    Registry,
    /// Plugin lifecycle
    Lifecycle,
    /// Method execution
    Execution,
    /// Rate limiting
    RateLimit,
    /// Capability checks
    Security,
    /// Timeouts
    Timeout,
    /// Resource ceilings
    Resource,
    /// Tenant routing
    Tenant,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Dependency => "dependency",
            Self::Registry => "registry",
            Self::Lifecycle => "lifecycle",
            Self::Execution => "execution",
            Self::RateLimit => "rate_limit",
            Self::Security => "security",
            Self::Timeout => "timeout",
            Self::Resource => "resource",
            Self::Tenant => "tenant",
        };
        f.write_str(name)
    }
}

fn format_path(keys: &[PluginKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
