//! Plugin execution core
//!
//! Hosts independently authored plugins inside one process:
//! - Registry keyed by `(domain, name)` with forward and reverse dependency indices
//! - Dependency resolution with cycle detection and a hard depth limit
//! - Lifecycle management (initialize, health checks, shutdown) in dependency
//!   order with bounded concurrency and per-operation timeouts
//! - Per-call sandbox grants: capability gate, wall-clock timeout and
//!   memory/CPU/file-size accounting
//! - Token bucket, sliding window and fixed window rate limiting
//! - Argument validation and execution metrics around every call
//! - Tenant isolation with one scope per tenant
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use plugin_runtime_core::{
//!     InvocationContext, MethodDescriptor, Plugin, PluginContext, PluginFault, PluginKey,
//!     PluginManager, PluginMetadata, RuntimeConfig,
//! };
//! use serde_json::{json, Value};
//!
//! struct Echo {
//!     metadata: PluginMetadata,
//! }
//!
//! #[async_trait]
//! impl Plugin for Echo {
//!     fn metadata(&self) -> &PluginMetadata {
//!         &self.metadata
//!     }
//!
//!     fn methods(&self) -> Vec<MethodDescriptor> {
//!         vec![MethodDescriptor::new("echo")]
//!     }
//!
//!     async fn initialize(&self, _ctx: &PluginContext) -> Result<(), PluginFault> {
//!         Ok(())
//!     }
//!
//!     async fn invoke(
//!         &self,
//!         _method: &str,
//!         args: Value,
//!         _ctx: &InvocationContext,
//!     ) -> Result<Value, PluginFault> {
//!         Ok(args)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = PluginManager::new(RuntimeConfig::load(None)?)?;
//!     let metadata = PluginMetadata::builder("util", "echo").version("1.0.0").build()?;
//!     manager
//!         .register_plugin(Arc::new(Echo { metadata }), Value::Null, true)
//!         .await?;
//!
//!     let reply = manager
//!         .execute(&PluginKey::new("util", "echo"), "echo", json!({ "ping": 1 }))
//!         .await?;
//!     assert_eq!(reply, json!({ "ping": 1 }));
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod sandbox;
pub mod security;
pub mod tenant;
pub mod validation;

pub use api::{
    InvocationContext, MethodDescriptor, MethodTable, Plugin, PluginContext, PluginKey,
    PluginMetadata, PluginMetadataBuilder, PluginState,
};
pub use error::{
    ConfigurationError, DependencyError, ErrorCategory, ExecutionError, LifecycleError,
    PluginFault, PluginResult, PluginRuntimeError, RegistryError,
};
pub use events::{EventBus, EventListener, PluginEvent, SubscriptionId};
pub use lifecycle::{
    BatchReport, HealthMonitor, HealthReport, LifecycleConfig, LifecycleManager, PluginStatus,
};
pub use manager::{ExecutionRequest, PluginManager};
pub use metrics::{ExecutionMetrics, ExecutionOutcome, MethodStats, MetricsSnapshot};
pub use rate_limit::{
    RateLimitAlgorithm, RateLimitConfig, RateLimitDecision, RateLimitPolicy, RateLimitRule,
    RateLimitScope, RateLimiter,
};
pub use registry::{PluginFilter, PluginInstance, PluginSummary, Registry, RegistryConfig};
pub use resolver::{Dependencies, DependencyResolver};
pub use runtime::RuntimeConfig;
pub use sandbox::{
    GrantHandle, ResourceKind, ResourceLimits, ResourceUsage, Sandbox, SandboxConfig, ScopedGrant,
};
pub use security::{Capability, CodeValidator, DeclaredPermissionValidator, PermissionMismatch};
pub use tenant::{TenantRouter, TenantScope};
pub use validation::{ArgSchema, FieldSpec, SchemaRegistry, ValueKind};
