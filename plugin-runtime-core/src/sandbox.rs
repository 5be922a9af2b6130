//! Plugin sandbox implementation
//!
//! An in-process logical boundary around a single method execution: a
//! capability gate, a wall-clock timeout, and software accounting of memory,
//! CPU time and file writes against the call's [`ResourceLimits`]. Hosts that
//! run plugins in a dedicated worker process can additionally pin the same
//! ceilings at the OS level with [`apply_process_limits`].

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{MethodDescriptor, PluginKey, PluginMetadata};
use crate::error::{ConfigurationError, ExecutionError, PluginFault};
use crate::runtime::duration_ms;
use crate::security::{grantable_capabilities, Capability, CodeValidator, DeclaredPermissionValidator};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Resource ceilings for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory ceiling in MiB
    pub memory_mb: u64,
    /// Time spent polling the plugin future
    #[serde(with = "duration_ms")]
    pub cpu_time: Duration,
    /// Wall-clock ceiling; a shorter per-call timeout wins
    #[serde(with = "duration_ms")]
    pub wall_clock: Duration,
    /// Largest total of bytes a call may write
    pub max_file_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 64,
            cpu_time: Duration::from_secs(10),
            wall_clock: Duration::from_secs(30),
            max_file_bytes: 10 * BYTES_PER_MB,
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.memory_mb == 0 || self.max_file_bytes == 0 {
            return Err(ConfigurationError::InvalidRuntimeConfig(
                "sandbox memory and file ceilings must be positive".to_string(),
            ));
        }
        if self.cpu_time.is_zero() || self.wall_clock.is_zero() {
            return Err(ConfigurationError::InvalidRuntimeConfig(
                "sandbox cpu_time and wall_clock must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resources tracked by the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    CpuTime,
    FileSize,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::CpuTime => "cpu_time",
            Self::FileSize => "file_size",
        })
    }
}

/// First ceiling crossed during a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceViolation {
    pub resource: ResourceKind,
    pub limit: u64,
    pub used: u64,
}

/// Usage figures of one grant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub peak_memory_bytes: u64,
    pub file_bytes: u64,
    pub cpu_time: Duration,
}

/// Software accounting of one grant's resource use.
#[derive(Debug)]
pub struct ResourceMeter {
    memory_limit: u64,
    file_limit: u64,
    cpu_limit_nanos: u64,
    memory: AtomicU64,
    peak_memory: AtomicU64,
    file_bytes: AtomicU64,
    cpu_nanos: AtomicU64,
    violation: Mutex<Option<ResourceViolation>>,
}

impl ResourceMeter {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            memory_limit: limits.memory_bytes(),
            file_limit: limits.max_file_bytes,
            cpu_limit_nanos: u64::try_from(limits.cpu_time.as_nanos()).unwrap_or(u64::MAX),
            memory: AtomicU64::new(0),
            peak_memory: AtomicU64::new(0),
            file_bytes: AtomicU64::new(0),
            cpu_nanos: AtomicU64::new(0),
            violation: Mutex::new(None),
        }
    }

    /// Charge `bytes` of memory; a charge that would cross the ceiling is
    /// refused, recorded, and not applied.
    pub fn charge_memory(&self, bytes: u64) -> Result<(), ResourceViolation> {
        let mut current = self.memory.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.memory_limit {
                return Err(self.record(ResourceKind::Memory, self.memory_limit, next));
            }
            match self
                .memory
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.peak_memory.fetch_max(next, Ordering::AcqRel);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release_memory(&self, bytes: u64) {
        let _ = self
            .memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn charge_file_write(&self, bytes: u64) -> Result<(), ResourceViolation> {
        let total = self
            .file_bytes
            .fetch_add(bytes, Ordering::AcqRel)
            .saturating_add(bytes);
        if total > self.file_limit {
            return Err(self.record(ResourceKind::FileSize, self.file_limit, total));
        }
        Ok(())
    }

    /// Add polling time; returns the violation once the CPU ceiling is crossed
    pub fn charge_cpu(&self, spent: Duration) -> Result<(), ResourceViolation> {
        let spent = u64::try_from(spent.as_nanos()).unwrap_or(u64::MAX);
        let total = self
            .cpu_nanos
            .fetch_add(spent, Ordering::AcqRel)
            .saturating_add(spent);
        if total > self.cpu_limit_nanos {
            return Err(self.record(ResourceKind::CpuTime, self.cpu_limit_nanos, total));
        }
        Ok(())
    }

    pub fn violation(&self) -> Option<ResourceViolation> {
        *self.violation.lock()
    }

    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            memory_bytes: self.memory.load(Ordering::Acquire),
            peak_memory_bytes: self.peak_memory.load(Ordering::Acquire),
            file_bytes: self.file_bytes.load(Ordering::Acquire),
            cpu_time: Duration::from_nanos(self.cpu_nanos.load(Ordering::Acquire)),
        }
    }

    fn record(&self, resource: ResourceKind, limit: u64, used: u64) -> ResourceViolation {
        let violation = ResourceViolation { resource, limit, used };
        let mut slot = self.violation.lock();
        *slot.get_or_insert(violation)
    }
}

/// The resource and permission envelope of one execution.
#[derive(Debug, Clone)]
pub struct SandboxGrant {
    pub id: Uuid,
    pub plugin_key: PluginKey,
    pub limits: ResourceLimits,
    pub capabilities: BTreeSet<Capability>,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug)]
struct GrantInner {
    grant: SandboxGrant,
    meter: ResourceMeter,
}

/// Shared view of a grant handed to the plugin through its invocation context.
#[derive(Debug, Clone)]
pub struct GrantHandle {
    inner: Arc<GrantInner>,
}

impl GrantHandle {
    fn new(grant: SandboxGrant) -> Self {
        let meter = ResourceMeter::new(&grant.limits);
        Self {
            inner: Arc::new(GrantInner { grant, meter }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.grant.id
    }

    pub fn plugin_key(&self) -> &PluginKey {
        &self.inner.grant.plugin_key
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.inner.grant.limits
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.inner.grant.capabilities
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.inner.grant.capabilities.contains(capability)
    }

    pub fn require_capability(&self, capability: &Capability) -> Result<(), PluginFault> {
        if self.has_capability(capability) {
            Ok(())
        } else {
            Err(PluginFault::CapabilityDenied(capability.clone()))
        }
    }

    pub fn charge_memory(&self, bytes: u64) -> Result<(), PluginFault> {
        self.inner.meter.charge_memory(bytes).map_err(exhausted)
    }

    pub fn release_memory(&self, bytes: u64) {
        self.inner.meter.release_memory(bytes);
    }

    pub fn charge_file_write(&self, bytes: u64) -> Result<(), PluginFault> {
        self.inner.meter.charge_file_write(bytes).map_err(exhausted)
    }

    pub fn usage(&self) -> ResourceUsage {
        self.inner.meter.usage()
    }

    pub fn meter(&self) -> &ResourceMeter {
        &self.inner.meter
    }
}

fn exhausted(violation: ResourceViolation) -> PluginFault {
    PluginFault::ResourceExhausted {
        resource: violation.resource,
        limit: violation.limit,
        used: violation.used,
    }
}

/// A grant that is released when dropped, on every exit path.
#[derive(Debug)]
pub struct ScopedGrant {
    handle: GrantHandle,
    active: Arc<AtomicUsize>,
}

impl ScopedGrant {
    pub fn handle(&self) -> &GrantHandle {
        &self.handle
    }

    pub fn check_capability(&self, capability: &Capability) -> bool {
        self.handle.has_capability(capability)
    }
}

impl Drop for ScopedGrant {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        debug!(
            plugin = %self.handle.plugin_key(),
            grant = %self.handle.id(),
            "Sandbox grant released"
        );
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Limits for plugins without their own
    pub default_limits: ResourceLimits,
    /// Host-wide capability allow-list; `None` grants whatever is declared
    pub allowed_capabilities: Option<BTreeSet<Capability>>,
    /// Consult the [`CodeValidator`] before every execution
    pub enforce_code_validation: bool,
    /// Pin `default_limits` as OS limits of the current process on startup
    pub apply_process_limits: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_limits: ResourceLimits::default(),
            allowed_capabilities: None,
            enforce_code_validation: true,
            apply_process_limits: false,
        }
    }
}

/// Per-execution boundary: capability gate, timeout, resource accounting.
pub struct Sandbox {
    config: SandboxConfig,
    validator: Arc<dyn CodeValidator>,
    active_grants: Arc<AtomicUsize>,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("active_grants", &self.active_grants())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        if config.apply_process_limits {
            if let Err(err) = apply_process_limits(&config.default_limits) {
                warn!(error = %err, "Failed to apply process resource limits");
            }
        }
        Self {
            config,
            validator: Arc::new(DeclaredPermissionValidator),
            active_grants: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the pre-execution code validator
    pub fn with_validator(mut self, validator: Arc<dyn CodeValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Grants currently alive
    pub fn active_grants(&self) -> usize {
        self.active_grants.load(Ordering::Acquire)
    }

    /// Open a grant for one call of `key`.
    ///
    /// The grant holds the declared permissions narrowed by the host policy and
    /// either `limits` or the configured defaults.
    pub fn enter(
        &self,
        key: &PluginKey,
        limits: Option<ResourceLimits>,
        declared: &BTreeSet<Capability>,
    ) -> ScopedGrant {
        let grant = SandboxGrant {
            id: Uuid::new_v4(),
            plugin_key: key.clone(),
            limits: limits.unwrap_or(self.config.default_limits),
            capabilities: grantable_capabilities(declared, self.config.allowed_capabilities.as_ref()),
            granted_at: Utc::now(),
        };
        self.active_grants.fetch_add(1, Ordering::AcqRel);
        debug!(plugin = %key, grant = %grant.id, "Sandbox grant opened");
        ScopedGrant {
            handle: GrantHandle::new(grant),
            active: Arc::clone(&self.active_grants),
        }
    }

    /// Run the configured [`CodeValidator`] for `method`
    pub fn validate_code(
        &self,
        metadata: &PluginMetadata,
        method: &MethodDescriptor,
    ) -> Result<(), ExecutionError> {
        if !self.config.enforce_code_validation {
            return Ok(());
        }
        self.validator.validate(metadata, method).map_err(|mismatch| {
            warn!(plugin = %metadata.key(), method = %method.name, reason = %mismatch.reason, "Code validation rejected call");
            ExecutionError::ExecutionDenied {
                key: metadata.key().clone(),
                capability: mismatch
                    .undeclared
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| Capability::custom("code_validation")),
            }
        })
    }

    /// Execute `call` inside `grant`.
    ///
    /// Capabilities required by `method` are checked before `call` is first
    /// polled. The call is cancelled when the wall clock (the shorter of
    /// `timeout` and the grant's `wall_clock`) expires or its CPU ceiling is
    /// crossed.
    pub async fn run<F>(
        &self,
        grant: &ScopedGrant,
        method: &MethodDescriptor,
        timeout: Option<Duration>,
        call: F,
    ) -> Result<Value, ExecutionError>
    where
        F: Future<Output = Result<Value, PluginFault>> + Send,
    {
        let handle = grant.handle();
        let key = handle.plugin_key().clone();

        if let Some(missing) = method
            .required_capabilities
            .iter()
            .find(|capability| !handle.has_capability(capability))
        {
            return Err(ExecutionError::ExecutionDenied {
                key,
                capability: missing.clone(),
            });
        }

        let wall_clock = handle.limits().wall_clock;
        let effective = timeout.map_or(wall_clock, |t| t.min(wall_clock));
        let metered = MeteredFuture {
            inner: Box::pin(call),
            grant: handle.clone(),
        };

        let outcome = match tokio::time::timeout(effective, metered).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(ExecutionError::ExecutionTimeout {
                    key,
                    method: method.name.clone(),
                    timeout: effective,
                })
            }
        };

        let fault_to_error = |fault: PluginFault| match fault {
            PluginFault::CapabilityDenied(capability) => ExecutionError::ExecutionDenied {
                key: key.clone(),
                capability,
            },
            PluginFault::ResourceExhausted { resource, limit, used } => {
                ExecutionError::ResourceLimitExceeded {
                    key: key.clone(),
                    resource,
                    limit,
                    used,
                }
            }
            source => ExecutionError::MethodFailed {
                key: key.clone(),
                method: method.name.clone(),
                source,
            },
        };

        match outcome {
            Err(fault) => Err(fault_to_error(fault)),
            // A ceiling crossed during the call fails it even if the plugin
            // swallowed the charge error.
            Ok(_) if handle.meter().violation().is_some() => {
                let violation = handle.meter().violation().map(exhausted);
                Err(fault_to_error(violation.unwrap_or_else(|| PluginFault::failed("resource limit exceeded"))))
            }
            Ok(value) => Ok(value),
        }
    }
}

/// Wraps a plugin future and charges the time spent in each poll as CPU time.
struct MeteredFuture<F> {
    inner: Pin<Box<F>>,
    grant: GrantHandle,
}

impl<F> Future for MeteredFuture<F>
where
    F: Future<Output = Result<Value, PluginFault>>,
{
    type Output = Result<Value, PluginFault>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let started = std::time::Instant::now();
        let polled = self.inner.as_mut().poll(cx);
        match self.grant.meter().charge_cpu(started.elapsed()) {
            Ok(()) => polled,
            Err(violation) => Poll::Ready(Err(exhausted(violation))),
        }
    }
}

/// Set `RLIMIT_AS`, `RLIMIT_CPU` and `RLIMIT_FSIZE` of the current process.
///
/// Only soft limits are lowered; hard limits are left alone.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn apply_process_limits(limits: &ResourceLimits) -> std::io::Result<()> {
    let set = |resource, value: u64| -> std::io::Result<()> {
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `current` is a valid, writable rlimit for the duration of the call.
        if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let wanted = libc::rlim_t::try_from(value).unwrap_or(libc::RLIM_INFINITY);
        let capped = if current.rlim_max == libc::RLIM_INFINITY {
            wanted
        } else {
            wanted.min(current.rlim_max)
        };
        let updated = libc::rlimit {
            rlim_cur: capped,
            rlim_max: current.rlim_max,
        };
        // SAFETY: `updated` is a valid rlimit that outlives the call.
        if unsafe { libc::setrlimit(resource, &updated) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    };

    set(libc::RLIMIT_AS, limits.memory_bytes())?;
    set(libc::RLIMIT_CPU, limits.cpu_time.as_secs().max(1))?;
    set(libc::RLIMIT_FSIZE, limits.max_file_bytes)?;
    info!(
        memory_mb = limits.memory_mb,
        cpu_secs = limits.cpu_time.as_secs(),
        max_file_bytes = limits.max_file_bytes,
        "Applied process resource limits"
    );
    Ok(())
}

/// Process limits are not available on this platform; software accounting applies.
#[cfg(not(unix))]
pub fn apply_process_limits(_limits: &ResourceLimits) -> std::io::Result<()> {
    info!("Process resource limits unsupported on this platform, using software accounting");
    Ok(())
}
