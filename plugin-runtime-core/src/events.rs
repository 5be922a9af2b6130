//! Registry and lifecycle event notification
//!
//! Listeners are called synchronously, in subscription order, after the state
//! change they describe has been committed. A failing or panicking listener is
//! logged and skipped; it never undoes the change or starves other listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::api::PluginKey;
use crate::lifecycle::PluginStatus;

/// Something that happened to a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PluginEvent {
    /// Plugin added to the registry
    Registered { key: PluginKey },
    /// Plugin removed from the registry
    Unregistered { key: PluginKey },
    /// Plugin status changed
    StatusChanged {
        key: PluginKey,
        from: PluginStatus,
        to: PluginStatus,
    },
    /// Lifecycle or execution failure worth surfacing
    ErrorOccurred { key: PluginKey, message: String },
}

impl PluginEvent {
    pub fn key(&self) -> &PluginKey {
        match self {
            Self::Registered { key }
            | Self::Unregistered { key }
            | Self::StatusChanged { key, .. }
            | Self::ErrorOccurred { key, .. } => key,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Unregistered { .. } => "unregistered",
            Self::StatusChanged { .. } => "status_changed",
            Self::ErrorOccurred { .. } => "error_occurred",
        }
    }
}

/// Receiver of [`PluginEvent`]s.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &PluginEvent) -> anyhow::Result<()>;
}

impl<F> EventListener for F
where
    F: Fn(&PluginEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &PluginEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by [`EventBus::subscribe`]
pub type SubscriptionId = Uuid;

/// Fan-out of plugin events to registered listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn EventListener>)>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns whether the subscription existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every listener.
    ///
    /// Listeners may subscribe or unsubscribe from inside `on_event`; the
    /// change applies to the next event.
    pub fn emit(&self, event: &PluginEvent) {
        let snapshot: Vec<(SubscriptionId, Arc<dyn EventListener>)> =
            self.listeners.read().iter().cloned().collect();

        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    subscription = %id,
                    plugin = %event.key(),
                    event = event.kind(),
                    error = %err,
                    "Event listener failed"
                ),
                Err(_) => warn!(
                    subscription = %id,
                    plugin = %event.key(),
                    event = event.kind(),
                    "Event listener panicked"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn registered(name: &str) -> PluginEvent {
        PluginEvent::Registered {
            key: PluginKey::new("core", name),
        }
    }

    #[test]
    fn test_listeners_receive_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        bus.subscribe(Arc::new(move |event: &PluginEvent| -> anyhow::Result<()> {
            first.lock().push(format!("first:{}", event.key()));
            Ok(())
        }));
        let second = Arc::clone(&seen);
        bus.subscribe(Arc::new(move |event: &PluginEvent| -> anyhow::Result<()> {
            second.lock().push(format!("second:{}", event.key()));
            Ok(())
        }));

        bus.emit(&registered("a"));
        assert_eq!(*seen.lock(), vec!["first:core/a", "second:core/a"]);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let bus = EventBus::new();
        let delivered = Arc::new(Mutex::new(0usize));

        bus.subscribe(Arc::new(|_: &PluginEvent| -> anyhow::Result<()> {
            anyhow::bail!("listener broke")
        }));
        bus.subscribe(Arc::new(|_: &PluginEvent| -> anyhow::Result<()> {
            panic!("listener panicked")
        }));
        let counter = Arc::clone(&delivered);
        bus.subscribe(Arc::new(move |_: &PluginEvent| -> anyhow::Result<()> {
            *counter.lock() += 1;
            Ok(())
        }));

        bus.emit(&registered("a"));
        bus.emit(&registered("b"));
        assert_eq!(*delivered.lock(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(Arc::new(|_: &PluginEvent| -> anyhow::Result<()> { Ok(()) }));
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = PluginEvent::StatusChanged {
            key: PluginKey::new("core", "a"),
            from: PluginStatus::Initializing,
            to: PluginStatus::Active,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["to"], "active");
    }
}
