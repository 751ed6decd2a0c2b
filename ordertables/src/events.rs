use crate::changeset::Changeset;
use crate::mapping::EntityType;
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Notifications published after a store changes an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    Persisted {
        entity_type: EntityType,
        id: i64,
        changeset: Changeset,
    },
    Deleted {
        entity_type: EntityType,
        id: i64,
    },
}

impl StoreEvent {
    pub fn entity_type(&self) -> EntityType {
        match self {
            StoreEvent::Persisted { entity_type, .. } | StoreEvent::Deleted { entity_type, .. } => {
                *entity_type
            }
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            StoreEvent::Persisted { id, .. } | StoreEvent::Deleted { id, .. } => *id,
        }
    }
}

/// A subsystem reacting to store changes, e.g. a cache or search index.
pub trait StoreListener: Send + Sync {
    fn name(&self) -> &'static str;
    fn on_event(&self, event: &StoreEvent);
}

/// Fan-out of store events to registered listeners.
///
/// Clones share the same listener list.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Arc<dyn StoreListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn StoreListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        log::debug!("Registering store listener '{}'", listener.name());
        listeners.push(listener);
    }

    pub fn publish(&self, event: &StoreEvent) {
        // Snapshot so listeners may register others while handling an event.
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Logs every event at debug level.
pub struct LogListener;

impl StoreListener for LogListener {
    fn name(&self) -> &'static str {
        "log"
    }

    fn on_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Persisted {
                entity_type,
                id,
                changeset,
            } => log::debug!(
                "Persisted {} {} ({} columns)",
                entity_type,
                id,
                changeset.len()
            ),
            StoreEvent::Deleted { entity_type, id } => log::debug!("Deleted {} {}", entity_type, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Counter(Mutex<Vec<i64>>);

    impl StoreListener for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn on_event(&self, event: &StoreEvent) {
            self.0.lock().unwrap().push(event.id());
        }
    }

    #[test]
    fn publishes_to_every_listener_once() {
        let bus = EventBus::new();
        let first = Arc::new(Counter(Mutex::new(Vec::new())));
        let second = Arc::new(Counter(Mutex::new(Vec::new())));
        bus.register(first.clone());
        bus.clone().register(second.clone());
        bus.register(Arc::new(LogListener));
        assert_eq!(bus.listener_count(), 3);

        bus.publish(&StoreEvent::Deleted {
            entity_type: EntityType::Order,
            id: 11,
        });
        assert_eq!(*first.0.lock().unwrap(), vec![11]);
        assert_eq!(*second.0.lock().unwrap(), vec![11]);
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = StoreEvent::Deleted {
            entity_type: EntityType::Refund,
            id: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "deleted");
        assert_eq!(json["entity_type"], "refund");
    }
}
