use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

/// Change to the set of offline-available recipes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    EntityCached { id: String },
    EntityUncached { id: String },
}

impl SyncEvent {
    pub fn id(&self) -> &str {
        match self {
            SyncEvent::EntityCached { id } | SyncEvent::EntityUncached { id } => id,
        }
    }
}

/// Explicit publish/subscribe channel for [`SyncEvent`]s.
///
/// Injected into the Sync Coordinator and handed to any view that renders the
/// cached set, so they refresh on change instead of polling storage. Slow
/// subscribers that fall more than the channel capacity behind observe
/// `RecvError::Lagged` and should re-read storage.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        tracing::debug!(?event, "Sync event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(SyncEvent::EntityCached {
            id: "r1".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "entity-cached", "id": "r1"}));

        let parsed: SyncEvent =
            serde_json::from_str(r#"{"type":"entity-uncached","id":"r2"}"#).unwrap();
        assert_eq!(parsed.id(), "r2");
    }

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(SyncEvent::EntityUncached {
            id: "r1".to_string(),
        });

        assert_eq!(a.recv().await.unwrap().id(), "r1");
        assert_eq!(b.recv().await.unwrap().id(), "r1");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(1);
        bus.emit(SyncEvent::EntityCached {
            id: "r1".to_string(),
        });
    }
}
