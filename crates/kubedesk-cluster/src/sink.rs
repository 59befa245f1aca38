//! Collaborators the registry talks to: where cluster changes are published
//! and where per-cluster overrides come from

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use kubedesk_types::{ClusterId, ClusterPreferences, ClusterSnapshot};

/// Change published to the catalog
#[derive(Clone, Debug, PartialEq)]
pub enum CatalogEvent {
    Added(ClusterSnapshot),
    Updated(ClusterSnapshot),
    Removed(ClusterId),
}

/// Receives add/update/remove events for clusters
pub trait CatalogSink: Send + Sync + 'static {
    fn publish(&self, event: CatalogEvent);
}

/// Logs catalog changes and fans them out to subscribers
pub struct BroadcastSink {
    tx: broadcast::Sender<CatalogEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.tx.subscribe()
    }
}

impl CatalogSink for BroadcastSink {
    fn publish(&self, event: CatalogEvent) {
        match &event {
            CatalogEvent::Added(snapshot) => info!(
                cluster = %snapshot.model.id,
                name = %snapshot.model.display_name(),
                "Cluster added"
            ),
            CatalogEvent::Updated(snapshot) => info!(
                cluster = %snapshot.model.id,
                online = snapshot.status.online,
                accessible = snapshot.status.accessible,
                disconnected = snapshot.status.disconnected,
                "Cluster updated"
            ),
            CatalogEvent::Removed(id) => info!(cluster = %id, "Cluster removed"),
        }
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Supplies per-cluster overrides
pub trait PreferencesStore: Send + Sync + 'static {
    fn preferences(&self, id: &ClusterId) -> ClusterPreferences;
}

/// In-memory preferences, seeded from the config file
#[derive(Default)]
pub struct StaticPreferences {
    entries: Mutex<HashMap<ClusterId, ClusterPreferences>>,
}

impl StaticPreferences {
    pub fn new(entries: HashMap<ClusterId, ClusterPreferences>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn set(&self, id: ClusterId, preferences: ClusterPreferences) {
        self.entries.lock().insert(id, preferences);
    }
}

impl PreferencesStore for StaticPreferences {
    fn preferences(&self, id: &ClusterId) -> ClusterPreferences {
        self.entries.lock().get(id).cloned().unwrap_or_default()
    }
}
