//! Ephemeral tracker/peer cache
//!
//! Swarm metadata is expensive to fetch, so it is refreshed on its own
//! cadence instead of on every poll tick. Entries live per instance,
//! keyed by item hash, and are evicted when the owning item disappears
//! from the backend's current item set; absence from the backend is the
//! authoritative signal, not a TTL.
//!
//! Incremental source-name payloads are merged by numeric index: a later
//! value overwrites only the same index, unspecified indices keep their
//! previous value, so a transient partial response never erases known
//! data.

use crate::error::SeedhubError;
use crate::registry::{InstanceHandle, InstanceRegistry};
use chrono::Utc;
use seedhub_types::{SwarmEntry, SwarmUpdate};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Per-instance tracker/peer/source cache
pub struct SwarmCache {
    entries: RwLock<HashMap<String, HashMap<String, SwarmEntry>>>,
}

impl SwarmCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the cached entry for one item
    pub async fn get(&self, instance_id: &str, hash: &str) -> Option<SwarmEntry> {
        self.entries
            .read()
            .await
            .get(instance_id)
            .and_then(|m| m.get(hash))
            .cloned()
    }

    /// All cached entries for one instance
    pub async fn entries_for(&self, instance_id: &str) -> Vec<SwarmEntry> {
        self.entries
            .read()
            .await
            .get(instance_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Run one refresh cycle for an instance: collect the current item
    /// set, fetch swarm metadata, upsert entries, then evict every key
    /// absent from that set.
    pub async fn refresh_instance(
        &self,
        handle: &Arc<InstanceHandle>,
    ) -> Result<(), SeedhubError> {
        if !handle.adapter().capabilities().swarm_metadata {
            return Ok(());
        }

        let adapter = handle.adapter().clone();
        let items = handle
            .sequencer()
            .run(async move { adapter.items_for_swarm_refresh().await })
            .await?;

        let adapter = handle.adapter().clone();
        let hashes = items.clone();
        let batch = handle
            .sequencer()
            .run(async move { adapter.fetch_swarm_metadata(&hashes).await })
            .await?;

        let now = Utc::now();
        let present: HashSet<&String> = items.iter().collect();

        let mut entries = self.entries.write().await;
        let instance_entries = entries.entry(handle.id().to_string()).or_default();

        for (hash, update) in &batch.updates {
            let entry = instance_entries
                .entry(hash.clone())
                .or_insert_with(|| SwarmEntry {
                    hash: hash.clone(),
                    trackers: Vec::new(),
                    peers: Vec::new(),
                    sources: BTreeMap::new(),
                    last_updated: now,
                });
            merge_entry(entry, update);
            entry.last_updated = now;
        }

        let before = instance_entries.len();
        instance_entries.retain(|hash, _| present.contains(hash));
        let evicted = before - instance_entries.len();
        if evicted > 0 {
            debug!(
                "Evicted {} stale swarm entries for instance {}",
                evicted,
                handle.id()
            );
        }

        Ok(())
    }

    /// Drop cache state for instances that no longer exist (after a
    /// configuration reload)
    pub async fn retain_instances(&self, ids: &HashSet<String>) {
        self.entries.write().await.retain(|id, _| ids.contains(id));
    }

    /// Periodic refresh over all connected instances. Failures are
    /// isolated per instance.
    pub async fn run_refresh_loop(self: Arc<Self>, registry: Arc<InstanceRegistry>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let handles = registry.connected().await;
            let ids: HashSet<String> = registry
                .all()
                .await
                .iter()
                .map(|h| h.id().to_string())
                .collect();
            self.retain_instances(&ids).await;

            for handle in handles {
                if let Err(e) = self.refresh_instance(&handle).await {
                    warn!("Swarm refresh failed for instance {}: {}", handle.id(), e);
                }
            }
        }
    }
}

/// Apply one incremental update to a cached entry
fn merge_entry(entry: &mut SwarmEntry, update: &SwarmUpdate) {
    if !update.trackers.is_empty() {
        entry.trackers = update.trackers.clone();
    }
    if !update.peers.is_empty() {
        entry.peers = update.peers.clone();
    }
    for slot in &update.sources {
        entry.sources.insert(slot.index, slot.name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::{MockAdapter, MockFactory};
    use seedhub_types::{
        ClientKind, ConnectionState, InstanceConfig, SourceSlot, SwarmBatch, TrackerStatus,
    };
    use tokio::sync::broadcast;

    async fn handle_with(adapter: Arc<MockAdapter>) -> (Arc<InstanceRegistry>, Arc<InstanceHandle>) {
        let factory = MockFactory::new();
        factory.insert("bt-1", adapter);
        let (event_tx, _) = broadcast::channel(64);
        let registry = Arc::new(InstanceRegistry::new(
            Arc::new(factory),
            Duration::from_secs(30),
            event_tx,
        ));
        registry
            .rebuild(&[InstanceConfig {
                id: "bt-1".to_string(),
                kind: ClientKind::QBittorrent,
                display_name: "bt-1".to_string(),
                host: "localhost".to_string(),
                port: 8080,
                credentials: None,
                enabled: true,
            }])
            .await
            .unwrap();
        let handle = registry.get("bt-1").await.unwrap();
        handle.connect().await;
        assert_eq!(handle.connection_state(), ConnectionState::Connected);
        (registry, handle)
    }

    fn batch_with_sources(hash: &str, sources: Vec<(u32, &str)>) -> SwarmBatch {
        let mut batch = SwarmBatch::default();
        batch.updates.insert(
            hash.to_string(),
            SwarmUpdate {
                trackers: Vec::new(),
                peers: Vec::new(),
                sources: sources
                    .into_iter()
                    .map(|(index, name)| SourceSlot {
                        index,
                        name: name.to_string(),
                    })
                    .collect(),
            },
        );
        batch
    }

    #[tokio::test]
    async fn test_incremental_updates_merge_by_index() {
        let adapter = Arc::new(MockAdapter::new(ClientKind::Ed2k));
        *adapter.swarm_items.lock() = vec!["abc".to_string()];
        adapter
            .swarm_batches
            .lock()
            .push(batch_with_sources("abc", vec![(0, "peer-a"), (1, "peer-b")]));
        adapter
            .swarm_batches
            .lock()
            .push(batch_with_sources("abc", vec![(1, "peer-b2"), (4, "peer-e")]));

        let (_registry, handle) = handle_with(adapter).await;
        let cache = SwarmCache::new();

        cache.refresh_instance(&handle).await.unwrap();
        cache.refresh_instance(&handle).await.unwrap();

        let entry = cache.get("bt-1", "abc").await.unwrap();
        // Union of both updates: index 1 overwritten, 0 preserved, 4 added
        assert_eq!(entry.sources.len(), 3);
        assert_eq!(entry.sources.get(&0).map(String::as_str), Some("peer-a"));
        assert_eq!(entry.sources.get(&1).map(String::as_str), Some("peer-b2"));
        assert_eq!(entry.sources.get(&4).map(String::as_str), Some("peer-e"));
    }

    #[tokio::test]
    async fn test_absent_items_are_evicted() {
        let adapter = Arc::new(MockAdapter::new(ClientKind::QBittorrent));
        *adapter.swarm_items.lock() = vec!["abc".to_string()];
        adapter.swarm_batches.lock().push(batch_with_sources(
            "abc",
            vec![(0, "peer-a")],
        ));

        let (_registry, handle) = handle_with(adapter.clone()).await;
        let cache = SwarmCache::new();
        cache.refresh_instance(&handle).await.unwrap();
        assert!(cache.get("bt-1", "abc").await.is_some());

        // Item disappears from the backend's item set
        adapter.swarm_items.lock().clear();
        cache.refresh_instance(&handle).await.unwrap();
        cache.refresh_instance(&handle).await.unwrap();
        assert!(cache.get("bt-1", "abc").await.is_none());
    }

    #[tokio::test]
    async fn test_partial_update_preserves_trackers() {
        let adapter = Arc::new(MockAdapter::new(ClientKind::QBittorrent));
        *adapter.swarm_items.lock() = vec!["abc".to_string()];

        let mut first = SwarmBatch::default();
        first.updates.insert(
            "abc".to_string(),
            SwarmUpdate {
                trackers: vec![TrackerStatus {
                    url: "udp://tracker.example/announce".to_string(),
                    status: "working".to_string(),
                    message: None,
                }],
                peers: Vec::new(),
                sources: Vec::new(),
            },
        );
        adapter.swarm_batches.lock().push(first);
        // Second cycle reports only sources; trackers must survive
        adapter
            .swarm_batches
            .lock()
            .push(batch_with_sources("abc", vec![(2, "peer-c")]));

        let (_registry, handle) = handle_with(adapter).await;
        let cache = SwarmCache::new();
        cache.refresh_instance(&handle).await.unwrap();
        cache.refresh_instance(&handle).await.unwrap();

        let entry = cache.get("bt-1", "abc").await.unwrap();
        assert_eq!(entry.trackers.len(), 1);
        assert_eq!(entry.sources.get(&2).map(String::as_str), Some("peer-c"));
    }

    #[tokio::test]
    async fn test_non_swarm_backend_is_skipped() {
        let mut adapter = MockAdapter::new(ClientKind::Ed2k);
        adapter.capabilities.swarm_metadata = false;
        let adapter = Arc::new(adapter);
        *adapter.swarm_items.lock() = vec!["abc".to_string()];

        let (_registry, handle) = handle_with(adapter).await;
        let cache = SwarmCache::new();
        cache.refresh_instance(&handle).await.unwrap();
        assert!(cache.entries_for("bt-1").await.is_empty());
    }
}
