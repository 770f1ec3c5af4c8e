//! Aggregation loop
//!
//! Produces one consistent snapshot of all downloads/uploads/shared
//! files across all enabled instances on a fixed cadence and pushes it
//! to subscribers. Per-instance fetches run concurrently and failures
//! are isolated: one broken backend degrades its own section of the
//! snapshot, never the whole tick. The next tick is scheduled only
//! after all fetches of the current one have settled, so ticks never
//! overlap.

use crate::error::SeedhubError;
use crate::registry::InstanceRegistry;
use crate::storage::Storage;
use chrono::Utc;
use seedhub_types::{
    CoreEvent, FetchHints, FetchedData, HistoryEntry, HistoryStatus, ItemStatus, Snapshot,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Polls all enabled instances and broadcasts merged snapshots
pub struct AggregationLoop {
    registry: Arc<InstanceRegistry>,
    storage: Storage,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl AggregationLoop {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        storage: Storage,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            registry,
            storage,
            event_tx,
        }
    }

    /// Run one aggregation tick.
    ///
    /// Returns `None` when the tick was skipped because nobody is
    /// subscribed; with no listeners there is no reason to poll.
    pub async fn tick(&self) -> Option<Snapshot> {
        if self.event_tx.receiver_count() == 0 {
            debug!("No subscribers, skipping aggregation tick");
            return None;
        }

        let handles = self.registry.enabled().await;

        // Fetch all connected instances concurrently; a slow or hung
        // backend must not block the others
        let fetches = handles.iter().map(|handle| {
            let handle = handle.clone();
            async move {
                if !handle.is_connected() {
                    return (handle, None);
                }
                let adapter = handle.adapter().clone();
                let result = handle
                    .sequencer()
                    .run(async move { adapter.fetch_data(&FetchHints::default()).await })
                    .await;
                (handle, Some(result))
            }
        });
        let results = futures::future::join_all(fetches).await;

        let mut snapshot = Snapshot::default();
        for (handle, fetched) in results {
            let mut status = handle.status();
            match fetched {
                Some(Ok(data)) => {
                    if let Err(e) = self.reconcile_history(handle.id(), &data).await {
                        warn!("History reconciliation failed for {}: {}", handle.id(), e);
                    }
                    merge_instance_data(&mut snapshot, handle.id(), data);
                }
                Some(Err(e)) => {
                    // Partial failure: record it on the instance, keep
                    // the other instances' data
                    warn!("Fetch failed for instance {}: {}", handle.id(), e);
                    status.last_fetch_error = Some(e.to_string());
                    if e.is_connection() {
                        handle.schedule_reconnect();
                    }
                }
                None => {}
            }
            snapshot.instances.push(status);
        }

        let _ = self.event_tx.send(CoreEvent::SnapshotReady {
            snapshot: snapshot.clone(),
        });
        Some(snapshot)
    }

    /// Record presence in the history table and mark rows whose item has
    /// disappeared from the backend as missing. Rows are never dropped.
    async fn reconcile_history(
        &self,
        instance_id: &str,
        data: &FetchedData,
    ) -> Result<(), SeedhubError> {
        let now = Utc::now();
        let mut present = Vec::with_capacity(data.downloads.len());

        for item in &data.downloads {
            present.push(item.hash.clone());
            let (status, completed_at) = match item.status {
                ItemStatus::Completed => (HistoryStatus::Completed, Some(now)),
                _ => (HistoryStatus::Downloading, None),
            };
            self.storage
                .upsert_history(&HistoryEntry {
                    hash: item.hash.clone(),
                    instance_id: instance_id.to_string(),
                    name: item.name.clone(),
                    size: item.size,
                    status,
                    started_at: item.added_at.unwrap_or(now),
                    completed_at,
                })
                .await?;
        }

        self.storage
            .mark_history_missing(instance_id, &present)
            .await?;
        Ok(())
    }

    /// Fixed-cadence polling. The interval only elapses between ticks,
    /// so a long tick delays the next one instead of overlapping it.
    pub async fn run(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}

/// Tag everything one instance reported with its origin and fold it into
/// the merged snapshot
fn merge_instance_data(snapshot: &mut Snapshot, instance_id: &str, data: FetchedData) {
    for mut item in data.downloads {
        item.instance_id = instance_id.to_string();
        snapshot.downloads.push(item);
    }
    for mut item in data.uploads {
        item.instance_id = instance_id.to_string();
        snapshot.uploads.push(item);
    }
    for mut file in data.shared_files {
        file.instance_id = instance_id.to_string();
        snapshot.shared_files.push(file);
    }
}
