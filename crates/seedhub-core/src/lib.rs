//! Seedhub Core - Download Client Control Plane
//!
//! This crate provides the unified control plane over multiple download
//! client backends (ED2K-style and BitTorrent). It handles instance
//! connection lifecycles, snapshot aggregation, categories, durable
//! moves, and download history.

mod adapter;
mod category;
mod error;
mod mover;
mod poller;
mod registry;
mod sequencer;
mod storage;
mod swarm_cache;

pub use adapter::*;
pub use category::*;
pub use error::*;
pub use mover::*;
pub use poller::*;
pub use registry::*;
pub use sequencer::*;
pub use storage::*;
pub use swarm_cache::*;

use seedhub_types::{
    ClientInstance, CoreEvent, DeleteOptions, DeleteOutcome, HistoryEntry, LabelOptions,
    MoveOperation, SeedhubConfig, Snapshot, SwarmEntry,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// The main Seedhub core instance
pub struct SeedhubCore {
    /// Database connection
    pub storage: Storage,
    /// Configured backend instances
    pub registry: Arc<InstanceRegistry>,
    /// Canonical category store
    pub categories: Arc<CategoryStore>,
    /// Durable move operations
    pub mover: Arc<MoveOrchestrator>,
    /// Ephemeral tracker/peer cache
    pub swarm: Arc<SwarmCache>,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
    /// Aggregation loop
    aggregation: Arc<AggregationLoop>,
    /// Current configuration
    config: parking_lot::RwLock<SeedhubConfig>,
    /// Background loop handles, live between start() and shutdown()
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SeedhubCore {
    /// Create a new SeedhubCore instance.
    ///
    /// Opens persistence under `data_dir`, builds the instance registry
    /// from configuration and loads the category store. No backend
    /// session is opened and no background loop runs until `start()`.
    pub async fn new(
        data_dir: PathBuf,
        config: SeedhubConfig,
        factory: Arc<dyn AdapterFactory>,
    ) -> Result<Self, SeedhubError> {
        let storage = Storage::new(data_dir.join("seedhub.db")).await?;
        let (event_tx, _) = broadcast::channel(1000);

        let registry = Arc::new(InstanceRegistry::new(
            factory,
            Duration::from_secs(config.reconnect_delay_secs),
            event_tx.clone(),
        ));
        registry.rebuild(&config.instances).await?;

        let categories = Arc::new(
            CategoryStore::load(storage.clone(), &config.categories, event_tx.clone()).await?,
        );
        let mover = Arc::new(MoveOrchestrator::new(
            storage.clone(),
            registry.clone(),
            categories.clone(),
            event_tx.clone(),
        ));
        let aggregation = Arc::new(AggregationLoop::new(
            registry.clone(),
            storage.clone(),
            event_tx.clone(),
        ));

        Ok(Self {
            storage,
            registry,
            categories,
            mover,
            swarm: Arc::new(SwarmCache::new()),
            event_tx,
            aggregation,
            config: parking_lot::RwLock::new(config),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Bring the core online: connect enabled instances, recover any
    /// interrupted move operations, then spawn the aggregation and swarm
    /// refresh loops.
    pub async fn start(&self) -> Result<(), SeedhubError> {
        self.registry.connect_enabled().await;

        let recovered = self.mover.recover().await?;
        if !recovered.is_empty() {
            info!("Recovered {} interrupted move operations", recovered.len());
        }

        let (poll_interval, swarm_refresh) = {
            let config = self.config.read();
            (
                Duration::from_secs(config.poll_interval_secs),
                Duration::from_secs(config.swarm_refresh_secs),
            )
        };
        self.spawn_loops(poll_interval, swarm_refresh);
        Ok(())
    }

    fn spawn_loops(&self, poll_interval: Duration, swarm_refresh: Duration) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.aggregation.clone().run(poll_interval),
        ));
        tasks.push(tokio::spawn(self.swarm.clone().run_refresh_loop(
            self.registry.clone(),
            swarm_refresh,
        )));
    }

    /// Stop background loops and close all backend sessions
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.registry.shutdown().await;
        info!("Core shut down");
    }

    /// Apply a new configuration: the instance set is rebuilt wholesale,
    /// swarm cache entries of removed instances are dropped, and the
    /// running loops are respawned so new intervals take effect.
    pub async fn reload(&self, config: SeedhubConfig) -> Result<(), SeedhubError> {
        self.registry
            .set_reconnect_delay(Duration::from_secs(config.reconnect_delay_secs));
        self.registry.rebuild(&config.instances).await?;
        self.registry.connect_enabled().await;

        let live: HashSet<String> = config.instances.iter().map(|i| i.id.clone()).collect();
        self.swarm.retain_instances(&live).await;

        let was_running = {
            let mut tasks = self.tasks.lock();
            let running = !tasks.is_empty();
            for task in tasks.drain(..) {
                task.abort();
            }
            running
        };
        if was_running {
            self.spawn_loops(
                Duration::from_secs(config.poll_interval_secs),
                Duration::from_secs(config.swarm_refresh_secs),
            );
        }

        *self.config.write() = config;
        info!("Configuration reloaded");
        Ok(())
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Emit an event
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.event_tx.send(event);
    }

    // ========================================================================
    // Instance Operations
    // ========================================================================

    /// All configured instances with their connection state
    pub async fn instances(&self) -> Vec<ClientInstance> {
        self.registry
            .all()
            .await
            .iter()
            .map(|h| h.client_instance())
            .collect()
    }

    /// Run one aggregation pass immediately instead of waiting for the
    /// next scheduled tick
    pub async fn poll_now(&self) -> Option<Snapshot> {
        self.aggregation.tick().await
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Delete an item from its backend and record the deletion in history
    pub async fn delete_download(
        &self,
        hash: &str,
        instance_id: &str,
        options: DeleteOptions,
    ) -> Result<DeleteOutcome, SeedhubError> {
        let handle = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| SeedhubError::NotFound(format!("Instance: {}", instance_id)))?;

        let adapter = handle.adapter().clone();
        let delete_hash = hash.to_string();
        let outcome = handle
            .sequencer()
            .run(async move { adapter.delete_item(&delete_hash, &options).await })
            .await?;

        if let Err(e) = self.storage.mark_history_deleted(hash, instance_id).await {
            warn!("Failed to record deletion of {} in history: {}", hash, e);
        }
        Ok(outcome)
    }

    /// Change an item's category. Relocates its files when the resolved
    /// destination differs from where the item currently lives; returns
    /// the move operation in that case.
    pub async fn set_download_category(
        &self,
        hash: &str,
        instance_id: &str,
        category: &str,
    ) -> Result<Option<MoveOperation>, SeedhubError> {
        self.mover.change_category(hash, instance_id, category).await
    }

    /// Assign a label and/or priority without touching files
    pub async fn set_download_label(
        &self,
        hash: &str,
        instance_id: &str,
        options: LabelOptions,
    ) -> Result<(), SeedhubError> {
        let handle = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| SeedhubError::NotFound(format!("Instance: {}", instance_id)))?;

        let adapter = handle.adapter().clone();
        let label_hash = hash.to_string();
        handle
            .sequencer()
            .run(async move { adapter.set_item_category(&label_hash, &options).await })
            .await
    }

    // ========================================================================
    // Category Operations
    // ========================================================================

    /// Create a category and propagate it to every connected backend
    /// with native category support
    pub async fn create_category(
        &self,
        name: &str,
        path: PathBuf,
        options: seedhub_types::CategoryOptions,
    ) -> Result<seedhub_types::Category, SeedhubError> {
        let category = self.categories.create(name, path, options).await?;
        for handle in self.registry.connected().await {
            if let Err(e) = self.categories.ensure_on_backend(&handle, name).await {
                warn!(
                    "Could not propagate category {} to instance {}: {}",
                    name,
                    handle.id(),
                    e
                );
            }
        }
        Ok(category)
    }

    /// Edit a category's path, color, priority or path mappings, and
    /// push the re-resolved path to every connected backend with native
    /// category support
    pub async fn edit_category(
        &self,
        name: &str,
        options: seedhub_types::CategoryOptions,
    ) -> Result<seedhub_types::Category, SeedhubError> {
        let category = self.categories.edit(name, options).await?;
        for handle in self.registry.connected().await {
            let path = self
                .categories
                .resolve_path(name, &handle)
                .await
                .ok()
                .flatten();
            let adapter = handle.adapter().clone();
            let edit_name = name.to_string();
            let result = handle
                .sequencer()
                .run(async move { adapter.edit_category(&edit_name, path.as_deref()).await })
                .await;
            if let Err(e) = result {
                warn!(
                    "Could not propagate category edit to instance {}: {}",
                    handle.id(),
                    e
                );
            }
        }
        Ok(category)
    }

    /// Delete a category locally and on every connected backend.
    /// `Default` cannot be deleted.
    pub async fn delete_category(&self, name: &str) -> Result<(), SeedhubError> {
        self.categories.delete(name).await?;
        for handle in self.registry.connected().await {
            let adapter = handle.adapter().clone();
            let delete_name = name.to_string();
            let result = handle
                .sequencer()
                .run(async move { adapter.delete_category(&delete_name).await })
                .await;
            if let Err(e) = result {
                warn!(
                    "Could not delete category on instance {}: {}",
                    handle.id(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Rename a category. `Default` cannot be renamed.
    pub async fn rename_category(
        &self,
        old_name: &str,
        new_name: &str,
    ) -> Result<seedhub_types::Category, SeedhubError> {
        let category = self.categories.rename(old_name, new_name).await?;
        for handle in self.registry.connected().await {
            let adapter = handle.adapter().clone();
            let old = old_name.to_string();
            let new = new_name.to_string();
            let result = handle
                .sequencer()
                .run(async move { adapter.rename_category(&old, &new).await })
                .await;
            if let Err(e) = result {
                warn!(
                    "Could not rename category on instance {}: {}",
                    handle.id(),
                    e
                );
            }
        }
        Ok(category)
    }

    // ========================================================================
    // Move Operations
    // ========================================================================

    /// Retry a failed move operation
    pub async fn retry_move(&self, id: Uuid) -> Result<MoveOperation, SeedhubError> {
        self.mover.retry(id).await
    }

    /// All move operations currently in the failed state
    pub async fn failed_moves(&self) -> Result<Vec<MoveOperation>, SeedhubError> {
        self.mover.failed_operations().await
    }

    // ========================================================================
    // Swarm Metadata
    // ========================================================================

    /// Cached tracker/peer data for one item
    pub async fn swarm_entry(&self, instance_id: &str, hash: &str) -> Option<SwarmEntry> {
        self.swarm.get(instance_id, hash).await
    }

    /// All cached tracker/peer data for one instance
    pub async fn swarm_entries(&self, instance_id: &str) -> Vec<SwarmEntry> {
        self.swarm.entries_for(instance_id).await
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Download history rows for one instance, newest first
    pub async fn history(&self, instance_id: &str) -> Result<Vec<HistoryEntry>, SeedhubError> {
        self.storage.load_history(instance_id).await
    }
}
