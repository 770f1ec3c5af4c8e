//! Move orchestrator
//!
//! Coordinates relocating a download's files when its category changes.
//! Every operation is persisted before any filesystem or backend action,
//! transitions are monotonic, and non-terminal operations are recovered
//! on startup by verifying against the live backend before retrying.
//! At-least-once re-execution stays idempotent because a move that
//! already landed is confirmed, never re-issued.

use crate::category::CategoryStore;
use crate::error::SeedhubError;
use crate::registry::{InstanceHandle, InstanceRegistry};
use crate::storage::Storage;
use chrono::Utc;
use seedhub_types::{
    CoreEvent, DownloadItem, FetchHints, LabelOptions, MoveOperation, MoveStatus,
    DEFAULT_CATEGORY,
};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// Drives durable, crash-recoverable category moves
pub struct MoveOrchestrator {
    storage: Storage,
    registry: Arc<InstanceRegistry>,
    categories: Arc<CategoryStore>,
    /// Single writer: transitions for any operation are serialized
    write_lock: Mutex<()>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl MoveOrchestrator {
    pub fn new(
        storage: Storage,
        registry: Arc<InstanceRegistry>,
        categories: Arc<CategoryStore>,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            storage,
            registry,
            categories,
            write_lock: Mutex::new(()),
            event_tx,
        }
    }

    /// Change an item's category, relocating its files when the resolved
    /// destination path differs from where the item currently lives.
    ///
    /// Returns the move operation when a relocation was required, `None`
    /// when the change was label-only.
    pub async fn change_category(
        &self,
        hash: &str,
        instance_id: &str,
        dest_category: &str,
    ) -> Result<Option<MoveOperation>, SeedhubError> {
        let handle = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| SeedhubError::NotFound(format!("Instance: {}", instance_id)))?;

        if self.categories.get(dest_category).await.is_none() {
            return Err(SeedhubError::NotFound(format!(
                "Category: {}",
                dest_category
            )));
        }

        let item = self
            .fetch_item(&handle, hash)
            .await?
            .ok_or_else(|| SeedhubError::NotFound(format!("Item: {}", hash)))?;

        // Make the category visible on the backend before labeling
        self.categories
            .ensure_on_backend(&handle, dest_category)
            .await?;

        let dest_path = self.categories.resolve_path(dest_category, &handle).await?;
        let needs_move = match &dest_path {
            Some(dest) => *dest != item.save_path,
            // Default category: the backend keeps its own default path
            None => false,
        };

        if !needs_move {
            let adapter = handle.adapter().clone();
            let label = LabelOptions {
                category: Some(dest_category.to_string()),
                priority: None,
            };
            let label_hash = hash.to_string();
            handle
                .sequencer()
                .run(async move { adapter.set_item_category(&label_hash, &label).await })
                .await?;
            return Ok(None);
        }

        let operation = MoveOperation::new(
            hash.to_string(),
            instance_id.to_string(),
            item.category
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            dest_category.to_string(),
            item.save_path,
            dest_path.unwrap_or_default(),
        );

        // Durable before any backend action
        self.storage.save_move(&operation).await?;
        let operation = self.execute(operation, &handle).await;
        Ok(Some(operation))
    }

    /// Deliberate re-invocation of a failed operation. Failed moves are
    /// never retried automatically.
    pub async fn retry(&self, id: Uuid) -> Result<MoveOperation, SeedhubError> {
        let operation = self
            .storage
            .load_move(id)
            .await?
            .ok_or_else(|| SeedhubError::NotFound(format!("Move operation: {}", id)))?;

        if operation.status != MoveStatus::Failed {
            return Err(SeedhubError::InvalidOperation(format!(
                "Move operation {} is not in a failed state",
                id
            )));
        }

        let handle = self
            .registry
            .get(&operation.instance_id)
            .await
            .ok_or_else(|| {
                SeedhubError::NotFound(format!("Instance: {}", operation.instance_id))
            })?;

        // Fresh attempt from the beginning of the state machine
        let mut operation = operation;
        operation.status = MoveStatus::Pending;
        operation.error = None;
        operation.updated_at = Utc::now();
        self.storage.save_move(&operation).await?;

        Ok(self.execute(operation, &handle).await)
    }

    /// Operations requiring operator attention
    pub async fn failed_operations(&self) -> Result<Vec<MoveOperation>, SeedhubError> {
        self.storage.load_moves_by_status(MoveStatus::Failed).await
    }

    /// Startup recovery: scan persisted non-terminal operations, verify
    /// each against its live backend, and either confirm completion or
    /// re-attempt once from `pending`.
    pub async fn recover(&self) -> Result<Vec<MoveOperation>, SeedhubError> {
        let unfinished = self.storage.load_unfinished_moves().await?;
        if unfinished.is_empty() {
            return Ok(Vec::new());
        }
        info!("Recovering {} unfinished move operations", unfinished.len());

        let mut recovered = Vec::new();
        for operation in unfinished {
            let result = self.recover_one(operation).await;
            recovered.push(result);
        }
        Ok(recovered)
    }

    async fn recover_one(&self, mut operation: MoveOperation) -> MoveOperation {
        let Some(handle) = self.registry.get(&operation.instance_id).await else {
            let message = format!("Instance {} no longer configured", operation.instance_id);
            return self
                .mark(operation, MoveStatus::Failed, Some(message))
                .await;
        };

        // The backend may have finished the move before the crash
        // prevented recording it
        match self.fetch_item(&handle, &operation.file_hash).await {
            Ok(Some(item)) if item.save_path == operation.dest_path => {
                info!(
                    "Move {} verified complete on backend, confirming",
                    operation.id
                );
                self.mark(operation, MoveStatus::Completed, None).await
            }
            Ok(_) => {
                info!(
                    "Move {} not completed on backend, retrying once",
                    operation.id
                );
                operation.status = MoveStatus::Pending;
                operation.updated_at = Utc::now();
                if let Err(e) = self.storage.save_move(&operation).await {
                    warn!("Failed to persist move {} for retry: {}", operation.id, e);
                    return operation;
                }
                self.execute(operation, &handle).await
            }
            Err(e) => {
                self.mark(
                    operation,
                    MoveStatus::Failed,
                    Some(format!("Could not verify against backend: {}", e)),
                )
                .await
            }
        }
    }

    /// Drive one operation through `in-progress` to a terminal state.
    /// Backend failures end as a persisted `failed` status, never as a
    /// returned error.
    async fn execute(
        &self,
        operation: MoveOperation,
        handle: &Arc<InstanceHandle>,
    ) -> MoveOperation {
        let _guard = self.write_lock.lock().await;

        // Recorded before the backend call so a crash mid-move is
        // visible to the recovery scan
        let operation = self.mark(operation, MoveStatus::InProgress, None).await;

        let adapter = handle.adapter().clone();
        let label = LabelOptions {
            category: Some(operation.dest_category.clone()),
            priority: None,
        };
        let hash = operation.file_hash.clone();
        let label_result = handle
            .sequencer()
            .run(async move { adapter.set_item_category(&hash, &label).await })
            .await;

        let result = match label_result {
            Ok(()) if handle.adapter().capabilities().native_move => Ok(()),
            Ok(()) => {
                // Backend does not move files on a category change; issue
                // the explicit move instruction
                let adapter = handle.adapter().clone();
                let hash = operation.file_hash.clone();
                let dest = operation.dest_path.clone();
                handle
                    .sequencer()
                    .run(async move { adapter.move_item(&hash, &dest).await })
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.mark(operation, MoveStatus::Completed, None).await,
            Err(e) => {
                warn!("Move {} failed: {}", operation.id, e);
                self.mark(operation, MoveStatus::Failed, Some(e.to_string()))
                    .await
            }
        }
    }

    /// Persist a status transition and broadcast it. Transitions are
    /// monotonic: terminal operations are never reopened here.
    async fn mark(
        &self,
        mut operation: MoveOperation,
        status: MoveStatus,
        error: Option<String>,
    ) -> MoveOperation {
        if operation.status.is_terminal() {
            warn!(
                "Ignoring transition of terminal move {} to {:?}",
                operation.id, status
            );
            return operation;
        }
        operation.status = status;
        operation.error = error;
        operation.updated_at = Utc::now();

        if let Err(e) = self.storage.save_move(&operation).await {
            warn!("Failed to persist move {} status: {}", operation.id, e);
        }
        let _ = self.event_tx.send(CoreEvent::MoveStatusChanged {
            operation: operation.clone(),
        });
        operation
    }

    async fn fetch_item(
        &self,
        handle: &Arc<InstanceHandle>,
        hash: &str,
    ) -> Result<Option<DownloadItem>, SeedhubError> {
        let adapter = handle.adapter().clone();
        let hints = FetchHints {
            hashes: Some(vec![hash.to_string()]),
        };
        let data = handle
            .sequencer()
            .run(async move { adapter.fetch_data(&hints).await })
            .await?;
        let hash = hash.to_string();
        Ok(data.downloads.into_iter().find(|d| d.hash == hash))
    }
}
