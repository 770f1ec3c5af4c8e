//! Category reconciler
//!
//! One canonical category list, reconciled against N backends that may
//! or may not support native categories and may see different filesystem
//! paths than the app (path mappings). Mutations go through a single
//! writer; the `Default` category always exists and cannot be deleted or
//! renamed.

use crate::error::SeedhubError;
use crate::registry::InstanceHandle;
use crate::storage::Storage;
use seedhub_types::{
    Category, CategoryConfig, CategoryOptions, CoreEvent, DEFAULT_CATEGORY,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

/// Canonical category store plus per-backend reconciliation
pub struct CategoryStore {
    storage: Storage,
    categories: RwLock<HashMap<String, Category>>,
    /// Serializes mutations: no concurrent edits to the same category
    write_lock: Mutex<()>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl CategoryStore {
    /// Load the store from persistence, seed missing categories from
    /// configuration and guarantee `Default` exists.
    pub async fn load(
        storage: Storage,
        seed: &[CategoryConfig],
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Result<Self, SeedhubError> {
        let mut categories: HashMap<String, Category> = storage
            .load_categories()
            .await?
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();

        if !categories.contains_key(DEFAULT_CATEGORY) {
            let default = Category::default_category();
            storage.save_category(&default).await?;
            categories.insert(default.name.clone(), default);
        }

        for config in seed {
            if categories.contains_key(&config.name) {
                continue;
            }
            let mut category = Category::new(config.name.clone(), config.path.clone());
            if let Some(color) = &config.color {
                category.color = color.clone();
            }
            if let Some(priority) = config.priority {
                category.priority = priority;
            }
            category.path_mappings = config.path_mappings.clone();
            for warning in validate_path(&category.path).await {
                warn!("Category {}: {}", category.name, warning);
            }
            storage.save_category(&category).await?;
            categories.insert(category.name.clone(), category);
        }

        Ok(Self {
            storage,
            categories: RwLock::new(categories),
            write_lock: Mutex::new(()),
            event_tx,
        })
    }

    /// All categories, ordered by priority then name
    pub async fn all(&self) -> Vec<Category> {
        let mut categories: Vec<Category> =
            self.categories.read().await.values().cloned().collect();
        categories.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        categories
    }

    pub async fn get(&self, name: &str) -> Option<Category> {
        self.categories.read().await.get(name).cloned()
    }

    /// Create a category. Path problems are surfaced as warnings, not
    /// errors: an inaccessible path only degrades file management.
    pub async fn create(
        &self,
        name: &str,
        path: PathBuf,
        options: CategoryOptions,
    ) -> Result<Category, SeedhubError> {
        if name.trim().is_empty() {
            return Err(SeedhubError::Validation(
                "Category name cannot be empty".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        if self.categories.read().await.contains_key(name) {
            return Err(SeedhubError::InvalidOperation(format!(
                "Category already exists: {}",
                name
            )));
        }

        for warning in validate_path(&path).await {
            warn!("Category {}: {}", name, warning);
        }

        let mut category = Category::new(name.to_string(), path);
        if let Some(color) = options.color {
            category.color = color;
        }
        if let Some(priority) = options.priority {
            category.priority = priority;
        }
        if let Some(mappings) = options.path_mappings {
            category.path_mappings = mappings;
        }

        self.storage.save_category(&category).await?;
        self.categories
            .write()
            .await
            .insert(category.name.clone(), category.clone());

        let _ = self.event_tx.send(CoreEvent::CategoryCreated {
            category: category.clone(),
        });
        Ok(category)
    }

    /// Edit a category. `Default` only accepts a color change: its name
    /// and priority are fixed and its per-backend path is always the
    /// backend's own configured default.
    pub async fn edit(
        &self,
        name: &str,
        options: CategoryOptions,
    ) -> Result<Category, SeedhubError> {
        let _guard = self.write_lock.lock().await;
        let mut category = self
            .categories
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SeedhubError::NotFound(format!("Category: {}", name)))?;

        if category.is_default()
            && (options.path.is_some()
                || options.priority.is_some()
                || options.path_mappings.is_some())
        {
            return Err(SeedhubError::InvalidOperation(
                "The Default category only accepts a color change".to_string(),
            ));
        }

        if let Some(path) = options.path {
            for warning in validate_path(&path).await {
                warn!("Category {}: {}", name, warning);
            }
            category.path = path;
        }
        if let Some(color) = options.color {
            category.color = color;
        }
        if let Some(priority) = options.priority {
            category.priority = priority;
        }
        if let Some(mappings) = options.path_mappings {
            category.path_mappings = mappings;
        }

        self.storage.save_category(&category).await?;
        self.categories
            .write()
            .await
            .insert(category.name.clone(), category.clone());

        let _ = self.event_tx.send(CoreEvent::CategoryUpdated {
            category: category.clone(),
        });
        Ok(category)
    }

    /// Delete a category. `Default` cannot be deleted.
    pub async fn delete(&self, name: &str) -> Result<(), SeedhubError> {
        if name == DEFAULT_CATEGORY {
            return Err(SeedhubError::InvalidOperation(
                "Cannot delete the Default category".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        if self.categories.write().await.remove(name).is_none() {
            return Err(SeedhubError::NotFound(format!("Category: {}", name)));
        }
        self.storage.delete_category(name).await?;

        let _ = self.event_tx.send(CoreEvent::CategoryRemoved {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Rename a category. `Default` cannot be renamed.
    pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<Category, SeedhubError> {
        if old_name == DEFAULT_CATEGORY {
            return Err(SeedhubError::InvalidOperation(
                "Cannot rename the Default category".to_string(),
            ));
        }
        if new_name.trim().is_empty() {
            return Err(SeedhubError::Validation(
                "Category name cannot be empty".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        let mut category = {
            let categories = self.categories.read().await;
            if categories.contains_key(new_name) {
                return Err(SeedhubError::InvalidOperation(format!(
                    "Category already exists: {}",
                    new_name
                )));
            }
            categories
                .get(old_name)
                .cloned()
                .ok_or_else(|| SeedhubError::NotFound(format!("Category: {}", old_name)))?
        };

        self.storage.rename_category(old_name, new_name).await?;
        category.name = new_name.to_string();
        {
            let mut categories = self.categories.write().await;
            categories.remove(old_name);
            categories.insert(new_name.to_string(), category.clone());
        }

        let _ = self.event_tx.send(CoreEvent::CategoryUpdated {
            category: category.clone(),
        });
        Ok(category)
    }

    /// Resolve the path a move to this category should target for one
    /// instance.
    ///
    /// Lookup order: per-instance mapping, then per-kind mapping (for
    /// single-instance-per-type deployments), then the canonical path as
    /// seen identically by app and backend. `None` means "the backend's
    /// own default" (the `Default` category).
    pub async fn resolve_path(
        &self,
        name: &str,
        handle: &InstanceHandle,
    ) -> Result<Option<PathBuf>, SeedhubError> {
        let category = self
            .categories
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SeedhubError::NotFound(format!("Category: {}", name)))?;

        if category.is_default() {
            return Ok(None);
        }

        if let Some(mapped) = category.path_mappings.get(handle.id()) {
            return Ok(Some(mapped.clone()));
        }
        if let Some(mapped) = category.path_mappings.get(handle.kind().type_key()) {
            return Ok(Some(mapped.clone()));
        }
        Ok(Some(category.path))
    }

    // ========================================================================
    // Backend Reconciliation
    // ========================================================================

    /// Make sure one category exists on a backend.
    ///
    /// Idempotent: if the backend already reports the name it is linked
    /// as-is, otherwise it is created. Backends without native category
    /// support are a uniform no-op (returns false).
    pub async fn ensure_on_backend(
        &self,
        handle: &Arc<InstanceHandle>,
        name: &str,
    ) -> Result<bool, SeedhubError> {
        self.ensure_batch_on_backend(handle, &[name.to_string()])
            .await
    }

    /// Batch variant: fetch the backend's category list once and resolve
    /// or create every requested category against that single snapshot.
    pub async fn ensure_batch_on_backend(
        &self,
        handle: &Arc<InstanceHandle>,
        names: &[String],
    ) -> Result<bool, SeedhubError> {
        let adapter = handle.adapter().clone();
        let existing = handle
            .sequencer()
            .run(async move { adapter.list_categories().await })
            .await?;

        let Some(existing) = existing else {
            // No native category support
            return Ok(false);
        };

        let mut created: HashSet<&str> = HashSet::new();
        for name in names {
            if existing.iter().any(|c| c.name == *name) || created.contains(name.as_str()) {
                continue;
            }
            let path = self.resolve_path(name, handle).await?;

            let adapter = handle.adapter().clone();
            let create_name = name.clone();
            handle
                .sequencer()
                .run(async move { adapter.create_category(&create_name, path.as_deref()).await })
                .await?;
            created.insert(name.as_str());
            info!("Created category {} on instance {}", name, handle.id());
        }
        Ok(true)
    }
}

/// Check a category path for existence and write access. Problems come
/// back as warnings: labeling keeps working even when file management
/// does not.
pub async fn validate_path(path: &Path) -> Vec<String> {
    let mut warnings = Vec::new();
    if path.as_os_str().is_empty() {
        return warnings;
    }

    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            if !metadata.is_dir() {
                warnings.push(format!("Path is not a directory: {}", path.display()));
            } else if metadata.permissions().readonly() {
                warnings.push(format!("Path is not writable: {}", path.display()));
            }
        }
        Err(_) => {
            warnings.push(format!("Path is not accessible: {}", path.display()));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::{MockAdapter, MockFactory};
    use crate::registry::InstanceRegistry;
    use seedhub_types::{BackendCategory, ClientKind, InstanceConfig};
    use std::time::Duration;

    async fn test_store() -> (tempfile::TempDir, CategoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("seedhub.db")).await.unwrap();
        let (event_tx, _) = broadcast::channel(64);
        let store = CategoryStore::load(storage, &[], event_tx).await.unwrap();
        (dir, store)
    }

    async fn test_handle(id: &str, adapter: Arc<MockAdapter>) -> Arc<InstanceHandle> {
        let factory = MockFactory::new();
        factory.insert(id, adapter);
        let (event_tx, _) = broadcast::channel(64);
        let registry = InstanceRegistry::new(
            Arc::new(factory),
            Duration::from_secs(30),
            event_tx,
        );
        registry
            .rebuild(&[InstanceConfig {
                id: id.to_string(),
                kind: ClientKind::QBittorrent,
                display_name: id.to_string(),
                host: "localhost".to_string(),
                port: 8080,
                credentials: None,
                enabled: true,
            }])
            .await
            .unwrap();
        registry.get(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_default_category_is_protected() {
        let (_dir, store) = test_store().await;

        assert!(store.get(DEFAULT_CATEGORY).await.is_some());
        assert!(store.delete(DEFAULT_CATEGORY).await.is_err());
        assert!(store.rename(DEFAULT_CATEGORY, "Other").await.is_err());
        assert!(store
            .edit(
                DEFAULT_CATEGORY,
                CategoryOptions {
                    priority: Some(5),
                    ..CategoryOptions::default()
                }
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_create_edit_delete_round_trip() {
        let (_dir, store) = test_store().await;

        store
            .create(
                "Movies",
                PathBuf::from("/data/movies"),
                CategoryOptions::default(),
            )
            .await
            .unwrap();
        assert!(store
            .create(
                "Movies",
                PathBuf::from("/elsewhere"),
                CategoryOptions::default()
            )
            .await
            .is_err());

        let edited = store
            .edit(
                "Movies",
                CategoryOptions {
                    priority: Some(3),
                    ..CategoryOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(edited.priority, 3);

        store.delete("Movies").await.unwrap();
        assert!(store.get("Movies").await.is_none());
    }

    #[tokio::test]
    async fn test_path_resolution_prefers_instance_mapping() {
        let (_dir, store) = test_store().await;

        let mut mappings = HashMap::new();
        mappings.insert("bt-1".to_string(), PathBuf::from("/data/movies"));
        store
            .create(
                "Movies",
                PathBuf::from("/movies"),
                CategoryOptions {
                    path_mappings: Some(mappings),
                    ..CategoryOptions::default()
                },
            )
            .await
            .unwrap();

        let bt1 = test_handle("bt-1", Arc::new(MockAdapter::new(ClientKind::QBittorrent))).await;
        let bt2 = test_handle("bt-2", Arc::new(MockAdapter::new(ClientKind::QBittorrent))).await;

        // Mapped instance resolves through the mapping, unmapped falls
        // back to the canonical path
        assert_eq!(
            store.resolve_path("Movies", &bt1).await.unwrap(),
            Some(PathBuf::from("/data/movies"))
        );
        assert_eq!(
            store.resolve_path("Movies", &bt2).await.unwrap(),
            Some(PathBuf::from("/movies"))
        );
        // Default resolves to "whatever the backend's default is"
        assert_eq!(store.resolve_path(DEFAULT_CATEGORY, &bt1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ensure_on_backend_is_idempotent() {
        let (_dir, store) = test_store().await;
        store
            .create("X", PathBuf::from("/data/x"), CategoryOptions::default())
            .await
            .unwrap();

        let adapter = Arc::new(MockAdapter::new(ClientKind::QBittorrent));
        adapter.backend_categories.lock().push(BackendCategory {
            name: "X".to_string(),
            path: None,
        });
        let handle = test_handle("bt-1", adapter.clone()).await;

        assert!(store.ensure_on_backend(&handle, "X").await.unwrap());
        assert!(store.ensure_on_backend(&handle, "X").await.unwrap());

        // Backend already had the category: linked both times, never
        // created
        assert!(adapter.created_categories.lock().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_batch_lists_backend_once() {
        let (_dir, store) = test_store().await;
        for name in ["A", "B", "C"] {
            store
                .create(name, PathBuf::from("/data"), CategoryOptions::default())
                .await
                .unwrap();
        }

        let adapter = Arc::new(MockAdapter::new(ClientKind::QBittorrent));
        adapter.backend_categories.lock().push(BackendCategory {
            name: "A".to_string(),
            path: None,
        });
        let handle = test_handle("bt-1", adapter.clone()).await;

        store
            .ensure_batch_on_backend(
                &handle,
                &["A".to_string(), "B".to_string(), "C".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(*adapter.list_category_calls.lock(), 1);
        assert_eq!(*adapter.created_categories.lock(), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_ensure_batch_creates_repeated_name_once() {
        let (_dir, store) = test_store().await;
        store
            .create("B", PathBuf::from("/data/b"), CategoryOptions::default())
            .await
            .unwrap();

        let adapter = Arc::new(MockAdapter::new(ClientKind::QBittorrent));
        let handle = test_handle("bt-1", adapter.clone()).await;

        store
            .ensure_batch_on_backend(&handle, &["B".to_string(), "B".to_string()])
            .await
            .unwrap();

        // The snapshot is taken once; a name repeated in the batch must
        // not be created twice against it
        assert_eq!(*adapter.created_categories.lock(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_backend_without_categories_is_noop() {
        let (_dir, store) = test_store().await;
        store
            .create("X", PathBuf::from("/data/x"), CategoryOptions::default())
            .await
            .unwrap();

        let mut adapter = MockAdapter::new(ClientKind::Ed2k);
        adapter.capabilities.categories = false;
        let adapter = Arc::new(adapter);
        let handle = test_handle("bt-1", adapter.clone()).await;

        assert!(!store.ensure_on_backend(&handle, "X").await.unwrap());
        assert!(adapter.created_categories.lock().is_empty());
    }
}
