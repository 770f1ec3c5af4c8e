//! Backend adapter contract
//!
//! Every client kind (ED2K-style or BitTorrent) is driven through this
//! trait, so the registry, category reconciler, move orchestrator and
//! aggregation loop stay backend-agnostic. Wire protocols live behind
//! implementations injected via [`AdapterFactory`]; nothing in this crate
//! speaks a native protocol.

use crate::error::SeedhubError;
use async_trait::async_trait;
use seedhub_types::{
    BackendCategory, ClientKind, DeleteOptions, DeleteOutcome, FetchHints, FetchedData,
    InstanceConfig, LabelOptions, SwarmBatch,
};
use std::path::Path;
use std::sync::Arc;

/// What a backend can natively do.
///
/// Typed capabilities replace runtime method probing: a backend that
/// lacks a capability still implements the method as a default no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterCapabilities {
    /// Backend has native category/label support
    pub categories: bool,
    /// Changing an item's category moves its files as a side effect;
    /// when false the orchestrator must issue an explicit move
    pub native_move: bool,
    /// Backend participates in swarms and can report trackers/peers
    pub swarm_metadata: bool,
}

/// Contract every backend implementation satisfies.
///
/// Calls against one instance are serialized by its request sequencer;
/// implementations do not need to be safe for concurrent in-flight
/// requests over a single session.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// The client kind this adapter drives
    fn kind(&self) -> ClientKind;

    /// Native capability flags for this backend
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    /// Establish the backend session. Idempotent: calling while already
    /// connected (or connecting) is a no-op.
    async fn connect(&self) -> Result<(), SeedhubError>;

    /// Close the backend session. Called when an instance is shut down
    /// during a registry rebuild; best-effort, errors are logged only.
    async fn disconnect(&self) -> Result<(), SeedhubError> {
        Ok(())
    }

    /// Fetch current downloads/uploads/shared files.
    ///
    /// Sections the backend does not support come back as empty
    /// collections; partial data is never an error.
    async fn fetch_data(&self, hints: &FetchHints) -> Result<FetchedData, SeedhubError>;

    /// Remove an item from the backend
    async fn delete_item(
        &self,
        hash: &str,
        options: &DeleteOptions,
    ) -> Result<DeleteOutcome, SeedhubError>;

    /// Assign a category/label and optionally a priority to an item
    async fn set_item_category(
        &self,
        hash: &str,
        options: &LabelOptions,
    ) -> Result<(), SeedhubError>;

    /// Explicitly relocate an item's files. Only called for backends
    /// whose capabilities report `native_move: false`.
    async fn move_item(&self, _hash: &str, _dest: &Path) -> Result<(), SeedhubError> {
        Ok(())
    }

    // ------------------------------------------------------------------
    // Category surface. `Ok(None)` means "no native category support";
    // the reconciler treats unsupported backends uniformly as no-ops.
    // ------------------------------------------------------------------

    async fn list_categories(&self) -> Result<Option<Vec<BackendCategory>>, SeedhubError> {
        Ok(None)
    }

    async fn create_category(
        &self,
        _name: &str,
        _path: Option<&Path>,
    ) -> Result<Option<()>, SeedhubError> {
        Ok(None)
    }

    async fn edit_category(
        &self,
        _name: &str,
        _path: Option<&Path>,
    ) -> Result<Option<()>, SeedhubError> {
        Ok(None)
    }

    async fn delete_category(&self, _name: &str) -> Result<Option<()>, SeedhubError> {
        Ok(None)
    }

    async fn rename_category(
        &self,
        _old_name: &str,
        _new_name: &str,
    ) -> Result<Option<()>, SeedhubError> {
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Swarm metadata extension points. Only meaningful for swarm-based
    // backends; the defaults keep non-swarm clients out of the cache.
    // ------------------------------------------------------------------

    /// Hashes worth refreshing tracker/peer data for
    async fn items_for_swarm_refresh(&self) -> Result<Vec<String>, SeedhubError> {
        Ok(Vec::new())
    }

    /// Fetch tracker/peer/source data for the given hashes
    async fn fetch_swarm_metadata(&self, _hashes: &[String]) -> Result<SwarmBatch, SeedhubError> {
        Ok(SwarmBatch::default())
    }
}

/// Builds adapters from instance configuration.
///
/// The registry never constructs concrete clients itself; the process
/// entry point injects a factory, which keeps wire-level implementations
/// and their dependencies out of the core.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, config: &InstanceConfig) -> Result<Arc<dyn BackendAdapter>, SeedhubError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-memory adapter used across the crate's tests.

    use super::*;
    use parking_lot::Mutex;
    use seedhub_types::DownloadItem;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// A backend double whose responses are set up per test
    pub struct MockAdapter {
        pub kind: ClientKind,
        pub capabilities: AdapterCapabilities,
        pub connect_results: Mutex<Vec<Result<(), SeedhubError>>>,
        pub items: Mutex<Vec<DownloadItem>>,
        pub fetch_error: Mutex<Option<String>>,
        pub fetch_calls: Mutex<u32>,
        pub backend_categories: Mutex<Vec<BackendCategory>>,
        pub created_categories: Mutex<Vec<String>>,
        pub edited_categories: Mutex<Vec<(String, Option<PathBuf>)>>,
        pub list_category_calls: Mutex<u32>,
        pub category_calls: Mutex<Vec<(String, LabelOptions)>>,
        pub set_category_error: Mutex<Option<String>>,
        pub move_calls: Mutex<Vec<(String, PathBuf)>>,
        pub swarm_items: Mutex<Vec<String>>,
        pub swarm_batches: Mutex<Vec<SwarmBatch>>,
        pub connect_count: Mutex<u32>,
    }

    impl MockAdapter {
        pub fn new(kind: ClientKind) -> Self {
            Self {
                kind,
                capabilities: AdapterCapabilities {
                    categories: true,
                    native_move: true,
                    swarm_metadata: true,
                },
                connect_results: Mutex::new(Vec::new()),
                items: Mutex::new(Vec::new()),
                fetch_error: Mutex::new(None),
                fetch_calls: Mutex::new(0),
                backend_categories: Mutex::new(Vec::new()),
                created_categories: Mutex::new(Vec::new()),
                edited_categories: Mutex::new(Vec::new()),
                list_category_calls: Mutex::new(0),
                category_calls: Mutex::new(Vec::new()),
                set_category_error: Mutex::new(None),
                move_calls: Mutex::new(Vec::new()),
                swarm_items: Mutex::new(Vec::new()),
                swarm_batches: Mutex::new(Vec::new()),
                connect_count: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl BackendAdapter for MockAdapter {
        fn kind(&self) -> ClientKind {
            self.kind
        }

        fn capabilities(&self) -> AdapterCapabilities {
            self.capabilities
        }

        async fn connect(&self) -> Result<(), SeedhubError> {
            *self.connect_count.lock() += 1;
            let mut scripted = self.connect_results.lock();
            if scripted.is_empty() {
                Ok(())
            } else {
                scripted.remove(0)
            }
        }

        async fn fetch_data(&self, hints: &FetchHints) -> Result<FetchedData, SeedhubError> {
            *self.fetch_calls.lock() += 1;
            if let Some(message) = self.fetch_error.lock().clone() {
                return Err(SeedhubError::Request(message));
            }
            let items = self.items.lock().clone();
            let downloads = match &hints.hashes {
                Some(hashes) => items
                    .into_iter()
                    .filter(|d| hashes.contains(&d.hash))
                    .collect(),
                None => items,
            };
            Ok(FetchedData {
                downloads,
                ..FetchedData::default()
            })
        }

        async fn delete_item(
            &self,
            hash: &str,
            _options: &DeleteOptions,
        ) -> Result<DeleteOutcome, SeedhubError> {
            self.items.lock().retain(|d| d.hash != hash);
            Ok(DeleteOutcome::default())
        }

        async fn set_item_category(
            &self,
            hash: &str,
            options: &LabelOptions,
        ) -> Result<(), SeedhubError> {
            if let Some(message) = self.set_category_error.lock().clone() {
                return Err(SeedhubError::Request(message));
            }
            self.category_calls
                .lock()
                .push((hash.to_string(), options.clone()));
            Ok(())
        }

        async fn move_item(&self, hash: &str, dest: &Path) -> Result<(), SeedhubError> {
            self.move_calls
                .lock()
                .push((hash.to_string(), dest.to_path_buf()));
            Ok(())
        }

        async fn list_categories(&self) -> Result<Option<Vec<BackendCategory>>, SeedhubError> {
            *self.list_category_calls.lock() += 1;
            if !self.capabilities.categories {
                return Ok(None);
            }
            Ok(Some(self.backend_categories.lock().clone()))
        }

        async fn create_category(
            &self,
            name: &str,
            path: Option<&Path>,
        ) -> Result<Option<()>, SeedhubError> {
            if !self.capabilities.categories {
                return Ok(None);
            }
            self.created_categories.lock().push(name.to_string());
            self.backend_categories.lock().push(BackendCategory {
                name: name.to_string(),
                path: path.map(Path::to_path_buf),
            });
            Ok(Some(()))
        }

        async fn edit_category(
            &self,
            name: &str,
            path: Option<&Path>,
        ) -> Result<Option<()>, SeedhubError> {
            if !self.capabilities.categories {
                return Ok(None);
            }
            self.edited_categories
                .lock()
                .push((name.to_string(), path.map(Path::to_path_buf)));
            for category in self.backend_categories.lock().iter_mut() {
                if category.name == name {
                    category.path = path.map(Path::to_path_buf);
                }
            }
            Ok(Some(()))
        }

        async fn delete_category(&self, name: &str) -> Result<Option<()>, SeedhubError> {
            if !self.capabilities.categories {
                return Ok(None);
            }
            self.backend_categories.lock().retain(|c| c.name != name);
            Ok(Some(()))
        }

        async fn rename_category(
            &self,
            old_name: &str,
            new_name: &str,
        ) -> Result<Option<()>, SeedhubError> {
            if !self.capabilities.categories {
                return Ok(None);
            }
            for category in self.backend_categories.lock().iter_mut() {
                if category.name == old_name {
                    category.name = new_name.to_string();
                }
            }
            Ok(Some(()))
        }

        async fn items_for_swarm_refresh(&self) -> Result<Vec<String>, SeedhubError> {
            Ok(self.swarm_items.lock().clone())
        }

        async fn fetch_swarm_metadata(
            &self,
            _hashes: &[String],
        ) -> Result<SwarmBatch, SeedhubError> {
            let mut scripted = self.swarm_batches.lock();
            if scripted.is_empty() {
                Ok(SwarmBatch::default())
            } else {
                Ok(scripted.remove(0))
            }
        }
    }

    /// Factory that hands out pre-built mock adapters keyed by instance id
    pub struct MockFactory {
        pub adapters: Mutex<HashMap<String, Arc<MockAdapter>>>,
    }

    impl MockFactory {
        pub fn new() -> Self {
            Self {
                adapters: Mutex::new(HashMap::new()),
            }
        }

        pub fn insert(&self, id: &str, adapter: Arc<MockAdapter>) {
            self.adapters.lock().insert(id.to_string(), adapter);
        }
    }

    impl AdapterFactory for MockFactory {
        fn build(&self, config: &InstanceConfig) -> Result<Arc<dyn BackendAdapter>, SeedhubError> {
            let adapter = self
                .adapters
                .lock()
                .get(&config.id)
                .cloned()
                .unwrap_or_else(|| Arc::new(MockAdapter::new(config.kind)));
            Ok(adapter)
        }
    }

    /// A minimal download item for tests
    pub fn test_item(hash: &str, name: &str) -> DownloadItem {
        DownloadItem {
            hash: hash.to_string(),
            instance_id: String::new(),
            name: name.to_string(),
            size: Some(1024),
            downloaded: 512,
            download_speed: 0,
            upload_speed: 0,
            status: seedhub_types::ItemStatus::Downloading,
            category: None,
            save_path: PathBuf::from("/downloads"),
            added_at: None,
        }
    }
}
