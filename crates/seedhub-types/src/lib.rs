//! Shared types for Seedhub
//!
//! This crate contains the data model shared between the core control
//! plane and its consumers (UIs, automation, tests): client instances,
//! categories, transfer items, move operations, history and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Instance Types
// ============================================================================

/// The kind of download client behind an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Ed2k,
    QBittorrent,
    Deluge,
    Transmission,
}

impl ClientKind {
    /// Stable key used for type-level category path-mapping fallback
    /// (single-instance-per-type deployments map paths by kind).
    pub fn type_key(&self) -> &'static str {
        match self {
            ClientKind::Ed2k => "ed2k",
            ClientKind::QBittorrent => "qbittorrent",
            ClientKind::Deluge => "deluge",
            ClientKind::Transmission => "transmission",
        }
    }
}

/// Connection lifecycle of one backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    #[serde(rename = "reconnect-scheduled")]
    ReconnectScheduled,
}

/// Login credentials for a backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Configuration for one backend instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub kind: ClientKind,
    pub display_name: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Runtime view of a configured instance.
///
/// Owned by the registry; the whole set is rebuilt on configuration
/// reload rather than mutated field-by-field across reload boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInstance {
    pub id: String,
    pub kind: ClientKind,
    pub display_name: String,
    pub enabled: bool,
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Category Types
// ============================================================================

/// Name of the category that always exists and cannot be deleted or renamed
pub const DEFAULT_CATEGORY: &str = "Default";

/// A canonical category shared across all backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    /// Unique name, the primary key
    pub name: String,
    /// Canonical path as seen by the app
    pub path: PathBuf,
    pub color: String,
    pub priority: i32,
    /// Per-instance (or per-kind) path overrides for backends that see a
    /// different filesystem namespace than the app (e.g. containers)
    #[serde(default)]
    pub path_mappings: HashMap<String, PathBuf>,
}

impl Category {
    pub fn new(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            color: "#3b82f6".to_string(), // Default blue
            priority: 0,
            path_mappings: HashMap::new(),
        }
    }

    /// The built-in category. Its per-backend path is always whatever the
    /// backend's own configured default is, so the canonical path is empty.
    pub fn default_category() -> Self {
        Self {
            name: DEFAULT_CATEGORY.to_string(),
            path: PathBuf::new(),
            color: "#6b7280".to_string(),
            priority: 0,
            path_mappings: HashMap::new(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_CATEGORY
    }
}

/// Options for editing a category; `None` fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryOptions {
    pub path: Option<PathBuf>,
    pub color: Option<String>,
    pub priority: Option<i32>,
    pub path_mappings: Option<HashMap<String, PathBuf>>,
}

/// A category as reported by a backend's native category/label support
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCategory {
    pub name: String,
    pub path: Option<PathBuf>,
}

// ============================================================================
// Transfer Item Types
// ============================================================================

/// Status of a transfer item on its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
}

/// One download as reported by a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub hash: String,
    /// Origin instance; filled in by the aggregation loop
    #[serde(default)]
    pub instance_id: String,
    pub name: String,
    pub size: Option<u64>,
    pub downloaded: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub status: ItemStatus,
    pub category: Option<String>,
    pub save_path: PathBuf,
    pub added_at: Option<DateTime<Utc>>,
}

impl DownloadItem {
    pub fn progress(&self) -> f64 {
        match self.size {
            Some(size) if size > 0 => (self.downloaded as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }
}

/// One active upload slot as reported by a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    pub hash: String,
    #[serde(default)]
    pub instance_id: String,
    pub name: String,
    pub size: Option<u64>,
    pub uploaded: u64,
    pub upload_speed: u64,
    pub peer: Option<String>,
}

/// One shared file as reported by a backend (ED2K-style clients)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFile {
    pub hash: String,
    #[serde(default)]
    pub instance_id: String,
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
    pub upload_total: u64,
}

/// Everything one backend reports in a single fetch.
///
/// Sections a backend does not support come back empty, never as errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchedData {
    pub downloads: Vec<DownloadItem>,
    pub uploads: Vec<TransferItem>,
    pub shared_files: Vec<SharedFile>,
}

/// Hints to narrow a fetch to specific items
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchHints {
    pub hashes: Option<Vec<String>>,
}

/// Options for deleting an item from a backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub delete_files: bool,
    pub is_shared: bool,
    pub file_path: Option<PathBuf>,
}

/// Outcome of a delete; some backends cannot remove files themselves and
/// instead hand back the paths the caller should delete
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub paths_to_delete: Vec<PathBuf>,
}

/// Options for assigning a category/label to an item
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelOptions {
    pub category: Option<String>,
    pub priority: Option<i32>,
}

// ============================================================================
// Swarm Metadata Types
// ============================================================================

/// Tracker status for one announce URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerStatus {
    pub url: String,
    pub status: String,
    pub message: Option<String>,
}

/// One connected peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: String,
    pub client: Option<String>,
    pub progress: f64,
    pub download_speed: u64,
    pub upload_speed: u64,
}

/// An incremental source-name slot keyed by the backend's numeric index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSlot {
    pub index: u32,
    pub name: String,
}

/// Incremental swarm update for one item hash
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmUpdate {
    pub trackers: Vec<TrackerStatus>,
    pub peers: Vec<PeerInfo>,
    pub sources: Vec<SourceSlot>,
}

/// Swarm metadata for a batch of items, keyed by item hash
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmBatch {
    pub updates: HashMap<String, SwarmUpdate>,
}

/// Cached swarm metadata for one item.
///
/// Ephemeral and fully reconstructable from the backend; `sources` keeps
/// the merge-by-index view of incremental source-name payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEntry {
    pub hash: String,
    pub trackers: Vec<TrackerStatus>,
    pub peers: Vec<PeerInfo>,
    pub sources: BTreeMap<u32, String>,
    pub last_updated: DateTime<Utc>,
}

// ============================================================================
// Move Operation Types
// ============================================================================

/// Status of a move operation. Transitions are monotonic: an operation
/// never regresses from a later state back to an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveStatus {
    Pending,
    #[serde(rename = "in-progress")]
    InProgress,
    Completed,
    Failed,
}

impl MoveStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MoveStatus::Completed | MoveStatus::Failed)
    }
}

/// A durable record of a file relocation triggered by a category change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveOperation {
    pub id: Uuid,
    pub file_hash: String,
    pub instance_id: String,
    pub source_category: String,
    pub dest_category: String,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub status: MoveStatus,
    /// Per-file outcome for multi-file items, keyed by relative path
    #[serde(default)]
    pub per_file_status: HashMap<String, String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MoveOperation {
    pub fn new(
        file_hash: String,
        instance_id: String,
        source_category: String,
        dest_category: String,
        source_path: PathBuf,
        dest_path: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            file_hash,
            instance_id,
            source_category,
            dest_category,
            source_path,
            dest_path,
            status: MoveStatus::Pending,
            per_file_status: HashMap::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// History Types
// ============================================================================

/// Status of a history row. Absence of an item from its backend is
/// recorded here, never by dropping the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Downloading,
    Completed,
    Missing,
    Deleted,
}

/// A durable record of a download having existed on an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub hash: String,
    pub instance_id: String,
    pub name: String,
    pub size: Option<u64>,
    pub status: HistoryStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Snapshot & Event Types
// ============================================================================

/// Per-instance status included in every snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub id: String,
    pub kind: ClientKind,
    pub display_name: String,
    pub enabled: bool,
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    /// Outstanding sequenced requests, for diagnostics
    pub pending_requests: usize,
    /// Error from this instance's fetch in the current tick, if any.
    /// Other instances' data is still delivered when this is set.
    pub last_fetch_error: Option<String>,
}

/// One merged view of all enabled instances, broadcast each tick
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub downloads: Vec<DownloadItem>,
    pub uploads: Vec<TransferItem>,
    pub shared_files: Vec<SharedFile>,
    #[serde(default)]
    pub instances: Vec<InstanceStatus>,
}

/// Events emitted by the core to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    SnapshotReady {
        snapshot: Snapshot,
    },
    InstanceStateChanged {
        id: String,
        state: ConnectionState,
        error: Option<String>,
    },
    CategoryCreated {
        category: Category,
    },
    CategoryUpdated {
        category: Category,
    },
    CategoryRemoved {
        name: String,
    },
    MoveStatusChanged {
        operation: MoveOperation,
    },
    Error {
        message: String,
        context: Option<String>,
    },
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Category definition as it appears in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub path: PathBuf,
    pub color: Option<String>,
    pub priority: Option<i32>,
    #[serde(default)]
    pub path_mappings: HashMap<String, PathBuf>,
}

/// Top-level configuration consumed from an external loader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedhubConfig {
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub categories: Vec<CategoryConfig>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_swarm_refresh")]
    pub swarm_refresh_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_swarm_refresh() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    30
}

impl Default for SeedhubConfig {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            categories: Vec::new(),
            poll_interval_secs: default_poll_interval(),
            swarm_refresh_secs: default_swarm_refresh(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}
