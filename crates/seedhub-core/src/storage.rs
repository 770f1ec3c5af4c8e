//! SQLite-based persistence for categories, move operations and history
//!
//! Move operations are written before any filesystem or backend action
//! so that a crash never leaves move state only in memory. History rows
//! are never deleted; absence is recorded as a status change.

use crate::error::SeedhubError;
use seedhub_types::{Category, HistoryEntry, HistoryStatus, MoveOperation, MoveStatus};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Database connection pool for Seedhub's durable state
#[derive(Clone, Debug)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (and migrate) the database at the given path
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, SeedhubError> {
        let path = db_path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                name TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                color TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                path_mappings TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS move_operations (
                id TEXT PRIMARY KEY,
                file_hash TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                source_category TEXT NOT NULL,
                dest_category TEXT NOT NULL,
                source_path TEXT NOT NULL,
                dest_path TEXT NOT NULL,
                status TEXT NOT NULL,
                per_file_status TEXT NOT NULL DEFAULT '{}',
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS history (
                hash TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                name TEXT NOT NULL,
                size INTEGER,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                PRIMARY KEY (hash, instance_id)
            );

            CREATE INDEX IF NOT EXISTS idx_moves_status ON move_operations(status);
            CREATE INDEX IF NOT EXISTS idx_history_status ON history(status);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    // ========================================================================
    // Categories
    // ========================================================================

    /// Load all categories
    pub async fn load_categories(&self) -> Result<Vec<Category>, SeedhubError> {
        let rows = sqlx::query("SELECT * FROM categories ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_category).collect()
    }

    /// Save or update a category
    pub async fn save_category(&self, category: &Category) -> Result<(), SeedhubError> {
        let mappings = serde_json::to_string(&category.path_mappings)
            .map_err(|e| SeedhubError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO categories (name, path, color, priority, path_mappings)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                path = excluded.path,
                color = excluded.color,
                priority = excluded.priority,
                path_mappings = excluded.path_mappings
            "#,
        )
        .bind(&category.name)
        .bind(category.path.to_string_lossy().to_string())
        .bind(&category.color)
        .bind(category.priority)
        .bind(mappings)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a category by name
    pub async fn delete_category(&self, name: &str) -> Result<(), SeedhubError> {
        sqlx::query("DELETE FROM categories WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Rename a category, keeping its row
    pub async fn rename_category(&self, old_name: &str, new_name: &str) -> Result<(), SeedhubError> {
        sqlx::query("UPDATE categories SET name = ? WHERE name = ?")
            .bind(new_name)
            .bind(old_name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========================================================================
    // Move Operations
    // ========================================================================

    /// Save or update a move operation
    pub async fn save_move(&self, operation: &MoveOperation) -> Result<(), SeedhubError> {
        let per_file = serde_json::to_string(&operation.per_file_status)
            .map_err(|e| SeedhubError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO move_operations (
                id, file_hash, instance_id, source_category, dest_category,
                source_path, dest_path, status, per_file_status, error,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                per_file_status = excluded.per_file_status,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(operation.id.to_string())
        .bind(&operation.file_hash)
        .bind(&operation.instance_id)
        .bind(&operation.source_category)
        .bind(&operation.dest_category)
        .bind(operation.source_path.to_string_lossy().to_string())
        .bind(operation.dest_path.to_string_lossy().to_string())
        .bind(move_status_to_str(operation.status))
        .bind(per_file)
        .bind(operation.error.as_ref())
        .bind(operation.created_at.to_rfc3339())
        .bind(operation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load a move operation by id
    pub async fn load_move(&self, id: Uuid) -> Result<Option<MoveOperation>, SeedhubError> {
        let row = sqlx::query("SELECT * FROM move_operations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_move).transpose()
    }

    /// Load all non-terminal move operations, for the recovery scan
    pub async fn load_unfinished_moves(&self) -> Result<Vec<MoveOperation>, SeedhubError> {
        let rows = sqlx::query(
            "SELECT * FROM move_operations WHERE status IN ('pending', 'in-progress') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_move).collect()
    }

    /// Load move operations in a given status
    pub async fn load_moves_by_status(
        &self,
        status: MoveStatus,
    ) -> Result<Vec<MoveOperation>, SeedhubError> {
        let rows = sqlx::query("SELECT * FROM move_operations WHERE status = ? ORDER BY created_at")
            .bind(move_status_to_str(status))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_move).collect()
    }

    /// Remove terminal move operations older than the cutoff, keeping the
    /// table from growing forever. Non-terminal rows are never touched.
    pub async fn prune_finished_moves(
        &self,
        before: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, SeedhubError> {
        let result = sqlx::query(
            "DELETE FROM move_operations WHERE status IN ('completed', 'failed') AND updated_at < ?",
        )
        .bind(before.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Insert or refresh a history row. `started_at` is written once on
    /// insert and preserved on subsequent updates.
    pub async fn upsert_history(&self, entry: &HistoryEntry) -> Result<(), SeedhubError> {
        sqlx::query(
            r#"
            INSERT INTO history (hash, instance_id, name, size, status, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(hash, instance_id) DO UPDATE SET
                name = excluded.name,
                size = excluded.size,
                status = excluded.status,
                completed_at = COALESCE(completed_at, excluded.completed_at)
            "#,
        )
        .bind(&entry.hash)
        .bind(&entry.instance_id)
        .bind(&entry.name)
        .bind(entry.size.map(|s| s as i64))
        .bind(history_status_to_str(entry.status))
        .bind(entry.started_at.to_rfc3339())
        .bind(entry.completed_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load history rows for one instance
    pub async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEntry>, SeedhubError> {
        let rows = sqlx::query(
            "SELECT * FROM history WHERE instance_id = ? ORDER BY started_at DESC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_history).collect()
    }

    /// Mark rows of an instance whose hash is absent from `present_hashes`
    /// as missing. Rows already missing or deleted are left alone.
    pub async fn mark_history_missing(
        &self,
        instance_id: &str,
        present_hashes: &[String],
    ) -> Result<u64, SeedhubError> {
        let result = if present_hashes.is_empty() {
            sqlx::query(
                "UPDATE history SET status = 'missing' WHERE instance_id = ? AND status NOT IN ('missing', 'deleted')",
            )
            .bind(instance_id)
            .execute(&self.pool)
            .await?
        } else {
            // Build placeholders for the NOT IN clause
            let placeholders = present_hashes
                .iter()
                .map(|_| "?")
                .collect::<Vec<_>>()
                .join(",");
            let query = format!(
                "UPDATE history SET status = 'missing' WHERE instance_id = ? AND status NOT IN ('missing', 'deleted') AND hash NOT IN ({})",
                placeholders
            );

            let mut update = sqlx::query(&query).bind(instance_id);
            for hash in present_hashes {
                update = update.bind(hash);
            }
            update.execute(&self.pool).await?
        };

        Ok(result.rows_affected())
    }

    /// Record an explicit delete of an item
    pub async fn mark_history_deleted(
        &self,
        hash: &str,
        instance_id: &str,
    ) -> Result<(), SeedhubError> {
        sqlx::query("UPDATE history SET status = 'deleted' WHERE hash = ? AND instance_id = ?")
            .bind(hash)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn move_status_to_str(status: MoveStatus) -> &'static str {
    match status {
        MoveStatus::Pending => "pending",
        MoveStatus::InProgress => "in-progress",
        MoveStatus::Completed => "completed",
        MoveStatus::Failed => "failed",
    }
}

fn move_status_from_str(s: &str) -> MoveStatus {
    match s {
        "in-progress" => MoveStatus::InProgress,
        "completed" => MoveStatus::Completed,
        "failed" => MoveStatus::Failed,
        _ => MoveStatus::Pending,
    }
}

fn history_status_to_str(status: HistoryStatus) -> &'static str {
    match status {
        HistoryStatus::Downloading => "downloading",
        HistoryStatus::Completed => "completed",
        HistoryStatus::Missing => "missing",
        HistoryStatus::Deleted => "deleted",
    }
}

fn history_status_from_str(s: &str) -> HistoryStatus {
    match s {
        "completed" => HistoryStatus::Completed,
        "missing" => HistoryStatus::Missing,
        "deleted" => HistoryStatus::Deleted,
        _ => HistoryStatus::Downloading,
    }
}

/// Convert a database row to a Category
fn row_to_category(row: sqlx::sqlite::SqliteRow) -> Result<Category, SeedhubError> {
    let mappings: HashMap<String, PathBuf> =
        serde_json::from_str(row.get::<String, _>("path_mappings").as_str())
            .map_err(|e| SeedhubError::Serialization(e.to_string()))?;

    Ok(Category {
        name: row.get("name"),
        path: PathBuf::from(row.get::<String, _>("path")),
        color: row.get("color"),
        priority: row.get::<i64, _>("priority") as i32,
        path_mappings: mappings,
    })
}

/// Convert a database row to a MoveOperation
fn row_to_move(row: sqlx::sqlite::SqliteRow) -> Result<MoveOperation, SeedhubError> {
    use chrono::{DateTime, Utc};

    let per_file: HashMap<String, String> =
        serde_json::from_str(row.get::<String, _>("per_file_status").as_str())
            .map_err(|e| SeedhubError::Serialization(e.to_string()))?;

    Ok(MoveOperation {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())
            .map_err(|e| SeedhubError::Serialization(e.to_string()))?,
        file_hash: row.get("file_hash"),
        instance_id: row.get("instance_id"),
        source_category: row.get("source_category"),
        dest_category: row.get("dest_category"),
        source_path: PathBuf::from(row.get::<String, _>("source_path")),
        dest_path: PathBuf::from(row.get::<String, _>("dest_path")),
        status: move_status_from_str(row.get::<String, _>("status").as_str()),
        per_file_status: per_file,
        error: row.get("error"),
        created_at: DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())
            .map_err(|e| SeedhubError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(row.get::<String, _>("updated_at").as_str())
            .map_err(|e| SeedhubError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
    })
}

/// Convert a database row to a HistoryEntry
fn row_to_history(row: sqlx::sqlite::SqliteRow) -> Result<HistoryEntry, SeedhubError> {
    use chrono::{DateTime, Utc};

    Ok(HistoryEntry {
        hash: row.get("hash"),
        instance_id: row.get("instance_id"),
        name: row.get("name"),
        size: row.get::<Option<i64>, _>("size").map(|s| s as u64),
        status: history_status_from_str(row.get::<String, _>("status").as_str()),
        started_at: DateTime::parse_from_rfc3339(row.get::<String, _>("started_at").as_str())
            .map_err(|e| SeedhubError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn test_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("seedhub.db")).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_category_round_trip() {
        let (_dir, storage) = test_storage().await;

        let mut category = Category::new("Movies".to_string(), PathBuf::from("/data/movies"));
        category
            .path_mappings
            .insert("bt-1".to_string(), PathBuf::from("/downloads/movies"));
        storage.save_category(&category).await.unwrap();

        let loaded = storage.load_categories().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Movies");
        assert_eq!(
            loaded[0].path_mappings.get("bt-1"),
            Some(&PathBuf::from("/downloads/movies"))
        );

        storage.delete_category("Movies").await.unwrap();
        assert!(storage.load_categories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unfinished_move_scan_skips_terminal_rows() {
        let (_dir, storage) = test_storage().await;

        let mut pending = MoveOperation::new(
            "abc".to_string(),
            "bt-1".to_string(),
            "Default".to_string(),
            "Movies".to_string(),
            PathBuf::from("/downloads"),
            PathBuf::from("/data/movies"),
        );
        storage.save_move(&pending).await.unwrap();

        let mut done = MoveOperation::new(
            "def".to_string(),
            "bt-1".to_string(),
            "Default".to_string(),
            "Movies".to_string(),
            PathBuf::from("/downloads"),
            PathBuf::from("/data/movies"),
        );
        done.status = MoveStatus::Completed;
        storage.save_move(&done).await.unwrap();

        let unfinished = storage.load_unfinished_moves().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].file_hash, "abc");

        pending.status = MoveStatus::InProgress;
        storage.save_move(&pending).await.unwrap();
        let unfinished = storage.load_unfinished_moves().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].status, MoveStatus::InProgress);
    }

    #[tokio::test]
    async fn test_history_missing_marking_preserves_rows() {
        let (_dir, storage) = test_storage().await;

        for hash in ["h1", "h2", "h3"] {
            storage
                .upsert_history(&HistoryEntry {
                    hash: hash.to_string(),
                    instance_id: "bt-1".to_string(),
                    name: format!("file-{}", hash),
                    size: Some(100),
                    status: HistoryStatus::Downloading,
                    started_at: Utc::now(),
                    completed_at: None,
                })
                .await
                .unwrap();
        }

        let changed = storage
            .mark_history_missing("bt-1", &["h1".to_string()])
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let rows = storage.load_history("bt-1").await.unwrap();
        assert_eq!(rows.len(), 3);
        let missing: Vec<_> = rows
            .iter()
            .filter(|r| r.status == HistoryStatus::Missing)
            .map(|r| r.hash.as_str())
            .collect();
        assert_eq!(missing.len(), 2);
        assert!(!missing.contains(&"h1"));
    }
}
