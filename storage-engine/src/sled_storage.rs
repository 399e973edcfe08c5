use async_trait::async_trait;
use persister::AsyncStorage;
use shared::{Error, Result};
use std::fmt::Debug;
use std::path::Path;
use tracing::debug;

/// Sled-backed storage for persisted snapshots
pub struct SledStorage {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledStorage {
    const DEFAULT_TREE: &str = "persisted_clients";

    /// Open (or create) a Sled database at `path`
    /// Creates the parent directory if it doesn't exist
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_tree(path, Self::DEFAULT_TREE)
    }

    /// Open a Sled database and keep snapshots in the named tree
    pub fn with_tree(path: impl AsRef<Path>, tree: &str) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }

        let db = sled::open(path.as_ref())
            .map_err(|e| Error::Storage(format!("Failed to open Sled database: {}", e)))?;
        let tree = db
            .open_tree(tree)
            .map_err(|e| Error::Storage(format!("Failed to open tree '{}': {}", tree, e)))?;

        debug!("Opened Sled storage at {}", path.as_ref().display());
        Ok(Self { db, tree })
    }

    fn flush(&self) -> Result<()> {
        self.tree
            .flush()
            .map_err(|e| Error::Storage(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl AsyncStorage for SledStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .tree
            .get(key.as_bytes())
            .map_err(|e| Error::Storage(format!("Failed to read '{}': {}", key, e)))?;

        match value {
            Some(bytes) => {
                let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    Error::Storage(format!("Stored value for '{}' is not UTF-8: {}", key, e))
                })?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> Result<()> {
        self.tree
            .insert(key.as_bytes(), value.into_bytes())
            .map_err(|e| Error::Storage(format!("Failed to write '{}': {}", key, e)))?;

        self.flush()
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.tree
            .remove(key.as_bytes())
            .map_err(|e| Error::Storage(format!("Failed to delete '{}': {}", key, e)))?;

        self.flush()
    }
}

impl Debug for SledStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStorage")
            .field("tree", &String::from_utf8_lossy(&self.tree.name()))
            .field("size_on_disk", &self.db.size_on_disk().ok())
            .finish()
    }
}
