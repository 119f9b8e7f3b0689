//! Persistence for sticky sessions
//!
//! A `SessionStore` is a small string key-value store, the moral equivalent
//! of a tab's `sessionStorage`. Two implementations are provided: an
//! in-memory map (the default, lives as long as the process) and a sled
//! tree for persistence across restarts.

use crate::error::Result;
use parking_lot::Mutex;
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Name of the sled tree holding replay state
const REPLAY_TREE: &str = "replay";

/// String key-value store for session metadata
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory session store
#[derive(Debug, Default, Clone)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Session store backed by a sled embedded database
pub struct SledSessionStore {
    db: Arc<Db>,
    tree: Tree,
}

impl SledSessionStore {
    /// Open (or create) the database at `db_path`
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let db = sled::open(db_path)?;
        let tree = db.open_tree(REPLAY_TREE)?;

        Ok(Self {
            db: Arc::new(db),
            tree,
        })
    }

    /// Default database location in the user's data directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("reel").join("sessions"))
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

impl SessionStore for SledSessionStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.tree.get(key.as_bytes())?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        tracing::debug!("Persisted {} to sled", key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }
}
