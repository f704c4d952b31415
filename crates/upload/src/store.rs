//! Persistence of in-progress upload sessions.
//!
//! The engine writes the session token before the first chunk is sent so a
//! crashed upload can resume. The pending-upload queue itself belongs to the
//! application; the store only exposes the hooks the engine needs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

/// A session persisted for a pending upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub token: String,
    pub upload_host: String,
    pub expected_size: u64,
    pub chunk_size: u64,
    pub created_at: DateTime<Utc>,
}

impl StoredSession {
    /// Returns `true` while the session is younger than `ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.created_at) < ttl,
            Err(_) => true,
        }
    }
}

/// Storage of pending-upload sessions, keyed by file id.
pub trait PendingUploadStore: Send + Sync {
    fn load_session(&self, file_id: &str) -> Result<Option<StoredSession>, StoreError>;

    fn save_session(&self, file_id: &str, session: &StoredSession) -> Result<(), StoreError>;

    /// Forgets the session token; the pending record stays queued.
    fn clear_session(&self, file_id: &str) -> Result<(), StoreError>;

    /// Drops the whole pending record; the file will not be retried.
    fn discard_record(&self, file_id: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryPendingStore
// ---------------------------------------------------------------------------

/// In-memory store, for tests and short-lived processes.
#[derive(Debug, Default)]
pub struct MemoryPendingStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    sessions: HashMap<String, StoredSession>,
    discarded: HashSet<String>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the record of `file_id` was discarded.
    pub fn is_discarded(&self, file_id: &str) -> bool {
        self.lock().discarded.contains(file_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PendingUploadStore for MemoryPendingStore {
    fn load_session(&self, file_id: &str) -> Result<Option<StoredSession>, StoreError> {
        Ok(self.lock().sessions.get(file_id).cloned())
    }

    fn save_session(&self, file_id: &str, session: &StoredSession) -> Result<(), StoreError> {
        self.lock()
            .sessions
            .insert(file_id.to_string(), session.clone());
        Ok(())
    }

    fn clear_session(&self, file_id: &str) -> Result<(), StoreError> {
        self.lock().sessions.remove(file_id);
        Ok(())
    }

    fn discard_record(&self, file_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.sessions.remove(file_id);
        inner.discarded.insert(file_id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFilePendingStore
// ---------------------------------------------------------------------------

/// Sessions cached in memory and persisted to a JSON file.
pub struct JsonFilePendingStore {
    path: PathBuf,
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl JsonFilePendingStore {
    /// Opens the store, loading existing sessions from disk.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let sessions = load_sessions(&path)?;
        Ok(Self {
            path,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn file_ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let map = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let json = serde_json::to_string_pretty(&*map)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        debug!("persisted {} session(s) to {:?}", map.len(), self.path);
        Ok(())
    }

    fn update(
        &self,
        f: impl FnOnce(&mut HashMap<String, StoredSession>),
    ) -> Result<(), StoreError> {
        {
            let mut map = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut map);
        }
        self.persist()
    }
}

impl PendingUploadStore for JsonFilePendingStore {
    fn load_session(&self, file_id: &str) -> Result<Option<StoredSession>, StoreError> {
        Ok(self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(file_id)
            .cloned())
    }

    fn save_session(&self, file_id: &str, session: &StoredSession) -> Result<(), StoreError> {
        self.update(|map| {
            map.insert(file_id.to_string(), session.clone());
        })
    }

    fn clear_session(&self, file_id: &str) -> Result<(), StoreError> {
        self.update(|map| {
            map.remove(file_id);
        })
    }

    fn discard_record(&self, file_id: &str) -> Result<(), StoreError> {
        self.clear_session(file_id)
    }
}

fn load_sessions(path: &Path) -> Result<HashMap<String, StoredSession>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let sessions: HashMap<String, StoredSession> = serde_json::from_str(&data)?;
    debug!("loaded {} session(s) from {:?}", sessions.len(), path);
    Ok(sessions)
}
