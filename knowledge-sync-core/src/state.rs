//! Sync State Store: the persisted record of what was last pushed.
//!
//! The state is a small JSON document keyed by collection directory name and then by
//! relative path. Both levels are `BTreeMap`s so the file stays key-sorted and easy to
//! diff. Writes go to a temporary file in the same directory which is then renamed
//! over the target, so a failed write leaves the previous state untouched.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

/// Current on-disk format version.
pub const STATE_VERSION: u32 = 1;

/// File name used when the configuration does not name a state file.
pub const DEFAULT_STATE_FILE: &str = ".knowledge-sync-state.json";

/// What was last pushed for one local document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub remote_id: String,
    pub fingerprint: String,
}

/// Records of one collection, plus the remote id the collection had when they were
/// written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionState {
    pub collection_id: String,
    #[serde(default)]
    pub documents: BTreeMap<String, SyncRecord>,
}

/// A superseded remote document still waiting to be removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDeletion {
    pub collection_id: String,
    pub remote_id: String,
}

/// An upload that was started but whose result is not recorded yet. Until it is
/// cleared, unclaimed documents with this name in the collection belong to the sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub collection_id: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub version: u32,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionState>,
    #[serde(default)]
    pub pending_deletions: Vec<PendingDeletion>,
    #[serde(default)]
    pub pending_uploads: Vec<PendingUpload>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            collections: BTreeMap::new(),
            pending_deletions: Vec::new(),
            pending_uploads: Vec::new(),
        }
    }
}

impl SyncState {
    pub fn collection(&self, collection: &str) -> Option<&CollectionState> {
        self.collections.get(collection)
    }

    pub fn record(&self, collection: &str, relative_path: &str) -> Option<&SyncRecord> {
        self.collections
            .get(collection)
            .and_then(|c| c.documents.get(relative_path))
    }

    /// Inserts or replaces a record, returning the one it replaced.
    pub fn upsert(
        &mut self,
        collection: &str,
        collection_id: &str,
        relative_path: &str,
        record: SyncRecord,
    ) -> Option<SyncRecord> {
        let entry = self
            .collections
            .entry(collection.to_string())
            .or_insert_with(|| CollectionState {
                collection_id: collection_id.to_string(),
                documents: BTreeMap::new(),
            });
        entry.collection_id = collection_id.to_string();
        entry.documents.insert(relative_path.to_string(), record)
    }

    /// Removes a record. A collection left without records is dropped as well.
    pub fn remove(&mut self, collection: &str, relative_path: &str) -> Option<SyncRecord> {
        let entry = self.collections.get_mut(collection)?;
        let removed = entry.documents.remove(relative_path);
        if entry.documents.is_empty() {
            self.collections.remove(collection);
        }
        removed
    }

    /// Points an existing collection at a new remote id.
    pub fn set_collection_id(&mut self, collection: &str, collection_id: &str) {
        if let Some(entry) = self.collections.get_mut(collection) {
            entry.collection_id = collection_id.to_string();
        }
    }

    /// Whether any record still points at `remote_id`.
    pub fn references(&self, remote_id: &str) -> bool {
        self.collections
            .values()
            .flat_map(|c| c.documents.values())
            .any(|r| r.remote_id == remote_id)
    }

    /// Every remote id any record points at, across all collections.
    pub fn claimed_ids(&self) -> HashSet<&str> {
        self.collections
            .values()
            .flat_map(|c| c.documents.values())
            .map(|r| r.remote_id.as_str())
            .collect()
    }

    /// Records an upload intent. Returns false when it was already there.
    pub fn add_pending_upload(&mut self, collection_id: &str, file_name: &str) -> bool {
        if self.is_upload_pending(collection_id, file_name) {
            return false;
        }
        self.pending_uploads.push(PendingUpload {
            collection_id: collection_id.to_string(),
            file_name: file_name.to_string(),
        });
        true
    }

    pub fn clear_pending_upload(&mut self, collection_id: &str, file_name: &str) {
        self.pending_uploads
            .retain(|p| p.collection_id != collection_id || p.file_name != file_name);
    }

    pub fn is_upload_pending(&self, collection_id: &str, file_name: &str) -> bool {
        self.pending_uploads
            .iter()
            .any(|p| p.collection_id == collection_id && p.file_name == file_name)
    }

    pub fn pending_upload_names(&self, collection_id: &str) -> HashSet<&str> {
        self.pending_uploads
            .iter()
            .filter(|p| p.collection_id == collection_id)
            .map(|p| p.file_name.as_str())
            .collect()
    }

    pub fn document_count(&self) -> usize {
        self.collections.values().map(|c| c.documents.len()).sum()
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    /// The state file exists but cannot be trusted. Resolve by hand before syncing.
    #[error("sync state {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to write sync state {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Loads and atomically saves the [`SyncState`] at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the state. A missing file is an empty state; anything unreadable is
    /// [`StateError::Corrupt`].
    pub fn load(&self) -> Result<SyncState, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No sync state yet, starting empty");
                return Ok(SyncState::default());
            }
            Err(e) => {
                return Err(StateError::Corrupt {
                    path: self.path.clone(),
                    reason: format!("unreadable: {e}"),
                })
            }
        };

        let state: SyncState =
            serde_json::from_str(&content).map_err(|e| StateError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if state.version != STATE_VERSION {
            return Err(StateError::Corrupt {
                path: self.path.clone(),
                reason: format!(
                    "unsupported version {} (expected {STATE_VERSION})",
                    state.version
                ),
            });
        }

        info!(
            path = %self.path.display(),
            collections = state.collections.len(),
            documents = state.document_count(),
            pending_deletions = state.pending_deletions.len(),
            pending_uploads = state.pending_uploads.len(),
            "Loaded sync state"
        );
        Ok(state)
    }

    /// Writes the state via a temp file and an atomic rename.
    pub fn save(&self, state: &SyncState) -> Result<(), StateError> {
        self.write_atomically(state).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), documents = state.document_count(), "Saved sync state");
        Ok(())
    }

    fn write_atomically(&self, state: &SyncState) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, state)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
