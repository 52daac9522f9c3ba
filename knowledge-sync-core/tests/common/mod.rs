#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use knowledge_sync_core::config::{RetryPolicy, SynchroniseConfig};
use knowledge_sync_core::contract::{
    DeleteOutcome, KnowledgeClient, RemoteCollection, RemoteDocument, RemoteError,
};
use knowledge_sync_core::scan::fingerprint_bytes;

/// Where a simulated crash happens relative to the remote effect of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangMode {
    /// The request never reaches the service.
    BeforeEffect,
    /// The service applies the request but the response never arrives.
    AfterEffect,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    id: String,
    file_name: String,
    hash: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub list_collections: usize,
    pub create_collection: usize,
    pub list_documents: usize,
    pub upload: usize,
    pub delete: usize,
    pub get_document: usize,
}

#[derive(Default)]
struct Inner {
    collections: Vec<RemoteCollection>,
    documents: BTreeMap<String, Vec<StoredDocument>>,
    next_id: usize,
    calls: Calls,
    mutations: usize,
    hang: Option<(usize, HangMode)>,
    failing_uploads: HashSet<String>,
    lose_response_once: HashSet<String>,
    unavailable: bool,
}

/// In-memory knowledge service. Uploads are counted only when they take effect.
#[derive(Default)]
pub struct FakeKnowledge {
    inner: Mutex<Inner>,
    report_hashes: bool,
}

enum Gate {
    Proceed,
    HangNow,
    HangAfter,
}

impl FakeKnowledge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`FakeKnowledge::new`], but listings carry each document's SHA-256.
    pub fn with_hashes() -> Self {
        Self {
            report_hashes: true,
            ..Self::default()
        }
    }

    /// Every mutation after the first `completed` ones hangs forever.
    pub fn hang_after(&self, completed: usize, mode: HangMode) {
        let mut inner = self.inner.lock().unwrap();
        inner.mutations = 0;
        inner.hang = Some((completed, mode));
    }

    pub fn disarm(&self) {
        self.inner.lock().unwrap().hang = None;
    }

    /// Uploads of `file_name` always fail with a transient error.
    pub fn fail_uploads_of(&self, file_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_uploads
            .insert(file_name.to_string());
    }

    /// The next upload of `file_name` is stored, but the caller sees a transient error.
    pub fn lose_upload_response(&self, file_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .lose_response_once
            .insert(file_name.to_string());
    }

    /// Every call fails with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    pub fn calls(&self) -> Calls {
        self.inner.lock().unwrap().calls
    }

    pub fn mutations(&self) -> usize {
        self.inner.lock().unwrap().mutations
    }

    /// Creates a collection directly, bypassing the counters.
    pub fn seed_collection(&self, name: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.fresh_id("c");
        inner.collections.push(RemoteCollection {
            id: id.clone(),
            name: name.to_string(),
        });
        inner.documents.entry(id.clone()).or_default();
        id
    }

    /// Removes a document behind the reconciler's back.
    pub fn drop_document(&self, file_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        for docs in inner.documents.values_mut() {
            docs.retain(|d| d.file_name != file_name);
        }
    }

    pub fn collection_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<String> = inner.collections.iter().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub fn document_ids(&self) -> HashSet<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .documents
            .values()
            .flatten()
            .map(|d| d.id.clone())
            .collect()
    }

    /// Sorted `(collection name, file name, hash)` triples, duplicates included.
    pub fn inventory(&self) -> Vec<(String, String, String)> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for collection in &inner.collections {
            for doc in inner.documents.get(&collection.id).into_iter().flatten() {
                out.push((collection.name.clone(), doc.file_name.clone(), doc.hash.clone()));
            }
        }
        out.sort();
        out
    }

    fn gate(&self) -> Result<Gate, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(RemoteError::Unavailable("503 service unavailable".into()));
        }
        inner.mutations += 1;
        Ok(match inner.hang {
            Some((completed, mode)) if inner.mutations > completed => match mode {
                HangMode::BeforeEffect => Gate::HangNow,
                HangMode::AfterEffect => Gate::HangAfter,
            },
            _ => Gate::Proceed,
        })
    }

    fn describe(&self, collection_id: &str, doc: &StoredDocument) -> RemoteDocument {
        RemoteDocument {
            remote_id: doc.id.clone(),
            collection_id: collection_id.to_string(),
            file_name: doc.file_name.clone(),
            content_hash: self.report_hashes.then(|| doc.hash.clone()),
        }
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.inner.lock().unwrap().unavailable {
            return Err(RemoteError::Unavailable("503 service unavailable".into()));
        }
        Ok(())
    }
}

impl Inner {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

async fn hang() {
    futures::future::pending::<()>().await;
}

#[async_trait]
impl KnowledgeClient for FakeKnowledge {
    async fn list_collections(&self) -> Result<Vec<RemoteCollection>, RemoteError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.list_collections += 1;
        Ok(inner.collections.clone())
    }

    async fn create_collection(
        &self,
        name: &str,
        _description: &str,
    ) -> Result<RemoteCollection, RemoteError> {
        let gate = self.gate()?;
        if let Gate::HangNow = gate {
            hang().await;
        }
        let created = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.create_collection += 1;
            let id = inner.fresh_id("c");
            let collection = RemoteCollection {
                id: id.clone(),
                name: name.to_string(),
            };
            inner.collections.push(collection.clone());
            inner.documents.entry(id).or_default();
            collection
        };
        if let Gate::HangAfter = gate {
            hang().await;
        }
        Ok(created)
    }

    async fn list_documents(&self, collection_id: &str) -> Result<Vec<RemoteDocument>, RemoteError> {
        self.check_available()?;
        let docs = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.list_documents += 1;
            match inner.documents.get(collection_id) {
                Some(docs) => docs.clone(),
                None => {
                    return Err(RemoteError::Rejected {
                        status: Some(404),
                        message: format!("unknown collection {collection_id}"),
                    })
                }
            }
        };
        Ok(docs.iter().map(|d| self.describe(collection_id, d)).collect())
    }

    async fn upload_document(
        &self,
        collection_id: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<RemoteDocument, RemoteError> {
        if self
            .inner
            .lock()
            .unwrap()
            .failing_uploads
            .contains(file_name)
        {
            return Err(RemoteError::Unavailable(format!("502 bad gateway for {file_name}")));
        }
        let gate = self.gate()?;
        if let Gate::HangNow = gate {
            hang().await;
        }
        let (stored, lost) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.documents.contains_key(collection_id) {
                return Err(RemoteError::rejected(format!("unknown collection {collection_id}")));
            }
            inner.calls.upload += 1;
            let stored = StoredDocument {
                id: inner.fresh_id("f"),
                file_name: file_name.to_string(),
                hash: fingerprint_bytes(&content),
            };
            inner
                .documents
                .entry(collection_id.to_string())
                .or_default()
                .push(stored.clone());
            let lost = inner.lose_response_once.remove(file_name);
            (stored, lost)
        };
        if let Gate::HangAfter = gate {
            hang().await;
        }
        if lost {
            return Err(RemoteError::Unavailable("connection reset".into()));
        }
        Ok(self.describe(collection_id, &stored))
    }

    async fn delete_document(
        &self,
        collection_id: &str,
        remote_id: &str,
    ) -> Result<DeleteOutcome, RemoteError> {
        let gate = self.gate()?;
        if let Gate::HangNow = gate {
            hang().await;
        }
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.delete += 1;
            match inner.documents.get_mut(collection_id) {
                Some(docs) => {
                    let before = docs.len();
                    docs.retain(|d| d.id != remote_id);
                    if docs.len() < before {
                        DeleteOutcome::Deleted
                    } else {
                        DeleteOutcome::NotFound
                    }
                }
                None => DeleteOutcome::NotFound,
            }
        };
        if let Gate::HangAfter = gate {
            hang().await;
        }
        Ok(outcome)
    }

    async fn get_document(
        &self,
        collection_id: &str,
        remote_id: &str,
    ) -> Result<Option<RemoteDocument>, RemoteError> {
        self.check_available()?;
        let found = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.get_document += 1;
            inner
                .documents
                .get(collection_id)
                .and_then(|docs| docs.iter().find(|d| d.id == remote_id).cloned())
        };
        Ok(found.map(|d| self.describe(collection_id, &d)))
    }
}

/// Retries quickly so failure tests stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: vec![Duration::from_millis(1), Duration::from_millis(2)],
        attempt_timeout: Duration::from_secs(30),
    }
}

/// Config for a sync root at `base_dir` with the state file kept outside of it.
pub fn test_config(base_dir: &Path, state_file: &Path) -> SynchroniseConfig {
    let mut config = SynchroniseConfig::new(base_dir);
    config.state_file = Some(state_file.to_path_buf());
    config.retry = fast_retry();
    config
}

pub fn write_file(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}
