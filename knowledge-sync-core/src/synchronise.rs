//! High-level pipeline: reconciles a local directory tree with remote knowledge collections.
//!
//! This module provides the top-level orchestration for one synchronisation run. It
//! implements a coordinated pipeline that:
//!   - Scans the sync root into per-collection groups of [`LocalDocument`]s
//!   - Loads the previous [`SyncState`] (what was last pushed, and under which remote id)
//!   - Ensures each collection exists remotely and fetches its live inventory
//!   - Plans the minimal set of uploads and deletions per collection ([`plan_collection`])
//!   - Executes the plan through a [`KnowledgeClient`], committing the state after every
//!     confirmed remote effect
//!   - Removes copies left behind by uploads whose result never got recorded
//!   - Aggregates a [`SynchroniseReport`] of what was uploaded, skipped, deleted or failed.
//!
//! # Major Types
//! - [`SynchroniseConfig`]: sync root, state location, concurrency and retry policy
//! - [`CollectionPlan`] / [`PlannedAction`]: the pure diff for one collection
//! - [`SynchroniseReport`]: per-collection outcome plus run-level failures
//!
//! # Responsibilities
//! - Idempotent: a second run without local changes performs no uploads or deletions
//! - Partial failure isolation: a failed file or collection is reported and the run
//!   carries on with everything else
//! - Commit-after-effect: a record is written only once the remote call it describes
//!   has been confirmed. Each upload is announced in the state before it is sent, so
//!   a copy stored by an interrupted run is recognised by its file name and removed
//!   (or adopted, when the service reports a matching content hash) on the next run
//! - Single writer: remote calls within a collection run concurrently, but their
//!   outcomes are applied to the state by one loop
//!
//! # Error Handling
//! Only an unusable sync root, an unreadable state file or a failed state write abort
//! the run ([`SyncError`]). Everything else lands in the report.
//!
//! # Navigation
//! - Main entrypoint: [`synchronise`]
//! - Idempotent collection lookup: [`ensure_collection`]

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use crate::config::{RetryPolicy, SynchroniseConfig};
use crate::contract::{
    remote_file_name, DeleteOutcome, KnowledgeClient, LocalDocument, RemoteCollection,
    RemoteDocument, RemoteError,
};
use crate::naming::{collection_description, collection_display_name};
use crate::retry::with_retry;
use crate::scan::{fingerprint_bytes, scan, ScanError, ScanIssue};
use crate::state::{PendingDeletion, StateError, StateStore, SyncRecord, SyncState};

/// Fatal errors: the run stops and nothing further is sent to the service.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Scan,
    EnsureCollection,
    ListDocuments,
    Upload,
    Delete,
    RemoveReplaced,
    RemoveOrphan,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Scan => "scan",
            Operation::EnsureCollection => "ensure_collection",
            Operation::ListDocuments => "list_documents",
            Operation::Upload => "upload",
            Operation::Delete => "delete",
            Operation::RemoveReplaced => "remove_replaced",
            Operation::RemoveOrphan => "remove_orphan",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOperation {
    pub operation: Operation,
    pub collection: Option<String>,
    pub relative_path: Option<String>,
    pub error: String,
}

impl fmt::Display for FailedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.operation)?;
        match (&self.collection, &self.relative_path) {
            (Some(c), Some(p)) if !p.is_empty() => write!(f, "{c}/{p}")?,
            (Some(c), _) => write!(f, "{c}")?,
            _ => f.write_str("-")?,
        }
        write!(f, ": {}", self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentReport {
    pub relative_path: String,
    pub remote_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionReport {
    /// Local directory name.
    pub collection: String,
    pub display_name: String,
    pub collection_id: Option<String>,
    pub uploaded: Vec<DocumentReport>,
    /// Documents found already present remotely and recorded without uploading.
    pub adopted: Vec<DocumentReport>,
    pub skipped: usize,
    pub deleted: Vec<DocumentReport>,
    /// Unrecorded copies from interrupted uploads that were removed.
    pub orphans_removed: usize,
    pub failed: Vec<FailedOperation>,
}

impl CollectionReport {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            display_name: collection_display_name(collection),
            ..Self::default()
        }
    }

    fn fail_all(&mut self, docs: &[LocalDocument], operation: Operation, err: &RemoteError) {
        for doc in docs {
            self.failed.push(FailedOperation {
                operation,
                collection: Some(doc.collection.clone()),
                relative_path: Some(doc.relative_path.clone()),
                error: err.to_string(),
            });
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SynchroniseReport {
    pub collections: Vec<CollectionReport>,
    /// Failures not tied to a single collection run (scan issues, replaced-document cleanup).
    pub failures: Vec<FailedOperation>,
    /// Superseded remote documents removed after their replacement was recorded.
    pub replaced_removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub uploaded: usize,
    pub adopted: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uploaded={} adopted={} skipped={} deleted={} failed={}",
            self.uploaded, self.adopted, self.skipped, self.deleted, self.failed
        )
    }
}

impl SynchroniseReport {
    pub fn summary(&self) -> SyncSummary {
        let mut summary = SyncSummary {
            failed: self.failures.len(),
            ..SyncSummary::default()
        };
        for c in &self.collections {
            summary.uploaded += c.uploaded.len();
            summary.adopted += c.adopted.len();
            summary.skipped += c.skipped;
            summary.deleted += c.deleted.len();
            summary.failed += c.failed.len();
        }
        summary
    }

    pub fn has_failures(&self) -> bool {
        self.summary().failed > 0
    }

    /// Every failure in the run, collection failures first.
    pub fn all_failures(&self) -> impl Iterator<Item = &FailedOperation> {
        self.collections
            .iter()
            .flat_map(|c| c.failed.iter())
            .chain(self.failures.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadReason {
    /// No record yet.
    New,
    /// Content differs from the recorded fingerprint.
    Changed,
    /// Recorded as pushed, but the service no longer lists it.
    Drifted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Skip {
        relative_path: String,
    },
    Upload {
        relative_path: String,
        reason: UploadReason,
        /// Remote document superseded by this upload, removed once the new one is recorded.
        replaces: Option<String>,
    },
    Adopt {
        relative_path: String,
        remote_id: String,
        replaces: Option<String>,
    },
    Delete {
        relative_path: String,
        remote_id: String,
    },
    /// Unrecorded copy of an upload that was in flight when a run stopped.
    Discard {
        file_name: String,
        remote_id: String,
    },
}

/// The operations that bring one remote collection in line with its local directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionPlan {
    pub actions: Vec<PlannedAction>,
}

impl CollectionPlan {
    pub fn uploads(&self) -> usize {
        self.count(|a| matches!(a, PlannedAction::Upload { .. }))
    }

    pub fn deletes(&self) -> usize {
        self.count(|a| matches!(a, PlannedAction::Delete { .. }))
    }

    pub fn skips(&self) -> usize {
        self.count(|a| matches!(a, PlannedAction::Skip { .. }))
    }

    pub fn adoptions(&self) -> usize {
        self.count(|a| matches!(a, PlannedAction::Adopt { .. }))
    }

    pub fn discards(&self) -> usize {
        self.count(|a| matches!(a, PlannedAction::Discard { .. }))
    }

    fn count(&self, pred: impl Fn(&PlannedAction) -> bool) -> usize {
        self.actions.iter().filter(|a| pred(a)).count()
    }
}

/// Computes the diff for one collection.
///
/// `local` holds the documents scanned for `collection` and `remote` the live listing
/// of `collection_id`. The records and upload intents come from `state`. A remote
/// document referenced by any record, in any collection, is never adopted or discarded.
/// Records that sit under an unreadable entry in `issues` are never planned for deletion.
pub fn plan_collection(
    collection: &str,
    collection_id: &str,
    local: &[LocalDocument],
    state: &SyncState,
    remote: &[RemoteDocument],
    issues: &[ScanIssue],
) -> CollectionPlan {
    let prior = state.collection(collection);
    let live: HashSet<&str> = remote.iter().map(|d| d.remote_id.as_str()).collect();
    let claimed = state.claimed_ids();
    let in_flight = state.pending_upload_names(collection_id);

    // Unclaimed remote documents whose hash is known can stand in for an upload.
    let mut adoptable: HashMap<(String, String), String> = remote
        .iter()
        .filter(|d| !claimed.contains(d.remote_id.as_str()))
        .filter_map(|d| {
            d.content_hash
                .as_ref()
                .map(|hash| ((d.file_name.clone(), hash.clone()), d.remote_id.clone()))
        })
        .collect();

    let mut actions = Vec::new();
    let mut seen = HashSet::new();

    for doc in local {
        seen.insert(doc.relative_path.as_str());
        let record = prior.and_then(|p| p.documents.get(&doc.relative_path));

        let (reason, replaces) = match record {
            None => (UploadReason::New, None),
            Some(r) if r.fingerprint != doc.fingerprint => (
                UploadReason::Changed,
                live.contains(r.remote_id.as_str())
                    .then(|| r.remote_id.clone()),
            ),
            Some(r) if !live.contains(r.remote_id.as_str()) => (UploadReason::Drifted, None),
            Some(_) => {
                actions.push(PlannedAction::Skip {
                    relative_path: doc.relative_path.clone(),
                });
                continue;
            }
        };

        match adoptable.remove(&(doc.file_name(), doc.fingerprint.clone())) {
            Some(remote_id) => actions.push(PlannedAction::Adopt {
                relative_path: doc.relative_path.clone(),
                remote_id,
                replaces,
            }),
            None => actions.push(PlannedAction::Upload {
                relative_path: doc.relative_path.clone(),
                reason,
                replaces,
            }),
        }
    }

    let adopted: HashSet<String> = actions
        .iter()
        .filter_map(|a| match a {
            PlannedAction::Adopt { remote_id, .. } => Some(remote_id.clone()),
            _ => None,
        })
        .collect();
    for doc in remote {
        let id = doc.remote_id.as_str();
        if claimed.contains(id) || adopted.contains(id) {
            continue;
        }
        if !doc.file_name.is_empty() && in_flight.contains(doc.file_name.as_str()) {
            actions.push(PlannedAction::Discard {
                file_name: doc.file_name.clone(),
                remote_id: doc.remote_id.clone(),
            });
        }
    }

    if let Some(prior) = prior {
        for (relative_path, record) in &prior.documents {
            if seen.contains(relative_path.as_str()) {
                continue;
            }
            if issues.iter().any(|i| i.shadows(collection, relative_path)) {
                debug!(collection, path = %relative_path, "Keeping record under unreadable entry");
                continue;
            }
            actions.push(PlannedAction::Delete {
                relative_path: relative_path.clone(),
                remote_id: record.remote_id.clone(),
            });
        }
    }

    CollectionPlan { actions }
}

/// Returns the collection named `name`, creating it when absent.
///
/// Every attempt lists before creating, so a create whose response got lost is found
/// on the next attempt instead of being repeated.
pub async fn ensure_collection<C>(
    client: &C,
    policy: &RetryPolicy,
    name: &str,
    description: &str,
) -> Result<RemoteCollection, RemoteError>
where
    C: KnowledgeClient,
{
    with_retry(policy, "ensure_collection", |attempt| async move {
        let existing = client.list_collections().await?;
        if let Some(found) = existing.into_iter().find(|c| c.name == name) {
            debug!(name, collection_id = %found.id, "Collection already exists");
            return Ok(found);
        }
        info!(name, attempt, "[SYNC] Creating collection");
        client.create_collection(name, description).await
    })
    .await
}

/// Entrypoint: run one reconciliation of `config.base_dir` against the service.
pub async fn synchronise<C>(
    config: &SynchroniseConfig,
    client: &C,
) -> Result<SynchroniseReport, SyncError>
where
    C: KnowledgeClient,
{
    info!(base_dir = %config.base_dir.display(), "[SYNC] Starting synchronisation");

    let mut groups: BTreeMap<String, Vec<LocalDocument>> = BTreeMap::new();
    let mut issues = Vec::new();
    for entry in scan(&config.base_dir)? {
        match entry {
            Ok(doc) => groups.entry(doc.collection.clone()).or_default().push(doc),
            Err(issue) => issues.push(issue),
        }
    }
    info!(
        collections = groups.len(),
        documents = groups.values().map(Vec::len).sum::<usize>(),
        unreadable = issues.len(),
        "[SYNC] Scanned local content"
    );

    let store = StateStore::new(config.state_path());
    let state = store.load()?;

    let mut by_display_name: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for collection in groups.keys() {
        by_display_name
            .entry(collection_display_name(collection))
            .or_default()
            .push(collection.as_str());
    }
    for (display_name, dirs) in by_display_name.iter().filter(|(_, d)| d.len() > 1) {
        warn!(%display_name, directories = ?dirs, "[SYNC] Directories share one remote collection");
    }

    let mut report = SynchroniseReport::default();
    for issue in &issues {
        report.failures.push(FailedOperation {
            operation: Operation::Scan,
            collection: issue.collection.clone(),
            relative_path: issue.relative_path.clone(),
            error: format!("{}: {}", issue.path.display(), issue.message),
        });
    }

    let mut reconciler = Reconciler {
        client,
        config,
        store,
        state,
    };

    for (collection, docs) in &groups {
        let collection_report = reconciler.sync_collection(collection, docs, &issues).await?;
        report.collections.push(collection_report);
    }

    let retired: Vec<String> = reconciler
        .state
        .collections
        .keys()
        .filter(|name| !groups.contains_key(*name))
        .cloned()
        .collect();
    for collection in retired {
        let collection_report = reconciler.retire_collection(&collection, &issues).await?;
        report.collections.push(collection_report);
    }

    reconciler.drain_pending_deletions(&mut report).await?;

    let summary = report.summary();
    if summary.failed > 0 {
        warn!(%summary, "[SYNC] Synchronisation finished with failures");
    } else {
        info!(%summary, "[SYNC] Synchronisation finished");
    }
    Ok(report)
}

/// Holds the run's state; the only place that mutates and saves it.
struct Reconciler<'a, C> {
    client: &'a C,
    config: &'a SynchroniseConfig,
    store: StateStore,
    state: SyncState,
}

enum RemoteOp<'d> {
    Upload {
        doc: &'d LocalDocument,
        replaces: Option<String>,
    },
    Delete {
        collection: String,
        relative_path: String,
        remote_id: String,
    },
    Discard {
        collection: String,
        file_name: String,
        remote_id: String,
    },
}

enum OpOutcome {
    Uploaded {
        relative_path: String,
        file_name: String,
        fingerprint: String,
        document: RemoteDocument,
        replaces: Option<String>,
        /// False when a retry sent the content again without finding the earlier attempt.
        settled: bool,
    },
    Deleted {
        relative_path: String,
        remote_id: String,
        outcome: DeleteOutcome,
    },
    Discarded {
        file_name: String,
        remote_id: String,
        outcome: DeleteOutcome,
    },
    /// `file_name` is set when the failure leaves an upload intent unresolved.
    Failed {
        failure: FailedOperation,
        file_name: Option<String>,
    },
}

impl<'a, C> Reconciler<'a, C>
where
    C: KnowledgeClient,
{
    async fn sync_collection(
        &mut self,
        collection: &str,
        docs: &[LocalDocument],
        issues: &[ScanIssue],
    ) -> Result<CollectionReport, SyncError> {
        let mut report = CollectionReport::new(collection);
        info!(
            collection,
            display_name = %report.display_name,
            documents = docs.len(),
            "[SYNC] Reconciling collection"
        );

        let client = self.client;
        let config = self.config;
        let policy = &config.retry;

        let remote_collection = match ensure_collection(
            client,
            policy,
            &report.display_name,
            &collection_description(collection),
        )
        .await
        {
            Ok(c) => c,
            Err(err) => {
                error!(collection, error = %err, "[SYNC][ERROR] Could not ensure collection");
                report.fail_all(docs, Operation::EnsureCollection, &err);
                return Ok(report);
            }
        };
        let collection_id = remote_collection.id;
        report.collection_id = Some(collection_id.clone());

        if let Some(known) = self.state.collection(collection) {
            if known.collection_id != collection_id {
                warn!(
                    collection,
                    recorded = %known.collection_id,
                    current = %collection_id,
                    "[SYNC] Collection id changed remotely, recorded documents will be re-checked"
                );
                self.state.set_collection_id(collection, &collection_id);
                self.store.save(&self.state)?;
            }
        }

        let listing = match with_retry(policy, "list_documents", |_| {
            client.list_documents(collection_id.as_str())
        })
        .await
        {
            Ok(listing) => listing,
            Err(err) => {
                error!(collection, error = %err, "[SYNC][ERROR] Could not list collection documents");
                report.fail_all(docs, Operation::ListDocuments, &err);
                return Ok(report);
            }
        };

        let plan = plan_collection(
            collection,
            &collection_id,
            docs,
            &self.state,
            &listing,
            issues,
        );
        info!(
            collection,
            uploads = plan.uploads(),
            adoptions = plan.adoptions(),
            deletes = plan.deletes(),
            discards = plan.discards(),
            skips = plan.skips(),
            "[SYNC] Planned collection"
        );

        let unsettled = self
            .execute_plan(collection, &collection_id, &plan, docs, &mut report)
            .await?;
        self.settle_uploads(&collection_id, &unsettled)?;
        Ok(report)
    }

    /// Deletes the records of a collection whose local directory is gone. The remote
    /// collection itself is kept.
    async fn retire_collection(
        &mut self,
        collection: &str,
        issues: &[ScanIssue],
    ) -> Result<CollectionReport, SyncError> {
        let mut report = CollectionReport::new(collection);
        let Some(prior) = self.state.collection(collection) else {
            return Ok(report);
        };
        let collection_id = prior.collection_id.clone();
        info!(
            collection,
            documents = prior.documents.len(),
            "[SYNC] Local directory removed, deleting its documents"
        );
        report.collection_id = Some(collection_id.clone());

        // Only needed to find copies of uploads an earlier run never recorded.
        let listing = if self.state.pending_upload_names(&collection_id).is_empty() {
            Some(Vec::new())
        } else {
            let client = self.client;
            let policy = &self.config.retry;
            match with_retry(policy, "list_documents", |_| {
                client.list_documents(collection_id.as_str())
            })
            .await
            {
                Ok(listing) => Some(listing),
                Err(err) => {
                    warn!(collection, error = %err, "[SYNC] Could not list removed collection, keeping upload intents");
                    None
                }
            }
        };

        let plan = plan_collection(
            collection,
            &collection_id,
            &[],
            &self.state,
            listing.as_deref().unwrap_or_default(),
            issues,
        );
        let unsettled = self
            .execute_plan(collection, &collection_id, &plan, &[], &mut report)
            .await?;
        if listing.is_some() {
            self.settle_uploads(&collection_id, &unsettled)?;
        }
        Ok(report)
    }

    /// Drops the collection's upload intents, except for file names whose copies may
    /// still be unrecorded.
    fn settle_uploads(
        &mut self,
        collection_id: &str,
        unsettled: &HashSet<String>,
    ) -> Result<(), SyncError> {
        let before = self.state.pending_uploads.len();
        self.state
            .pending_uploads
            .retain(|p| p.collection_id != collection_id || unsettled.contains(&p.file_name));
        if self.state.pending_uploads.len() != before {
            self.store.save(&self.state)?;
        }
        Ok(())
    }

    async fn execute_plan(
        &mut self,
        collection: &str,
        collection_id: &str,
        plan: &CollectionPlan,
        docs: &[LocalDocument],
        report: &mut CollectionReport,
    ) -> Result<HashSet<String>, SyncError> {
        let by_path: HashMap<&str, &LocalDocument> = docs
            .iter()
            .map(|d| (d.relative_path.as_str(), d))
            .collect();

        for action in &plan.actions {
            match action {
                PlannedAction::Skip { relative_path } => {
                    debug!(collection, path = %relative_path, "Unchanged, skipping");
                    report.skipped += 1;
                }
                PlannedAction::Adopt {
                    relative_path,
                    remote_id,
                    replaces,
                } => {
                    let Some(doc) = by_path.get(relative_path.as_str()) else {
                        continue;
                    };
                    info!(collection, path = %relative_path, %remote_id, "[SYNC] Adopting existing remote document");
                    self.state
                        .clear_pending_upload(collection_id, &doc.file_name());
                    self.state.upsert(
                        collection,
                        collection_id,
                        relative_path,
                        SyncRecord {
                            remote_id: remote_id.clone(),
                            fingerprint: doc.fingerprint.clone(),
                        },
                    );
                    self.queue_replaced(collection_id, replaces.as_deref(), remote_id);
                    self.store.save(&self.state)?;
                    report.adopted.push(DocumentReport {
                        relative_path: relative_path.clone(),
                        remote_id: remote_id.clone(),
                    });
                }
                PlannedAction::Upload { .. }
                | PlannedAction::Delete { .. }
                | PlannedAction::Discard { .. } => {}
            }
        }

        // Announce every upload before sending it.
        let mut announced = false;
        for action in &plan.actions {
            if let PlannedAction::Upload { relative_path, .. } = action {
                announced |= self
                    .state
                    .add_pending_upload(collection_id, &remote_file_name(relative_path));
            }
        }
        if announced {
            self.store.save(&self.state)?;
        }

        let ops = plan.actions.iter().filter_map(|action| match action {
            PlannedAction::Upload {
                relative_path,
                replaces,
                ..
            } => by_path
                .get(relative_path.as_str())
                .copied()
                .map(|doc| RemoteOp::Upload {
                    doc,
                    replaces: replaces.clone(),
                }),
            PlannedAction::Delete {
                relative_path,
                remote_id,
            } => Some(RemoteOp::Delete {
                collection: collection.to_string(),
                relative_path: relative_path.clone(),
                remote_id: remote_id.clone(),
            }),
            PlannedAction::Discard {
                file_name,
                remote_id,
            } => Some(RemoteOp::Discard {
                collection: collection.to_string(),
                file_name: file_name.clone(),
                remote_id: remote_id.clone(),
            }),
            _ => None,
        });

        let client = self.client;
        let config = self.config;
        let policy = &config.retry;
        let mut outcomes = stream::iter(ops)
            .map(|op| run_op(client, policy, collection_id, op))
            .buffer_unordered(config.concurrency.max(1));

        let mut unsettled = HashSet::new();
        while let Some(outcome) = outcomes.next().await {
            self.apply(collection, collection_id, outcome, report, &mut unsettled)?;
        }
        Ok(unsettled)
    }

    fn apply(
        &mut self,
        collection: &str,
        collection_id: &str,
        outcome: OpOutcome,
        report: &mut CollectionReport,
        unsettled: &mut HashSet<String>,
    ) -> Result<(), SyncError> {
        match outcome {
            OpOutcome::Uploaded {
                relative_path,
                file_name,
                fingerprint,
                document,
                replaces,
                settled,
            } => {
                if settled {
                    self.state.clear_pending_upload(collection_id, &file_name);
                } else {
                    // An earlier attempt may have stored a copy nobody can identify yet.
                    unsettled.insert(file_name);
                }
                self.state.upsert(
                    collection,
                    collection_id,
                    &relative_path,
                    SyncRecord {
                        remote_id: document.remote_id.clone(),
                        fingerprint,
                    },
                );
                self.queue_replaced(collection_id, replaces.as_deref(), &document.remote_id);
                self.store.save(&self.state)?;
                info!(collection, path = %relative_path, remote_id = %document.remote_id, "[SYNC][UPLOAD] Uploaded");
                report.uploaded.push(DocumentReport {
                    relative_path,
                    remote_id: document.remote_id,
                });
            }
            OpOutcome::Deleted {
                relative_path,
                remote_id,
                outcome,
            } => {
                self.state.remove(collection, &relative_path);
                self.store.save(&self.state)?;
                info!(collection, path = %relative_path, %remote_id, ?outcome, "[SYNC][DELETE] Deleted");
                report.deleted.push(DocumentReport {
                    relative_path,
                    remote_id,
                });
            }
            OpOutcome::Discarded {
                file_name,
                remote_id,
                outcome,
            } => {
                info!(collection, %file_name, %remote_id, ?outcome, "[SYNC][DELETE] Removed unrecorded copy");
                report.orphans_removed += 1;
            }
            OpOutcome::Failed { failure, file_name } => {
                if let Some(file_name) = file_name {
                    unsettled.insert(file_name);
                }
                error!(
                    operation = %failure.operation,
                    collection,
                    path = failure.relative_path.as_deref().unwrap_or(""),
                    error = %failure.error,
                    "[SYNC][ERROR] Operation failed"
                );
                report.failed.push(failure);
            }
        }
        Ok(())
    }

    fn queue_replaced(&mut self, collection_id: &str, replaces: Option<&str>, current: &str) {
        if let Some(old) = replaces.filter(|old| *old != current) {
            self.state.pending_deletions.push(PendingDeletion {
                collection_id: collection_id.to_string(),
                remote_id: old.to_string(),
            });
        }
    }

    /// Removes superseded remote documents, including ones left by an interrupted run.
    async fn drain_pending_deletions(
        &mut self,
        report: &mut SynchroniseReport,
    ) -> Result<(), SyncError> {
        let pending = self.state.pending_deletions.clone();
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "[SYNC] Removing replaced documents");

        for entry in pending {
            if !self.state.references(&entry.remote_id) {
                let result = delete_confirmed(
                    self.client,
                    &self.config.retry,
                    &entry.collection_id,
                    &entry.remote_id,
                )
                .await;
                if let Err(err) = result {
                    error!(remote_id = %entry.remote_id, error = %err, "[SYNC][ERROR] Could not remove replaced document");
                    report.failures.push(FailedOperation {
                        operation: Operation::RemoveReplaced,
                        collection: None,
                        relative_path: None,
                        error: format!("{}: {err}", entry.remote_id),
                    });
                    continue;
                }
                report.replaced_removed += 1;
            }
            self.state.pending_deletions.retain(|p| p != &entry);
            self.store.save(&self.state)?;
        }
        Ok(())
    }
}

async fn run_op<C>(
    client: &C,
    policy: &RetryPolicy,
    collection_id: &str,
    op: RemoteOp<'_>,
) -> OpOutcome
where
    C: KnowledgeClient,
{
    match op {
        RemoteOp::Upload { doc, replaces } => {
            upload_one(client, policy, collection_id, doc, replaces).await
        }
        RemoteOp::Delete {
            collection,
            relative_path,
            remote_id,
        } => match delete_confirmed(client, policy, collection_id, &remote_id).await {
            Ok(outcome) => OpOutcome::Deleted {
                relative_path,
                remote_id,
                outcome,
            },
            Err(err) => OpOutcome::Failed {
                failure: FailedOperation {
                    operation: Operation::Delete,
                    collection: Some(collection),
                    relative_path: Some(relative_path),
                    error: err.to_string(),
                },
                file_name: None,
            },
        },
        RemoteOp::Discard {
            collection,
            file_name,
            remote_id,
        } => match delete_confirmed(client, policy, collection_id, &remote_id).await {
            Ok(outcome) => OpOutcome::Discarded {
                file_name,
                remote_id,
                outcome,
            },
            Err(err) => OpOutcome::Failed {
                failure: FailedOperation {
                    operation: Operation::RemoveOrphan,
                    collection: Some(collection),
                    relative_path: Some(file_name.clone()),
                    error: format!("{remote_id}: {err}"),
                },
                file_name: Some(file_name),
            },
        },
    }
}

async fn upload_one<C>(
    client: &C,
    policy: &RetryPolicy,
    collection_id: &str,
    doc: &LocalDocument,
    replaces: Option<String>,
) -> OpOutcome
where
    C: KnowledgeClient,
{
    let file_name = doc.file_name();
    let failed = |error: String| OpOutcome::Failed {
        failure: FailedOperation {
            operation: Operation::Upload,
            collection: Some(doc.collection.clone()),
            relative_path: Some(doc.relative_path.clone()),
            error,
        },
        file_name: Some(file_name.clone()),
    };

    let content = match tokio::fs::read(&doc.absolute_path).await {
        Ok(content) => content,
        Err(e) => return failed(format!("failed to read {}: {e}", doc.absolute_path.display())),
    };
    // The record must describe the bytes actually sent, even if the file changed
    // since it was scanned.
    let fingerprint = fingerprint_bytes(&content);

    let result = with_retry(policy, "upload_document", |attempt| {
        let content = content.clone();
        let file_name = file_name.as_str();
        let fingerprint = fingerprint.as_str();
        async move {
            if attempt > 1 {
                if let Some(existing) =
                    find_uploaded(client, collection_id, file_name, fingerprint).await
                {
                    info!(file_name, remote_id = %existing.remote_id, "Earlier attempt landed, not re-uploading");
                    return Ok((existing, true));
                }
            }
            client
                .upload_document(collection_id, file_name, content)
                .await
                .map(|document| (document, attempt == 1))
        }
    })
    .await;

    match result {
        Ok((document, settled)) => OpOutcome::Uploaded {
            relative_path: doc.relative_path.clone(),
            file_name,
            fingerprint,
            document,
            replaces,
            settled,
        },
        Err(err) => failed(err.to_string()),
    }
}

/// Looks for a document an earlier, seemingly failed attempt may have created.
async fn find_uploaded<C>(
    client: &C,
    collection_id: &str,
    file_name: &str,
    fingerprint: &str,
) -> Option<RemoteDocument>
where
    C: KnowledgeClient,
{
    client
        .list_documents(collection_id)
        .await
        .ok()?
        .into_iter()
        .find(|d| d.file_name == file_name && d.content_hash.as_deref() == Some(fingerprint))
}

/// Deletes with retries. When the budget runs out on transient errors, asks the
/// service whether the document is gone anyway.
async fn delete_confirmed<C>(
    client: &C,
    policy: &RetryPolicy,
    collection_id: &str,
    remote_id: &str,
) -> Result<DeleteOutcome, RemoteError>
where
    C: KnowledgeClient,
{
    match with_retry(policy, "delete_document", |_| {
        client.delete_document(collection_id, remote_id)
    })
    .await
    {
        Err(err) if err.is_transient() => {
            let lookup = tokio::time::timeout(
                policy.attempt_timeout,
                client.get_document(collection_id, remote_id),
            )
            .await;
            match lookup {
                Ok(Ok(None)) => {
                    info!(remote_id, "Delete unconfirmed but document is absent");
                    Ok(DeleteOutcome::NotFound)
                }
                _ => Err(err),
            }
        }
        other => other,
    }
}
