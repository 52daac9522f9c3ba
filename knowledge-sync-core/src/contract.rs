//! # contract: the seam between the reconciler and a knowledge service
//!
//! This module defines the single trait ([`KnowledgeClient`]) the reconciler drives,
//! together with the plain data types that cross it.
//!
//! ## Interface & Extensibility
//! - Implement [`KnowledgeClient`] to target a new service (the CLI crate ships an
//!   Open WebUI implementation over HTTP).
//! - All methods are async and return a typed [`RemoteError`], so the caller can tell
//!   a transient outage (retried) from a rejected request (not retried).
//!
//! ## Mocking & Testing
//! - The trait is annotated for `mockall`, so consumers get `MockKnowledgeClient` for
//!   deterministic unit/integration tests (exported under the default
//!   `test-export-mocks` feature).
//!
//! ## Identity semantics
//! - A collection is identified remotely by an opaque id and matched locally by its
//!   display name.
//! - A document is identified remotely by an opaque id. Whether it still exists is
//!   answered by [`KnowledgeClient::list_documents`], which is authoritative.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use mockall::automock;

/// One eligible file found by the scanner. Identity is `(collection, relative_path)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDocument {
    /// Top-level directory name under the scan root.
    pub collection: String,
    /// Path below the collection directory, always `/`-separated.
    pub relative_path: String,
    /// Where the bytes live on disk; read at upload time.
    pub absolute_path: PathBuf,
    /// SHA-256 of the file content, lowercase hex.
    pub fingerprint: String,
}

impl LocalDocument {
    /// The file name sent to the service: the relative path flattened with `__`.
    pub fn file_name(&self) -> String {
        remote_file_name(&self.relative_path)
    }
}

/// Flattens a `/`-separated relative path into a single file name.
pub fn remote_file_name(relative_path: &str) -> String {
    relative_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("__")
}

/// A collection as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCollection {
    pub id: String,
    pub name: String,
}

/// A document as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDocument {
    pub remote_id: String,
    pub collection_id: String,
    /// File name known to the service. May be empty when only ids are listed.
    pub file_name: String,
    /// Hash reported by the service, if any. Adoption compares it with the local
    /// fingerprint, so it only helps when it is the SHA-256 hex of the file bytes.
    /// Open WebUI hashes the extracted text instead, which rarely matches.
    pub content_hash: Option<String>,
}

/// Result of a delete call. `NotFound` is the desired end state too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Failure of a single remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network trouble, timeouts, rate limiting, 5xx. Worth retrying.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The service refused the request (auth, bad request, gateway redirect).
    #[error("remote rejected request: {message}")]
    Rejected { status: Option<u16>, message: String },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        RemoteError::Rejected {
            status: None,
            message: message.into(),
        }
    }
}

/// Capability interface over the knowledge service.
///
/// The reconciler only relies on the guarantees written on each method. Retries are
/// applied by the caller, so implementations make a single attempt per call.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait KnowledgeClient: Send + Sync {
    /// List every collection visible to the configured credentials.
    async fn list_collections(&self) -> Result<Vec<RemoteCollection>, RemoteError>;

    /// Create a collection. Not idempotent on its own: use
    /// [`crate::synchronise::ensure_collection`] instead of calling this directly.
    async fn create_collection(
        &self,
        name: &str,
        description: &str,
    ) -> Result<RemoteCollection, RemoteError>;

    /// Authoritative inventory of one collection.
    async fn list_documents(&self, collection_id: &str) -> Result<Vec<RemoteDocument>, RemoteError>;

    /// Store `content` as a new document in the collection.
    ///
    /// Any error means "not uploaded": implementations must not leave a half-attached
    /// document behind.
    async fn upload_document(
        &self,
        collection_id: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<RemoteDocument, RemoteError>;

    /// Remove a document from the collection and the service.
    async fn delete_document(
        &self,
        collection_id: &str,
        remote_id: &str,
    ) -> Result<DeleteOutcome, RemoteError>;

    /// Metadata for one document, `None` when it does not exist.
    async fn get_document(
        &self,
        collection_id: &str,
        remote_id: &str,
    ) -> Result<Option<RemoteDocument>, RemoteError>;
}
