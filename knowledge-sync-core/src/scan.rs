//! Local content scanning: walks the sync root and yields one [`LocalDocument`] per
//! eligible file, grouped by the top-level directory it lives under.
//!
//! Hidden entries (dot-files and dot-directories) are pruned, files outside
//! [`SUPPORTED_EXTENSIONS`] and empty files are skipped silently, and files directly
//! in the root belong to no collection and are ignored. Fingerprints are SHA-256
//! digests of the bytes, never timestamps.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::contract::LocalDocument;

/// File extensions accepted for upload (compared case-insensitively).
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    // text
    "txt", "md", "markdown", "rst", "rtf",
    // documents
    "pdf", "doc", "docx", "ppt", "pptx", "xls", "xlsx",
    // code and markup
    "py", "js", "java", "c", "cpp", "h", "hpp", "cs", "php", "rb", "go", "html", "htm", "css",
    "xml", "json", "yaml", "yml",
    // data
    "csv", "tsv",
];

/// The scan root itself could not be used. Fatal for the run.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("sync root {} does not exist", .0.display())]
    Missing(PathBuf),

    #[error("sync root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("sync root {} is unreadable: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A file or directory below the root that could not be read. The run continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanIssue {
    pub path: PathBuf,
    /// Collection the entry belongs to, when it could be determined.
    pub collection: Option<String>,
    /// Path below the collection directory. For an unreadable directory this is a
    /// prefix covering everything beneath it (empty for the collection directory).
    pub relative_path: Option<String>,
    pub message: String,
}

impl ScanIssue {
    /// Whether a previously synced `relative_path` in `collection` may sit below this
    /// unreadable entry, so it must not be treated as deleted.
    pub fn shadows(&self, collection: &str, relative_path: &str) -> bool {
        match (&self.collection, &self.relative_path) {
            (Some(c), Some(prefix)) if c == collection => {
                prefix.is_empty()
                    || relative_path == prefix
                    || relative_path.starts_with(&format!("{prefix}/"))
            }
            (Some(c), None) => c == collection,
            (None, _) => true,
            _ => false,
        }
    }
}

/// One scanned entry: a document, or a reason it could not be read.
pub type ScanEntry = Result<LocalDocument, ScanIssue>;

/// Lazy iterator over the documents below a sync root. Created by [`scan`].
pub struct Scanner {
    root: PathBuf,
    walker: walkdir::FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>,
}

/// Starts scanning `root`. Fails only if the root itself is unusable; problems with
/// individual entries are yielded as [`ScanIssue`]s.
pub fn scan(root: &Path) -> Result<Scanner, ScanError> {
    let metadata = fs::metadata(root).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ScanError::Missing(root.to_path_buf()),
        _ => ScanError::Unreadable {
            path: root.to_path_buf(),
            source: e,
        },
    })?;
    if !metadata.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }
    fs::read_dir(root).map_err(|e| ScanError::Unreadable {
        path: root.to_path_buf(),
        source: e,
    })?;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(is_visible as fn(&DirEntry) -> bool);

    Ok(Scanner {
        root: root.to_path_buf(),
        walker,
    })
}

impl Iterator for Scanner {
    type Item = ScanEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                    let (collection, relative_path) = split_identity(&self.root, &path);
                    warn!(path = %path.display(), error = %err, "Skipping unreadable entry");
                    return Some(Err(ScanIssue {
                        path,
                        collection,
                        relative_path,
                        message: err.to_string(),
                    }));
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let (collection, relative_path) = match split_identity(&self.root, path) {
                (Some(collection), Some(relative_path)) if !relative_path.is_empty() => {
                    (collection, relative_path)
                }
                _ => {
                    debug!(path = %path.display(), "Skipping file outside any collection");
                    continue;
                }
            };

            if !is_supported(path) {
                debug!(path = %path.display(), "Skipping unsupported file type");
                continue;
            }

            match entry.metadata() {
                Ok(meta) if meta.len() == 0 => {
                    debug!(path = %path.display(), "Skipping empty file");
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Failed to stat file");
                    return Some(Err(ScanIssue {
                        path: path.to_path_buf(),
                        collection: Some(collection),
                        relative_path: Some(relative_path),
                        message: err.to_string(),
                    }));
                }
            }

            return Some(match fingerprint_file(path) {
                Ok(fingerprint) => {
                    debug!(collection = %collection, path = %relative_path, %fingerprint, "Scanned file");
                    Ok(LocalDocument {
                        collection,
                        relative_path,
                        absolute_path: path.to_path_buf(),
                        fingerprint,
                    })
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Failed to read file");
                    Err(ScanIssue {
                        path: path.to_path_buf(),
                        collection: Some(collection),
                        relative_path: Some(relative_path),
                        message: err.to_string(),
                    })
                }
            });
        }
    }
}

fn is_visible(entry: &DirEntry) -> bool {
    entry.depth() == 0
        || !entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Whether the file's extension is in [`SUPPORTED_EXTENSIONS`].
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Splits a path below `root` into (collection, `/`-joined remainder).
fn split_identity(root: &Path, path: &Path) -> (Option<String>, Option<String>) {
    let Ok(rel) = path.strip_prefix(root) else {
        return (None, None);
    };
    let mut segments = rel.components().filter_map(|c| match c {
        Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
        _ => None,
    });
    let collection = segments.next();
    let rest = segments.collect::<Vec<_>>().join("/");
    match collection {
        Some(collection) => (Some(collection), Some(rest)),
        None => (None, None),
    }
}

/// SHA-256 of a file's content, lowercase hex.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of in-memory content, lowercase hex.
pub fn fingerprint_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
