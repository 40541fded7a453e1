//! Content-addressed artifact storage.
//!
//! Every artifact is stored once under the SHA-256 of its bytes, so identical
//! outputs deduplicate for free. Next to each blob sits a JSON record with the
//! producing stage and kind. Deterministic artifacts are also indexed by the
//! fingerprint of their inputs, which lets a stage find work that was already
//! done before spending anything on it.
//!
//! ```text
//! <root>/blobs/<aa>/<hash>
//! <root>/records/<aa>/<hash>.json
//! <root>/fingerprints/<ff>/<fingerprint>.json
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use super::atomic::{write_atomic, write_json_atomic, write_new_atomic};
use super::hash::{canonical_json_pretty, ContentHash, Fingerprint};
use crate::error::ErrorKind;
use crate::pipeline::run::StageName;

/// Errors that can occur during artifact storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO operation failed.
    #[error("Storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A referenced artifact is not in the store.
    #[error("Artifact not found: {0}")]
    NotFound(ContentHash),

    /// Stored bytes no longer hash to their identity.
    #[error("Corrupt artifact {expected}: stored bytes hash to {actual}")]
    Corrupt {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// An artifact record or index entry could not be decoded.
    #[error("Malformed storage metadata at {path}: {message}")]
    Metadata { path: PathBuf, message: String },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Taxonomy class for the manifest. A vanished artifact is treated the
    /// same as a corrupt one: the provenance no longer holds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Io { .. } => ErrorKind::StorageIo,
            StorageError::NotFound(_)
            | StorageError::Corrupt { .. }
            | StorageError::Metadata { .. } => ErrorKind::CorruptArtifact,
        }
    }
}

/// What an artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ValidationReport,
    RawAnalysis,
    StatisticalPackage,
    SynthesisReport,
    DeliveryBundle,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::ValidationReport => "validation_report",
            ArtifactKind::RawAnalysis => "raw_analysis",
            ArtifactKind::StatisticalPackage => "statistical_package",
            ArtifactKind::SynthesisReport => "synthesis_report",
            ArtifactKind::DeliveryBundle => "delivery_bundle",
        }
    }

    /// File extension used when the artifact is exported into a bundle.
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::DeliveryBundle => "tar.gz",
            _ => "json",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata describing a stored artifact. Persisted as the artifact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    /// SHA-256 of the bytes.
    pub hash: ContentHash,
    pub kind: ArtifactKind,
    /// Stage that produced the bytes first.
    pub stage: StageName,
    pub size_bytes: u64,
    /// Fingerprint of the inputs that produced it, when known.
    pub input_fingerprint: Option<Fingerprint>,
    /// Whether the same inputs are guaranteed to reproduce these bytes.
    pub deterministic: bool,
    pub created_at: DateTime<Utc>,
}

/// Metadata supplied alongside bytes on [`ArtifactStore::put`].
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub stage: StageName,
    pub kind: ArtifactKind,
    pub input_fingerprint: Option<Fingerprint>,
    pub deterministic: bool,
}

impl PutRequest {
    pub fn new(stage: StageName, kind: ArtifactKind) -> Self {
        Self {
            stage,
            kind,
            input_fingerprint: None,
            deterministic: true,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.input_fingerprint = Some(fingerprint);
        self
    }

    pub fn deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FingerprintEntry {
    fingerprint: Fingerprint,
    hash: ContentHash,
    indexed_at: DateTime<Utc>,
}

/// Durable content-addressed store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Creates a store handle rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the store's directory layout and returns the handle.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let store = Self::new(root);
        for dir in ["blobs", "records", "fingerprints"] {
            let path = store.root.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| StorageError::io(&path, e))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob holding the artifact's bytes.
    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.root
            .join("blobs")
            .join(hash.shard())
            .join(hash.as_str())
    }

    fn record_path(&self, hash: &ContentHash) -> PathBuf {
        self.root
            .join("records")
            .join(hash.shard())
            .join(format!("{}.json", hash))
    }

    fn fingerprint_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join("fingerprints")
            .join(fingerprint.shard())
            .join(format!("{}.json", fingerprint))
    }

    /// Stores `data` and returns its handle.
    ///
    /// Identical bytes stored twice yield the existing handle. A deterministic
    /// artifact with a fingerprint is indexed under it; an existing index entry
    /// is never replaced, so the first result for a fingerprint stays pinned.
    pub async fn put(&self, data: &[u8], request: PutRequest) -> Result<ArtifactHandle, StorageError> {
        let hash = ContentHash::of_bytes(data);

        let handle = match self.handle(&hash).await? {
            Some(existing) if self.blob_intact(&hash).await? => {
                debug!(hash = %hash.short(), kind = %existing.kind, "Artifact already stored");
                existing
            }
            Some(existing) => {
                let blob_path = self.blob_path(&hash);
                warn!(hash = %hash.short(), "Stored blob is missing or damaged; rewriting it");
                write_atomic(&blob_path, data)
                    .await
                    .map_err(|e| StorageError::io(&blob_path, e))?;
                existing
            }
            None => {
                let blob_path = self.blob_path(&hash);
                write_atomic(&blob_path, data)
                    .await
                    .map_err(|e| StorageError::io(&blob_path, e))?;

                let handle = ArtifactHandle {
                    hash: hash.clone(),
                    kind: request.kind,
                    stage: request.stage,
                    size_bytes: data.len() as u64,
                    input_fingerprint: request.input_fingerprint.clone(),
                    deterministic: request.deterministic,
                    created_at: Utc::now(),
                };
                let record_path = self.record_path(&hash);
                write_json_atomic(&record_path, &handle)
                    .await
                    .map_err(|e| StorageError::io(&record_path, e))?;

                debug!(
                    hash = %hash.short(),
                    kind = %request.kind,
                    size = data.len(),
                    "Stored artifact"
                );
                handle
            }
        };

        if request.deterministic {
            if let Some(fingerprint) = &request.input_fingerprint {
                self.index(fingerprint, &hash).await?;
            }
        }

        Ok(handle)
    }

    async fn index(&self, fingerprint: &Fingerprint, hash: &ContentHash) -> Result<(), StorageError> {
        let path = self.fingerprint_path(fingerprint);
        if let Some(existing) = self.read_index(&path).await? {
            warn_if_repinned(fingerprint, &existing.hash, hash);
            return Ok(());
        }

        let entry = FingerprintEntry {
            fingerprint: fingerprint.clone(),
            hash: hash.clone(),
            indexed_at: Utc::now(),
        };
        let bytes = canonical_json_pretty(&entry).map_err(|e| StorageError::io(&path, std::io::Error::other(e)))?;
        let created = write_new_atomic(&path, &bytes)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        if !created {
            // A concurrent writer pinned the fingerprint between our read and write.
            if let Some(existing) = self.read_index(&path).await? {
                warn_if_repinned(fingerprint, &existing.hash, hash);
            }
        }
        Ok(())
    }

    async fn read_index(&self, path: &Path) -> Result<Option<FingerprintEntry>, StorageError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Metadata {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn blob_exists(&self, hash: &ContentHash) -> bool {
        fs::try_exists(self.blob_path(hash)).await.unwrap_or(false)
    }

    /// Whether the stored blob exists and still hashes to `hash`.
    async fn blob_intact(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        match self.get(hash).await? {
            Some(bytes) => Ok(&ContentHash::of_bytes(&bytes) == hash),
            None => Ok(false),
        }
    }

    /// Returns the raw bytes for `hash`, or `None` if unknown. Does not verify.
    pub async fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.blob_path(hash);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    /// Returns the bytes for `hash` after checking they still hash to it.
    pub async fn get_verified(&self, hash: &ContentHash) -> Result<Vec<u8>, StorageError> {
        let bytes = self
            .get(hash)
            .await?
            .ok_or_else(|| StorageError::NotFound(hash.clone()))?;
        verify_bytes(hash, &bytes)?;
        Ok(bytes)
    }

    /// Re-hashes the stored bytes for `hash`.
    pub async fn verify(&self, hash: &ContentHash) -> Result<(), StorageError> {
        self.get_verified(hash).await.map(|_| ())
    }

    /// Looks up the stored record for `hash`.
    pub async fn handle(&self, hash: &ContentHash) -> Result<Option<ArtifactHandle>, StorageError> {
        let path = self.record_path(hash);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Metadata {
                    path,
                    message: e.to_string(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    /// Finds an artifact previously produced from inputs with `fingerprint`.
    ///
    /// An index entry whose blob has gone missing is reported as absent, so the
    /// caller recomputes instead of failing.
    pub async fn exists(&self, fingerprint: &Fingerprint) -> Result<Option<ArtifactHandle>, StorageError> {
        let Some(entry) = self.read_index(&self.fingerprint_path(fingerprint)).await? else {
            return Ok(None);
        };

        if !self.blob_exists(&entry.hash).await {
            warn!(
                fingerprint = %fingerprint.short(),
                hash = %entry.hash.short(),
                "Fingerprint index points at a missing blob"
            );
            return Ok(None);
        }

        self.handle(&entry.hash).await
    }

    /// Stores bytes that arrive with a known handle, e.g. from another run
    /// directory. The bytes must hash to the handle's identity.
    pub async fn import(&self, data: &[u8], handle: &ArtifactHandle) -> Result<ArtifactHandle, StorageError> {
        verify_bytes(&handle.hash, data)?;
        let mut request = PutRequest::new(handle.stage, handle.kind).deterministic(handle.deterministic);
        request.input_fingerprint = handle.input_fingerprint.clone();
        self.put(data, request).await
    }
}

/// Checks that `bytes` hash to `expected`.
pub fn verify_bytes(expected: &ContentHash, bytes: &[u8]) -> Result<(), StorageError> {
    let actual = ContentHash::of_bytes(bytes);
    if &actual != expected {
        return Err(StorageError::Corrupt {
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}

fn warn_if_repinned(fingerprint: &Fingerprint, pinned: &ContentHash, offered: &ContentHash) {
    if pinned != offered {
        warn!(
            fingerprint = %fingerprint.short(),
            pinned = %pinned.short(),
            offered = %offered.short(),
            "Fingerprint already pinned to a different artifact; keeping the first"
        );
    }
}
