//! Durable, content-addressed storage.
//!
//! - **Hashes**: [`ContentHash`] identifies bytes, [`Fingerprint`] identifies
//!   the inputs of a computation
//! - **Atomic writes**: every file is replaced via temp file + fsync + rename
//! - **Artifacts**: [`ArtifactStore`] keeps each distinct artifact exactly once
//!
//! # Usage
//!
//! ```rust,ignore
//! use analysis_forge::storage::{ArtifactKind, ArtifactStore, Fingerprint, PutRequest};
//! use analysis_forge::pipeline::StageName;
//!
//! let store = ArtifactStore::open("experiment/.forge/store").await?;
//! let fp = Fingerprint::builder("analysis").field("document", &doc_hash).finish();
//!
//! if let Some(handle) = store.exists(&fp).await? {
//!     // already computed
//! }
//! let handle = store
//!     .put(&bytes, PutRequest::new(StageName::Analysis, ArtifactKind::RawAnalysis).with_fingerprint(fp))
//!     .await?;
//! ```

pub mod artifacts;
pub mod atomic;
pub mod hash;

pub use artifacts::{verify_bytes, ArtifactHandle, ArtifactKind, ArtifactStore, PutRequest, StorageError};
pub use atomic::{write_atomic, write_json_atomic, write_new_atomic};
pub use hash::{canonical_json, canonical_json_pretty, sha256_hex, ContentHash, Fingerprint, FingerprintBuilder};
