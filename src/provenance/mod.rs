//! Provenance: the append-only manifest, the run-directory lease and the run
//! README.

pub mod lease;
pub mod manifest;
pub mod readme;

pub use lease::{LeaseError, LeaseInfo, LeaseState, RunLease};
pub use manifest::{
    EntryStatus, ErrorDetail, Manifest, ManifestEntry, ManifestError, ManifestJournal,
    ManifestWriter,
};
pub use readme::render_readme;
