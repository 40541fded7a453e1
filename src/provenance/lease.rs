//! Exclusive lease on a run directory.
//!
//! A run directory is owned by exactly one orchestrator. The lease is a
//! `.lease` file created with `create_new`, so a second acquirer fails
//! instead of silently sharing the directory. Dropping the lease removes it.
//!
//! A holder killed before its drop runs leaves the file behind. Such a
//! lease is stale once its pid no longer names a live process (or, where
//! liveness cannot be checked, once it is older than [`STALE_AFTER_HOURS`]),
//! and stale leases are reclaimed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Age after which a lease whose holder cannot be checked counts as stale.
pub const STALE_AFTER_HOURS: i64 = 24;

/// Grace period for a lease file that exists but cannot be parsed yet.
const UNREADABLE_GRACE_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("Run directory is already leased ({path}){}", holder_suffix(.holder))]
    Held {
        path: PathBuf,
        holder: Option<LeaseInfo>,
    },

    #[error("Lease I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn holder_suffix(holder: &Option<LeaseInfo>) -> String {
    match holder {
        Some(info) => format!(
            " by run {} (pid {}) since {}",
            info.run_id,
            info.pid,
            info.acquired_at.to_rfc3339()
        ),
        None => String::new(),
    }
}

impl LeaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LeaseError::Held { .. } => ErrorKind::Config,
            LeaseError::Io { .. } => ErrorKind::StorageIo,
        }
    }
}

/// Contents of a lease file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub run_id: String,
    pub owner: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LeaseInfo {
    /// Whether the process that wrote this lease may still be running.
    pub fn holder_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }
        match process_exists(self.pid) {
            Some(alive) => alive,
            None => Utc::now() - self.acquired_at < Duration::hours(STALE_AFTER_HOURS),
        }
    }
}

#[cfg(target_os = "linux")]
fn process_exists(pid: u32) -> Option<bool> {
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() {
        return None;
    }
    Some(proc_root.join(pid.to_string()).exists())
}

#[cfg(not(target_os = "linux"))]
fn process_exists(_pid: u32) -> Option<bool> {
    None
}

/// What a lease path currently holds.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseState {
    Free,
    /// Held by a live (or not yet readable) owner.
    Live(Option<LeaseInfo>),
    /// Left behind by an owner that is gone.
    Stale(Option<LeaseInfo>),
}

/// Held lease; released on drop.
#[derive(Debug)]
pub struct RunLease {
    path: PathBuf,
    info: LeaseInfo,
}

impl RunLease {
    /// Takes the lease at `path`.
    ///
    /// # Errors
    ///
    /// `LeaseError::Held` when another owner holds it.
    pub fn acquire(path: impl Into<PathBuf>, run_id: &str) -> Result<Self, LeaseError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LeaseError::Io {
                path: path.clone(),
                source,
            })?;
        }

        let mut reclaimed = false;
        let mut file = loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match Self::inspect(&path) {
                    LeaseState::Live(holder) => return Err(LeaseError::Held { path, holder }),
                    _ if reclaimed => {
                        return Err(LeaseError::Held {
                            holder: Self::read(&path),
                            path,
                        })
                    }
                    LeaseState::Stale(_) => {
                        Self::reclaim_if_stale(&path)?;
                        reclaimed = true;
                    }
                    // Released between the open and the inspect.
                    LeaseState::Free => reclaimed = true,
                },
                Err(source) => return Err(LeaseError::Io { path, source }),
            }
        };

        let info = LeaseInfo {
            run_id: run_id.to_string(),
            owner: Uuid::new_v4(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&info).map_err(|e| LeaseError::Io {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        file.write_all(&body)
            .and_then(|_| file.sync_all())
            .map_err(|source| LeaseError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), run_id = run_id, "Lease acquired");
        Ok(Self { path, info })
    }

    /// Reads the holder of an existing lease, if parsable.
    pub fn read(path: &Path) -> Option<LeaseInfo> {
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Classifies the lease at `path`.
    pub fn inspect(path: &Path) -> LeaseState {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => return LeaseState::Free,
        };
        match Self::read(path) {
            Some(info) if info.holder_alive() => LeaseState::Live(Some(info)),
            Some(info) => LeaseState::Stale(Some(info)),
            None => {
                let age = metadata
                    .modified()
                    .ok()
                    .map(|modified| Utc::now() - DateTime::<Utc>::from(modified));
                match age {
                    Some(age) if age > Duration::seconds(UNREADABLE_GRACE_SECS) => LeaseState::Stale(None),
                    _ => LeaseState::Live(None),
                }
            }
        }
    }

    /// Whether a live owner holds the lease at `path`.
    pub fn is_held(path: &Path) -> bool {
        matches!(Self::inspect(path), LeaseState::Live(_))
    }

    /// Removes the lease at `path` if its owner is gone. Returns whether a
    /// lease was removed.
    pub fn reclaim_if_stale(path: &Path) -> Result<bool, LeaseError> {
        match Self::inspect(path) {
            LeaseState::Stale(holder) => {
                warn!(
                    path = %path.display(),
                    run_id = holder.as_ref().map(|h| h.run_id.as_str()).unwrap_or("unknown"),
                    pid = holder.as_ref().map(|h| h.pid),
                    "Reclaiming stale lease"
                );
                Self::remove(path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes the lease at `path` whoever holds it.
    pub fn break_lease(path: &Path) -> Result<bool, LeaseError> {
        if let LeaseState::Free = Self::inspect(path) {
            return Ok(false);
        }
        warn!(path = %path.display(), holder = ?Self::read(path), "Breaking lease");
        Self::remove(path)?;
        Ok(true)
    }

    fn remove(path: &Path) -> Result<(), LeaseError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LeaseError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        // Only remove the file if it is still ours.
        if Self::read(&self.path).is_some_and(|held| held.owner == self.info.owner) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to release lease");
            }
        }
    }
}
