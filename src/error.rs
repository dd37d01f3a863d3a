//! Run-level error taxonomy.
//!
//! Every variant is fatal for the run. [`ErrorKind`] groups them by how an
//! operator recovers: fix the environment, restore the install, retry later,
//! or simply re-run after a partial patch.
use crate::checksum::ContentHash;
use crate::fetch::FetchError;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Environment,
    IntegrityMismatch,
    Network,
    PartialPatch,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read {}: {detail}", path.display())]
    Read { path: PathBuf, detail: String },

    #[error(
        "cannot access patch cache file {}: {detail} (check read/write permissions on the cache directory)",
        path.display()
    )]
    CacheAccess { path: PathBuf, detail: String },

    #[error(
        "cannot write target file {}: {detail} (check permissions on the installation directory)",
        path.display()
    )]
    TargetAccess { path: PathBuf, detail: String },

    #[error(
        "{} file(s) match neither the original nor the fixed checksum; verify or reinstall the installation: {}",
        paths.len(),
        paths.join(", ")
    )]
    IntegrityMismatch { paths: Vec<String> },

    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("downloaded payload for {relative_path} has checksum {actual}, expected {expected}")]
    CorruptDownload {
        relative_path: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("patched {relative_path} but result has checksum {actual}, expected {expected}")]
    PatchVerification {
        relative_path: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("patching stopped after {} file(s) were already patched: {source}", patched.len())]
    PartialPatch {
        patched: Vec<String>,
        source: Box<ReconcileError>,
    },
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Read { .. }
            | Self::CacheAccess { .. }
            | Self::TargetAccess { .. }
            | Self::PatchVerification { .. } => ErrorKind::Environment,
            Self::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            Self::Fetch(_) | Self::CorruptDownload { .. } => ErrorKind::Network,
            Self::PartialPatch { .. } => ErrorKind::PartialPatch,
        }
    }

    pub(crate) fn cache_access(path: impl Into<PathBuf>, detail: impl ToString) -> Self {
        Self::CacheAccess {
            path: path.into(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn target_access(path: impl Into<PathBuf>, detail: impl ToString) -> Self {
        Self::TargetAccess {
            path: path.into(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_group_by_recovery_path() {
        let read = ReconcileError::Read {
            path: PathBuf::from("a.bin"),
            detail: "denied".to_string(),
        };
        assert_eq!(read.kind(), ErrorKind::Environment);

        let fetch = ReconcileError::from(FetchError::Timeout {
            url: "https://example.invalid/a".to_string(),
        });
        assert_eq!(fetch.kind(), ErrorKind::Network);

        let partial = ReconcileError::PartialPatch {
            patched: vec!["a.bin".to_string()],
            source: Box::new(ReconcileError::target_access("b.bin", "denied")),
        };
        assert_eq!(partial.kind(), ErrorKind::PartialPatch);
        assert!(partial.to_string().contains("1 file(s)"));
    }

    #[test]
    fn access_errors_name_the_failing_side() {
        let cache = ReconcileError::cache_access("/cache/a.bsdiff", "permission denied");
        let target = ReconcileError::target_access("/game/a.bin", "permission denied");
        assert!(cache.to_string().contains("patch cache"));
        assert!(target.to_string().contains("target file"));
    }
}
