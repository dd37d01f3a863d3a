//! Per-file integrity classification.
use crate::checksum::{hash_file, ContentHash};
use crate::manifest::{FileRecord, ManifestScope};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    AlreadyFixed,
    NeedsFix,
    NeedsWipeAndFix,
    NeedsDelete,
    Mismatch,
    ReadError,
}

impl FileState {
    pub fn label(self) -> &'static str {
        match self {
            Self::AlreadyFixed => "Already Fixed",
            Self::NeedsFix => "Needs Fix",
            Self::NeedsWipeAndFix => "Needs Wipe + Fix",
            Self::NeedsDelete => "Needs Delete",
            Self::Mismatch => "Checksum Mismatch",
            Self::ReadError => "Read Error",
        }
    }

    /// States that put the file into the reconciliation plan.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::NeedsFix | Self::NeedsWipeAndFix | Self::NeedsDelete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub relative_path: String,
    pub state: FileState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<ContentHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Join a manifest-relative (`/`-separated) path onto a root directory.
pub fn target_path(root: &Path, relative_path: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(relative_path.split('/'));
    path
}

/// Decide the state of a file given its current hash.
///
/// An empty `original` short-circuits to a wipe before the mismatch check:
/// such files did not ship with the install, so any content found there is
/// replaced rather than trusted.
pub fn decide(record: &FileRecord, current: &ContentHash) -> FileState {
    if *current == record.fixed {
        FileState::AlreadyFixed
    } else if *current == record.original {
        if record.fixed.is_empty() {
            FileState::NeedsDelete
        } else {
            FileState::NeedsFix
        }
    } else if record.original.is_empty() {
        FileState::NeedsWipeAndFix
    } else {
        FileState::Mismatch
    }
}

pub fn classify_file(root: &Path, record: &FileRecord) -> Classification {
    let path = target_path(root, &record.relative_path);
    match hash_file(&path) {
        Ok(current) => Classification {
            relative_path: record.relative_path.clone(),
            state: decide(record, &current),
            current: Some(current),
            detail: None,
        },
        Err(err) => Classification {
            relative_path: record.relative_path.clone(),
            state: FileState::ReadError,
            current: None,
            detail: Some(err.detail),
        },
    }
}

/// Classify every file in the scope on the given pool; results keep manifest order.
pub fn classify_all(
    pool: &rayon::ThreadPool,
    scope: &ManifestScope,
    root: &Path,
) -> Vec<Classification> {
    let records: Vec<&FileRecord> = scope.records().collect();
    pool.install(|| {
        records
            .par_iter()
            .map(|record| {
                let result = classify_file(root, record);
                tracing::debug!(
                    path = %result.relative_path,
                    state = result.state.label(),
                    "classified"
                );
                result
            })
            .collect()
    })
}
