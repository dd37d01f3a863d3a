//! Local store of downloaded patch payloads.
//!
//! Entries live at `<root>/patches/<platform>/<branch>/<relative path>.bsdiff`
//! and are trusted only while their hash matches the manifest. Stale or
//! missing entries are downloaded again and replaced atomically.
use crate::checksum::{hash_bytes, hash_file, ContentHash};
use crate::error::ReconcileError;
use crate::fetch::{fetch_with_retry, Fetch};
use crate::manifest::{FileRecord, ManifestScope};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

const PATCH_SUFFIX: &str = ".bsdiff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOrigin {
    Cached,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResolution {
    pub path: PathBuf,
    pub origin: CacheOrigin,
}

/// Patch cache for one manifest scope.
#[derive(Debug, Clone)]
pub struct PatchCache {
    scope_dir: PathBuf,
    attempts: u32,
}

impl PatchCache {
    pub fn new(cache_root: &Path, scope: &ManifestScope, attempts: u32) -> Self {
        let scope_dir = cache_root
            .join("patches")
            .join(&scope.platform)
            .join(&scope.branch);
        Self {
            scope_dir,
            attempts,
        }
    }

    /// Deterministic cache location for a relative path.
    pub fn entry_path(&self, relative_path: &str) -> PathBuf {
        let mut path = self.scope_dir.clone();
        path.extend(relative_path.split('/'));
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(PATCH_SUFFIX);
        path.set_file_name(name);
        path
    }

    /// Return a verified local copy of the record's patch, downloading it if needed.
    pub fn resolve<F: Fetch + ?Sized>(
        &self,
        record: &FileRecord,
        fetcher: &F,
    ) -> Result<CacheResolution, ReconcileError> {
        self.resolve_entry(&record.relative_path, &record.patch, &record.patch_url, fetcher)
    }

    pub fn resolve_entry<F: Fetch + ?Sized>(
        &self,
        relative_path: &str,
        expected: &ContentHash,
        url: &str,
        fetcher: &F,
    ) -> Result<CacheResolution, ReconcileError> {
        let path = self.entry_path(relative_path);
        if path.is_file() {
            let cached = hash_file(&path)
                .map_err(|err| ReconcileError::cache_access(&path, err.detail))?;
            if cached == *expected {
                tracing::info!(path = relative_path, "patch served from cache");
                return Ok(CacheResolution {
                    path,
                    origin: CacheOrigin::Cached,
                });
            }
            tracing::debug!(path = relative_path, cached = %cached, "cached patch stale");
        }

        let start = Instant::now();
        let bytes = fetch_with_retry(fetcher, url, self.attempts)?;
        let actual = hash_bytes(&bytes);
        if actual != *expected {
            return Err(ReconcileError::CorruptDownload {
                relative_path: relative_path.to_string(),
                expected: expected.clone(),
                actual,
            });
        }
        store_atomically(&path, &bytes)?;
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            bytes = bytes.len(),
            path = relative_path,
            "patch downloaded"
        );
        Ok(CacheResolution {
            path,
            origin: CacheOrigin::Downloaded,
        })
    }
}

fn store_atomically(path: &Path, bytes: &[u8]) -> Result<(), ReconcileError> {
    let parent = path
        .parent()
        .ok_or_else(|| ReconcileError::cache_access(path, "cache entry has no parent directory"))?;
    fs::create_dir_all(parent).map_err(|err| ReconcileError::cache_access(parent, err))?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(parent).map_err(|err| ReconcileError::cache_access(parent, err))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| ReconcileError::cache_access(tmp.path(), err))?;
    tmp.persist(path)
        .map_err(|err| ReconcileError::cache_access(path, err.error))?;
    Ok(())
}
