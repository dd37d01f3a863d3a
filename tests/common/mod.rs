//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use assetpatch::checksum::hash_bytes;
use assetpatch::fetch::StaticFetcher;
use assetpatch::manifest::{Manifest, ManifestScope};
use qbsdiff::Bsdiff;
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const PLATFORM: &str = "linux";
pub const BRANCH: &str = "public";

/// Build a real bsdiff patch turning `source` into `target`.
pub fn make_patch(source: &[u8], target: &[u8]) -> Vec<u8> {
    let mut patch = Vec::new();
    Bsdiff::new(source, target)
        .compare(Cursor::new(&mut patch))
        .expect("generate patch");
    patch
}

/// An installation root, a patch cache, and a directory of published
/// patches served over `file://` URLs.
pub struct Fixture {
    pub root: TempDir,
    pub cache: TempDir,
    pub published: TempDir,
    records: Map<String, Value>,
    payloads: Vec<(String, Vec<u8>)>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("root tempdir"),
            cache: tempfile::tempdir().expect("cache tempdir"),
            published: tempfile::tempdir().expect("published tempdir"),
            records: Map::new(),
            payloads: Vec::new(),
        }
    }

    pub fn root_path(&self) -> &Path {
        self.root.path()
    }

    pub fn cache_path(&self) -> &Path {
        self.cache.path()
    }

    pub fn target(&self, relative_path: &str) -> PathBuf {
        let mut path = self.root.path().to_path_buf();
        path.extend(relative_path.split('/'));
        path
    }

    pub fn write_target(&self, relative_path: &str, bytes: &[u8]) {
        let path = self.target(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create target parent");
        }
        fs::write(path, bytes).expect("write target");
    }

    pub fn read_target(&self, relative_path: &str) -> Option<Vec<u8>> {
        fs::read(self.target(relative_path)).ok()
    }

    /// Add a record patching `original` (or nothing, for `None`) into `fixed`.
    pub fn add_patch_record(&mut self, relative_path: &str, original: Option<&[u8]>, fixed: &[u8]) {
        let patch = make_patch(original.unwrap_or_default(), fixed);
        self.add_record_with_patch(relative_path, original, fixed, &patch);
    }

    /// Add a record served with arbitrary patch bytes; the manifest hash
    /// matches them, so only applying them can fail.
    pub fn add_record_with_patch(
        &mut self,
        relative_path: &str,
        original: Option<&[u8]>,
        fixed: &[u8],
        patch: &[u8],
    ) {
        let original_hash = match original {
            Some(bytes) => hash_bytes(bytes).to_string(),
            None => "null".to_string(),
        };
        let url = self.publish(relative_path, patch);
        self.records.insert(
            relative_path.to_string(),
            json!({
                "original": original_hash,
                "fixed": hash_bytes(fixed).to_string(),
                "patch": hash_bytes(patch).to_string(),
                "patch-url": url,
            }),
        );
    }

    /// Add a record whose fixed state is "absent".
    pub fn add_delete_record(&mut self, relative_path: &str, original: &[u8]) {
        self.records.insert(
            relative_path.to_string(),
            json!({
                "original": hash_bytes(original).to_string(),
                "fixed": "null",
                "patch": "null",
                "patch-url": "https://patches.invalid/unused",
            }),
        );
    }

    /// Mark an existing record as executable.
    pub fn set_executable(&mut self, relative_path: &str) {
        let record = self
            .records
            .get_mut(relative_path)
            .and_then(Value::as_object_mut)
            .expect("record exists");
        record.insert("executable".to_string(), Value::String("true".to_string()));
    }

    /// Point a record at a URL nothing serves.
    pub fn break_patch_url(&mut self, relative_path: &str) {
        let record = self
            .records
            .get_mut(relative_path)
            .and_then(Value::as_object_mut)
            .expect("record exists");
        let url = format!("https://patches.invalid/missing/{relative_path}.bsdiff");
        record.insert("patch-url".to_string(), Value::String(url));
    }

    pub fn manifest_json(&self) -> String {
        let mut branches = Map::new();
        branches.insert(BRANCH.to_string(), Value::Object(self.records.clone()));
        let mut platforms = Map::new();
        platforms.insert(PLATFORM.to_string(), Value::Object(branches));
        serde_json::to_string_pretty(&Value::Object(platforms)).expect("serialize manifest")
    }

    /// Write the manifest next to the published patches and return its path.
    pub fn write_manifest(&self) -> PathBuf {
        let path = self.published.path().join("manifest.json");
        fs::write(&path, self.manifest_json()).expect("write manifest");
        path
    }

    pub fn scope(&self) -> ManifestScope {
        Manifest::parse_str(&self.manifest_json())
            .expect("parse manifest")
            .scope(PLATFORM, BRANCH)
            .expect("scope")
            .clone()
    }

    /// In-memory fetcher serving every published patch.
    pub fn fetcher(&self) -> StaticFetcher {
        let mut fetcher = StaticFetcher::new();
        for (url, bytes) in &self.payloads {
            fetcher.insert(url.clone(), bytes.clone());
        }
        fetcher
    }

    fn publish(&mut self, relative_path: &str, patch: &[u8]) -> String {
        let name = format!("{}.bsdiff", relative_path.replace('/', "_"));
        let path = self.published.path().join(name);
        fs::write(&path, patch).expect("publish patch");
        let url = file_url(&path);
        self.payloads.push((url.clone(), patch.to_vec()));
        url
    }
}

pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}
