//! Patch and manifest generation.
//!
//! Diffs an original tree against a fixed tree, writes one `.bsdiff` per
//! changed file under the output directory, and records the scope in
//! `<out>/manifest.json`. Other scopes already present in that manifest are
//! kept, so one manifest can be built up platform by platform.
use crate::apply::replace_file;
use crate::checksum::{hash_file, ContentHash};
use crate::classify::target_path;
use crate::manifest::{is_absolute_url, is_safe_relative_path, Manifest, ManifestError};
use qbsdiff::Bsdiff;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "manifest.json";
const PATCH_SUFFIX: &str = ".bsdiff";
const NULL_HASH: &str = "null";

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("original and fixed trees are the same directory: {}", .0.display())]
    SameRoots(PathBuf),
    #[error("base URL {0:?} is not absolute")]
    RelativeBaseUrl(String),
    #[error("{}: {detail}", path.display())]
    Io { path: PathBuf, detail: String },
    #[error("{0:?} cannot be used as a manifest path")]
    UnsupportedPath(String),
    #[error("diff {relative_path}: {detail}")]
    Diff {
        relative_path: String,
        detail: String,
    },
    #[error("existing manifest {}: {detail}", path.display())]
    ExistingManifest { path: PathBuf, detail: String },
    #[error("generated manifest does not load: {0}")]
    InvalidOutput(#[from] ManifestError),
    #[error("build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    pub platform: String,
    pub branch: String,
    /// URL the output directory will be served from.
    pub base_url: String,
    pub threads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerateSummary {
    pub manifest_path: PathBuf,
    pub patched: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
}

enum Generated {
    Unchanged,
    Patch { relative_path: String, record: Value },
    Delete { relative_path: String, record: Value },
}

pub fn generate(
    original_root: &Path,
    fixed_root: &Path,
    out_dir: &Path,
    options: &GenerateOptions,
) -> Result<GenerateSummary, GenerateError> {
    if !is_absolute_url(&options.base_url) {
        return Err(GenerateError::RelativeBaseUrl(options.base_url.clone()));
    }
    let original_root = canonical_dir(original_root)?;
    let fixed_root = canonical_dir(fixed_root)?;
    if original_root == fixed_root {
        return Err(GenerateError::SameRoots(original_root));
    }

    let start = Instant::now();
    let mut paths = BTreeSet::new();
    collect_relative_files(&original_root, &original_root, &mut paths)?;
    collect_relative_files(&fixed_root, &fixed_root, &mut paths)?;
    let paths: Vec<String> = paths.into_iter().collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.threads.max(1))
        .thread_name(|index| format!("diff-{index}"))
        .build()?;
    let base_url = options.base_url.trim_end_matches('/');
    let results: Vec<Result<Generated, GenerateError>> = pool.install(|| {
        paths
            .par_iter()
            .map(|relative_path| {
                diff_one(relative_path, &original_root, &fixed_root, out_dir, base_url)
            })
            .collect()
    });

    let mut records = Map::new();
    let mut summary = GenerateSummary {
        manifest_path: out_dir.join(MANIFEST_FILE),
        patched: Vec::new(),
        deleted: Vec::new(),
        unchanged: 0,
    };
    for result in results {
        match result? {
            Generated::Unchanged => summary.unchanged += 1,
            Generated::Patch {
                relative_path,
                record,
            } => {
                records.insert(relative_path.clone(), record);
                summary.patched.push(relative_path);
            }
            Generated::Delete {
                relative_path,
                record,
            } => {
                records.insert(relative_path.clone(), record);
                summary.deleted.push(relative_path);
            }
        }
    }

    write_manifest(&summary.manifest_path, options, records)?;
    tracing::info!(
        elapsed_ms = start.elapsed().as_millis(),
        patched = summary.patched.len(),
        deleted = summary.deleted.len(),
        unchanged = summary.unchanged,
        "manifest generated"
    );
    Ok(summary)
}

fn diff_one(
    relative_path: &str,
    original_root: &Path,
    fixed_root: &Path,
    out_dir: &Path,
    base_url: &str,
) -> Result<Generated, GenerateError> {
    let original_path = target_path(original_root, relative_path);
    let fixed_path = target_path(fixed_root, relative_path);
    let original = hash_file(&original_path).map_err(|err| io_error(err.path, err.detail))?;
    let fixed = hash_file(&fixed_path).map_err(|err| io_error(err.path, err.detail))?;
    if original == fixed {
        return Ok(Generated::Unchanged);
    }
    let patch_url = format!("{base_url}/{relative_path}{PATCH_SUFFIX}");

    if fixed.is_empty() {
        tracing::debug!(path = relative_path, "delete record");
        return Ok(Generated::Delete {
            relative_path: relative_path.to_string(),
            record: json!({
                "original": manifest_hash(&original),
                "fixed": NULL_HASH,
                "patch": NULL_HASH,
                "patch-url": patch_url,
            }),
        });
    }

    let source = read_or_empty(&original_path)?;
    let target = fs::read(&fixed_path).map_err(|err| io_error(&fixed_path, err))?;
    let mut patch = Vec::new();
    Bsdiff::new(&source, &target)
        .compare(Cursor::new(&mut patch))
        .map_err(|err| GenerateError::Diff {
            relative_path: relative_path.to_string(),
            detail: err.to_string(),
        })?;

    let mut patch_path = target_path(out_dir, relative_path);
    let mut name = patch_path.file_name().unwrap_or_default().to_os_string();
    name.push(PATCH_SUFFIX);
    patch_path.set_file_name(name);
    if let Some(parent) = patch_path.parent() {
        fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
    }
    replace_file(&patch_path, &patch).map_err(|err| io_error(&patch_path, err))?;
    tracing::debug!(path = relative_path, bytes = patch.len(), "patch written");

    let mut record = json!({
        "original": manifest_hash(&original),
        "fixed": manifest_hash(&fixed),
        "patch": crate::checksum::hash_bytes(&patch).to_string(),
        "patch-url": patch_url,
    });
    if is_executable(&fixed_path) {
        record["executable"] = Value::String("true".to_string());
    }
    Ok(Generated::Patch {
        relative_path: relative_path.to_string(),
        record,
    })
}

/// Merge the scope into any manifest already at `path` and write it back.
fn write_manifest(
    path: &Path,
    options: &GenerateOptions,
    records: Map<String, Value>,
) -> Result<(), GenerateError> {
    let mut root = match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(existing(path, "top level is not an object")),
            Err(err) => return Err(existing(path, err)),
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Map::new(),
        Err(err) => return Err(io_error(path, err)),
    };
    let branches = root
        .entry(options.platform.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(branches) = branches else {
        return Err(existing(
            path,
            format!("platform {:?} is not an object", options.platform),
        ));
    };
    branches.insert(options.branch.clone(), Value::Object(records));

    let bytes = serde_json::to_vec_pretty(&Value::Object(root))
        .map_err(|err| io_error(path, err))?;
    Manifest::from_slice(&bytes)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
    }
    replace_file(path, &bytes).map_err(|err| io_error(path, err))
}

fn collect_relative_files(
    root: &Path,
    dir: &Path,
    out: &mut BTreeSet<String>,
) -> Result<(), GenerateError> {
    for entry in fs::read_dir(dir).map_err(|err| io_error(dir, err))? {
        let path = entry.map_err(|err| io_error(dir, err))?.path();
        if path.is_dir() {
            collect_relative_files(root, &path, out)?;
        } else if path.is_file() {
            out.insert(relative_name(root, &path)?);
        }
    }
    Ok(())
}

fn relative_name(root: &Path, path: &Path) -> Result<String, GenerateError> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let segments: Option<Vec<&str>> = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect();
    let name = segments
        .map(|segments| segments.join("/"))
        .ok_or_else(|| GenerateError::UnsupportedPath(relative.to_string_lossy().into_owned()))?;
    if !is_safe_relative_path(&name) {
        return Err(GenerateError::UnsupportedPath(name));
    }
    Ok(name)
}

fn canonical_dir(path: &Path) -> Result<PathBuf, GenerateError> {
    let canonical = fs::canonicalize(path).map_err(|err| io_error(path, err))?;
    if !canonical.is_dir() {
        return Err(io_error(path, "not a directory"));
    }
    Ok(canonical)
}

fn read_or_empty(path: &Path) -> Result<Vec<u8>, GenerateError> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(io_error(path, err)),
    }
}

/// Absent files are spelled `"null"` rather than the empty digest.
fn manifest_hash(hash: &ContentHash) -> String {
    if hash.is_empty() {
        NULL_HASH.to_string()
    } else {
        hash.to_string()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

fn io_error(path: impl Into<PathBuf>, detail: impl ToString) -> GenerateError {
    GenerateError::Io {
        path: path.into(),
        detail: detail.to_string(),
    }
}

fn existing(path: &Path, detail: impl ToString) -> GenerateError {
    GenerateError::ExistingManifest {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(base_url: &str) -> GenerateOptions {
        GenerateOptions {
            platform: "linux".to_string(),
            branch: "public".to_string(),
            base_url: base_url.to_string(),
            threads: 2,
        }
    }

    #[test]
    fn rejects_relative_base_url_and_identical_roots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out");

        let err = generate(dir.path(), dir.path(), &out, &options("patches/"))
            .expect_err("relative url");
        assert!(matches!(err, GenerateError::RelativeBaseUrl(_)));

        let err = generate(dir.path(), dir.path(), &out, &options("https://cdn.invalid/p"))
            .expect_err("same roots");
        assert!(matches!(err, GenerateError::SameRoots(_)));
    }

    #[test]
    fn absent_hashes_are_written_as_null() {
        assert_eq!(manifest_hash(&ContentHash::empty()), "null");
        let hash = crate::checksum::hash_bytes(b"abc");
        assert_eq!(manifest_hash(&hash), hash.to_string());
    }

    #[test]
    fn existing_scopes_survive_regeneration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("original");
        let fixed = dir.path().join("fixed");
        let out = dir.path().join("out");
        fs::create_dir_all(&original).expect("mkdir original");
        fs::create_dir_all(&fixed).expect("mkdir fixed");
        fs::write(original.join("a.bin"), b"old").expect("write original");
        fs::write(fixed.join("a.bin"), b"new").expect("write fixed");

        let mut opts = options("https://cdn.invalid/patches");
        generate(&original, &fixed, &out, &opts).expect("public");
        opts.branch = "x86-64".to_string();
        let summary = generate(&original, &fixed, &out, &opts).expect("x86-64");

        let bytes = fs::read(&summary.manifest_path).expect("read manifest");
        let manifest = Manifest::from_slice(&bytes).expect("load");
        assert_eq!(manifest.branches("linux"), vec!["public", "x86-64"]);
        let record = manifest
            .scope("linux", "x86-64")
            .expect("scope")
            .get("a.bin")
            .cloned()
            .expect("record");
        assert_eq!(record.patch_url, "https://cdn.invalid/patches/a.bin.bsdiff");
        assert!(out.join("a.bin.bsdiff").is_file());
    }

    #[test]
    fn unrelated_json_is_not_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("original");
        let fixed = dir.path().join("fixed");
        let out = dir.path().join("out");
        fs::create_dir_all(&original).expect("mkdir original");
        fs::create_dir_all(&fixed).expect("mkdir fixed");
        fs::create_dir_all(&out).expect("mkdir out");
        fs::write(out.join(MANIFEST_FILE), b"[1, 2, 3]").expect("write junk");

        let err = generate(&original, &fixed, &out, &options("https://cdn.invalid/p"))
            .expect_err("junk manifest");
        assert!(matches!(err, GenerateError::ExistingManifest { .. }));
        assert_eq!(
            fs::read(out.join(MANIFEST_FILE)).expect("read"),
            b"[1, 2, 3]"
        );
    }
}
