//! bsdiff patch application.
//!
//! `apply` is the raw delta step. `patch_in_place` prepares a target inside
//! the installation (optional wipe, empty-source substitution, access checks)
//! before calling it.
use crate::checksum::null_device;
use crate::error::ReconcileError;
use qbsdiff::Bspatch;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

/// Largest output buffer reserved up front from a patch header's size hint.
const MAX_PREALLOC_BYTES: u64 = 64 * 1024 * 1024;

/// Transform the bytes at `original` into `fixed` using the patch at `patch`.
///
/// The output replaces `fixed` atomically and keeps its permissions when it
/// already exists. Delta failures are reported against the target.
pub fn apply(original: &Path, fixed: &Path, patch: &Path) -> Result<(), ReconcileError> {
    let patch_bytes = fs::read(patch).map_err(|err| ReconcileError::cache_access(patch, err))?;
    let source = fs::read(original).map_err(|err| ReconcileError::target_access(original, err))?;
    let patcher =
        Bspatch::new(&patch_bytes).map_err(|err| ReconcileError::target_access(fixed, err))?;
    let reserve =
        usize::try_from(patcher.hint_target_size().min(MAX_PREALLOC_BYTES)).unwrap_or(0);
    let mut output = Vec::with_capacity(reserve);
    patcher
        .apply(&source, Cursor::new(&mut output))
        .map_err(|err| ReconcileError::target_access(fixed, err))?;
    replace_file(fixed, &output).map_err(|err| ReconcileError::target_access(fixed, err))
}

/// Apply a patch to a file inside the installation, reading and writing the same path.
pub fn patch_in_place(target: &Path, patch: &Path, wipe: bool) -> Result<(), ReconcileError> {
    if wipe {
        wipe_file(target)?;
    }
    let source = source_or_empty(target);
    ensure_openable(target)?;
    check_readable(patch).map_err(|err| ReconcileError::cache_access(patch, err))?;
    check_writable(target).map_err(|err| ReconcileError::target_access(target, err))?;
    apply(&source, target, patch)
}

/// Remove a file whose fixed state is "absent"; truncate it when removal is refused.
pub fn delete(target: &Path) -> Result<(), ReconcileError> {
    match fs::remove_file(target) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(remove_err) => {
            tracing::warn!(path = %target.display(), error = %remove_err, "remove failed, truncating");
            File::create(target)
                .map(|_| ())
                .map_err(|err| ReconcileError::target_access(target, err))
        }
    }
}

fn wipe_file(target: &Path) -> Result<(), ReconcileError> {
    match fs::remove_file(target) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ReconcileError::target_access(target, err)),
    }
}

/// The path to read delta input from: the file itself, or the null device when absent.
fn source_or_empty(path: &Path) -> PathBuf {
    if path.exists() {
        path.to_path_buf()
    } else {
        null_device().to_path_buf()
    }
}

fn ensure_openable(target: &Path) -> Result<(), ReconcileError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| ReconcileError::target_access(parent, err))?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(target)
        .map(|_| ())
        .map_err(|err| ReconcileError::target_access(target, err))
}

pub(crate) fn replace_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), metadata.permissions())?;
    }
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn check_readable(path: &Path) -> io::Result<()> {
    File::open(path).map(|_| ())
}

fn check_writable(path: &Path) -> io::Result<()> {
    OpenOptions::new().write(true).open(path).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbsdiff::Bsdiff;

    fn make_patch(source: &[u8], target: &[u8]) -> Vec<u8> {
        let mut patch = Vec::new();
        Bsdiff::new(source, target)
            .compare(Cursor::new(&mut patch))
            .expect("diff");
        patch
    }

    #[test]
    fn applies_patch_to_distinct_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("original.bin");
        let fixed = dir.path().join("out/fixed.bin");
        let patch = dir.path().join("p.bsdiff");
        fs::write(&original, b"hello original world").expect("write original");
        fs::write(&patch, make_patch(b"hello original world", b"hello fixed world!")).expect("write patch");
        fs::create_dir_all(fixed.parent().expect("parent")).expect("mkdir");

        apply(&original, &fixed, &patch).expect("apply");

        assert_eq!(fs::read(&fixed).expect("read fixed"), b"hello fixed world!");
        assert_eq!(fs::read(&original).expect("read original"), b"hello original world");
    }

    #[test]
    fn missing_source_patches_from_empty_and_creates_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("nested/dir/new.bin");
        let patch = dir.path().join("p.bsdiff");
        fs::write(&patch, make_patch(b"", b"brand new content")).expect("write patch");

        patch_in_place(&target, &patch, false).expect("patch");

        assert_eq!(fs::read(&target).expect("read"), b"brand new content");
    }

    #[test]
    fn wipe_discards_existing_content_before_patching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("b.bin");
        let patch = dir.path().join("p.bsdiff");
        fs::write(&target, b"unexpected leftovers").expect("write stray");
        fs::write(&patch, make_patch(b"", b"fixed from empty")).expect("write patch");

        patch_in_place(&target, &patch, true).expect("patch");

        assert_eq!(fs::read(&target).expect("read"), b"fixed from empty");
    }

    #[cfg(unix)]
    #[test]
    fn wipe_removes_the_stray_file_instead_of_rewriting_it() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("b.bin");
        let patch = dir.path().join("p.bsdiff");
        fs::write(&target, b"unexpected leftovers").expect("write stray");
        fs::set_permissions(&target, fs::Permissions::from_mode(0o700)).expect("chmod");
        fs::write(&patch, make_patch(b"", b"fixed from empty")).expect("write patch");

        patch_in_place(&target, &patch, true).expect("patch");

        // A rewrite in place would keep the stray file's mode.
        let mode = fs::metadata(&target).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o111, 0);
        assert_eq!(fs::read(&target).expect("read"), b"fixed from empty");
    }

    #[test]
    fn oversized_target_hint_does_not_abort() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("a.bin");
        let patch = dir.path().join("p.bsdiff");
        fs::write(&target, b"content").expect("write target");
        let mut header = b"BSDIFF40".to_vec();
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&(1u64 << 62).to_le_bytes());
        fs::write(&patch, header).expect("write patch");

        if let Err(err) = patch_in_place(&target, &patch, false) {
            assert!(matches!(err, ReconcileError::TargetAccess { .. }), "{err}");
        }
    }

    #[test]
    fn corrupt_patch_is_a_target_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("a.bin");
        let patch = dir.path().join("p.bsdiff");
        fs::write(&target, b"content").expect("write target");
        fs::write(&patch, b"not a bsdiff payload").expect("write patch");

        let err = patch_in_place(&target, &patch, false).expect_err("bad patch");
        assert!(matches!(err, ReconcileError::TargetAccess { .. }));
        assert_eq!(fs::read(&target).expect("read"), b"content");
    }

    #[test]
    fn missing_patch_is_a_cache_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("a.bin");
        fs::write(&target, b"content").expect("write target");

        let err = patch_in_place(&target, &dir.path().join("absent.bsdiff"), false)
            .expect_err("no patch");
        assert!(matches!(err, ReconcileError::CacheAccess { .. }));
    }

    #[test]
    fn delete_removes_file_and_tolerates_absence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("gone.bin");
        fs::write(&target, b"obsolete").expect("write");

        delete(&target).expect("delete");
        assert!(!target.exists());
        delete(&target).expect("already absent");
    }

    #[cfg(unix)]
    #[test]
    fn replace_keeps_existing_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("tool");
        let patch = dir.path().join("p.bsdiff");
        fs::write(&target, b"v1").expect("write");
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).expect("chmod");
        fs::write(&patch, make_patch(b"v1", b"v2")).expect("write patch");

        patch_in_place(&target, &patch, false).expect("patch");

        let mode = fs::metadata(&target).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(fs::read(&target).expect("read"), b"v2");
    }
}
