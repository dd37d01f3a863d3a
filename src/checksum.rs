//! Streaming SHA-256 content hashes.
//!
//! Every hash in the tool is an uppercase hex SHA-256 digest. A path that does
//! not exist hashes like the null device, so "absent" and "zero bytes" compare
//! equal to [`EMPTY_HASH`].
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Digest of zero-length content, used as the "file does not exist" sentinel.
pub const EMPTY_HASH: &str = "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";

/// Manifest spelling of the empty hash used by newer manifest revisions.
const NULL_HASH_ALIAS: &str = "null";

/// Read size for file hashing; bounds memory regardless of file size.
pub const HASH_BLOCK_SIZE: usize = 10 * 1024 * 1024;

const HASH_HEX_LEN: usize = 64;

/// Uppercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse a manifest hash, normalizing case and the `null` alias.
    pub fn parse(raw: &str) -> Result<Self, InvalidHash> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(NULL_HASH_ALIAS) {
            return Ok(Self::empty());
        }
        if trimmed.len() != HASH_HEX_LEN || !trimmed.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(InvalidHash(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// The canonical empty-content hash.
    pub fn empty() -> Self {
        Self(EMPTY_HASH.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0 == EMPTY_HASH
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = InvalidHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid SHA-256 hex digest {0:?}")]
pub struct InvalidHash(pub String);

/// Hashing failed for a reason other than the file being absent.
#[derive(Debug, Error)]
#[error("{}: {detail}", path.display())]
pub struct ChecksumError {
    pub path: PathBuf,
    pub detail: String,
}

/// Platform null device, read as empty content.
pub fn null_device() -> &'static Path {
    if cfg!(windows) {
        Path::new("NUL")
    } else {
        Path::new("/dev/null")
    }
}

/// Hash a file on disk, treating a missing file as empty content.
///
/// A path that cannot exist because one of its parents is a regular file
/// counts as missing too.
pub fn hash_file(path: &Path) -> Result<ContentHash, ChecksumError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
        {
            File::open(null_device()).map_err(|err| checksum_error(null_device(), &err))?
        }
        Err(err) => return Err(checksum_error(path, &err)),
    };
    hash_reader(file, HASH_BLOCK_SIZE).map_err(|err| checksum_error(path, &err))
}

/// Hash an in-memory payload.
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    ContentHash(hex::encode_upper(Sha256::digest(bytes)))
}

fn hash_reader<R: Read>(mut reader: R, block_size: usize) -> io::Result<ContentHash> {
    let mut hasher = Sha256::new();
    let mut block = vec![0u8; block_size];
    loop {
        let read = match reader.read(&mut block) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&block[..read]);
    }
    Ok(ContentHash(hex::encode_upper(hasher.finalize())))
}

fn checksum_error(path: &Path, err: &io::Error) -> ChecksumError {
    ChecksumError {
        path: path.to_path_buf(),
        detail: err.to_string(),
    }
}
