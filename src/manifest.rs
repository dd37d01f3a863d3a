//! Typed patch manifest.
//!
//! The remote manifest is a nested JSON object
//! `platform -> branch -> relative path -> record`. It is validated once at
//! load time so later stages never deal with missing keys or malformed hashes.
use crate::checksum::{ContentHash, InvalidHash};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("parse manifest JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{platform}/{branch}/{path}: missing required field {field:?}")]
    MissingField {
        platform: String,
        branch: String,
        path: String,
        field: &'static str,
    },
    #[error("{platform}/{branch}/{path}: field {field:?}: {source}")]
    InvalidHash {
        platform: String,
        branch: String,
        path: String,
        field: &'static str,
        source: InvalidHash,
    },
    #[error("{platform}/{branch}/{path}: patch-url {url:?} is not an absolute URL")]
    RelativeUrl {
        platform: String,
        branch: String,
        path: String,
        url: String,
    },
    #[error("{platform}/{branch}: invalid relative path {path:?}")]
    InvalidPath {
        platform: String,
        branch: String,
        path: String,
    },
    #[error("{platform}/{branch}/{path}: executable must be \"true\" or \"false\" (got {value:?})")]
    InvalidExecutable {
        platform: String,
        branch: String,
        path: String,
        value: String,
    },
    #[error("platform {0:?} is not present in the manifest")]
    UnknownPlatform(String),
    #[error("branch {branch:?} is not present in the manifest for platform {platform:?}")]
    UnknownBranch { platform: String, branch: String },
}

/// One patchable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub relative_path: String,
    pub original: ContentHash,
    pub fixed: ContentHash,
    pub patch: ContentHash,
    pub patch_url: String,
    pub executable: bool,
}

/// Files for a single platform + branch, in relative-path order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestScope {
    pub platform: String,
    pub branch: String,
    files: BTreeMap<String, FileRecord>,
}

impl ManifestScope {
    pub fn new(platform: &str, branch: &str, records: Vec<FileRecord>) -> Self {
        let files = records
            .into_iter()
            .map(|record| (record.relative_path.clone(), record))
            .collect();
        Self {
            platform: platform.to_string(),
            branch: branch.to_string(),
            files,
        }
    }

    /// Records in manifest order.
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileRecord> {
        self.files.get(relative_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Fully validated manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    platforms: BTreeMap<String, BTreeMap<String, ManifestScope>>,
}

#[derive(Deserialize)]
struct RawRecord {
    original: Option<String>,
    fixed: Option<String>,
    patch: Option<String>,
    #[serde(rename = "patch-url")]
    patch_url: Option<String>,
    executable: Option<RawFlag>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlag {
    Bool(bool),
    Text(String),
}

/// JSON object whose keys must be unique; serde_json alone keeps the last duplicate.
struct UniqueKeys<V>(BTreeMap<String, V>);

impl<'de, V: Deserialize<'de>> Deserialize<'de> for UniqueKeys<V> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct UniqueKeysVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for UniqueKeysVisitor<V> {
            type Value = UniqueKeys<V>;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a JSON object with unique keys")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut values = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, V>()? {
                    if values.contains_key(&key) {
                        return Err(de::Error::custom(format!("duplicate key {key:?}")));
                    }
                    values.insert(key, value);
                }
                Ok(UniqueKeys(values))
            }
        }

        deserializer.deserialize_map(UniqueKeysVisitor(PhantomData))
    }
}

type RawManifest = UniqueKeys<UniqueKeys<UniqueKeys<RawRecord>>>;

impl Manifest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_json::from_slice(bytes)?;
        let mut platforms = BTreeMap::new();
        for (platform, branches) in raw.0 {
            let mut scopes = BTreeMap::new();
            for (branch, files) in branches.0 {
                let mut records = Vec::with_capacity(files.0.len());
                for (path, raw_record) in files.0 {
                    let ctx = RecordContext {
                        platform: &platform,
                        branch: &branch,
                        path: &path,
                    };
                    records.push(ctx.validate(raw_record)?);
                }
                let scope = ManifestScope::new(&platform, &branch, records);
                scopes.insert(branch, scope);
            }
            platforms.insert(platform, scopes);
        }
        Ok(Self { platforms })
    }

    pub fn parse_str(text: &str) -> Result<Self, ManifestError> {
        Self::from_slice(text.as_bytes())
    }

    /// Select the files for one platform and branch.
    pub fn scope(&self, platform: &str, branch: &str) -> Result<&ManifestScope, ManifestError> {
        let branches = self
            .platforms
            .get(platform)
            .ok_or_else(|| ManifestError::UnknownPlatform(platform.to_string()))?;
        branches
            .get(branch)
            .ok_or_else(|| ManifestError::UnknownBranch {
                platform: platform.to_string(),
                branch: branch.to_string(),
            })
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.platforms.keys().map(String::as_str)
    }

    pub fn branches(&self, platform: &str) -> Vec<&str> {
        self.platforms
            .get(platform)
            .map(|branches| branches.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

struct RecordContext<'a> {
    platform: &'a str,
    branch: &'a str,
    path: &'a str,
}

impl RecordContext<'_> {
    fn validate(&self, raw: RawRecord) -> Result<FileRecord, ManifestError> {
        if !is_safe_relative_path(self.path) {
            return Err(ManifestError::InvalidPath {
                platform: self.platform.to_string(),
                branch: self.branch.to_string(),
                path: self.path.to_string(),
            });
        }
        let original = self.hash("original", raw.original)?;
        let fixed = self.hash("fixed", raw.fixed)?;
        let patch = self.hash("patch", raw.patch)?;
        let patch_url = self.required("patch-url", raw.patch_url)?;
        if !is_absolute_url(&patch_url) {
            return Err(ManifestError::RelativeUrl {
                platform: self.platform.to_string(),
                branch: self.branch.to_string(),
                path: self.path.to_string(),
                url: patch_url,
            });
        }
        let executable = match raw.executable {
            None => false,
            Some(RawFlag::Bool(flag)) => flag,
            Some(RawFlag::Text(text)) => match text.as_str() {
                "true" => true,
                "false" => false,
                _ => {
                    return Err(ManifestError::InvalidExecutable {
                        platform: self.platform.to_string(),
                        branch: self.branch.to_string(),
                        path: self.path.to_string(),
                        value: text,
                    })
                }
            },
        };
        Ok(FileRecord {
            relative_path: self.path.to_string(),
            original,
            fixed,
            patch,
            patch_url,
            executable,
        })
    }

    fn required(&self, field: &'static str, value: Option<String>) -> Result<String, ManifestError> {
        value.ok_or_else(|| ManifestError::MissingField {
            platform: self.platform.to_string(),
            branch: self.branch.to_string(),
            path: self.path.to_string(),
            field,
        })
    }

    fn hash(&self, field: &'static str, value: Option<String>) -> Result<ContentHash, ManifestError> {
        let value = self.required(field, value)?;
        ContentHash::parse(&value).map_err(|source| ManifestError::InvalidHash {
            platform: self.platform.to_string(),
            branch: self.branch.to_string(),
            path: self.path.to_string(),
            field,
            source,
        })
    }
}

pub(crate) fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') || path.contains(':') {
        return false;
    }
    path.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

pub(crate) fn is_absolute_url(url: &str) -> bool {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
                && !rest.is_empty()
        }
        None => false,
    }
}
