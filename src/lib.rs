//! Manifest-driven asset reconciliation.
//!
//! Given a manifest of `original`/`fixed`/`patch` SHA-256 hashes per file, an
//! installation root, and a cache directory, [`engine::Engine`] classifies
//! every file, fetches the bsdiff patches it needs, and applies them.
//! [`generate::generate`] builds those patches and the manifest from an
//! original tree and a fixed tree.
pub mod apply;
pub mod cache;
pub mod checksum;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod generate;
pub mod manifest;
pub mod report;

pub use checksum::{ContentHash, EMPTY_HASH};
pub use classify::{Classification, FileState};
pub use engine::{Engine, EngineOptions, Outcome, RunMode, RunReport};
pub use error::{ErrorKind, ReconcileError};
pub use fetch::{Fetch, FetchError, StaticFetcher, UrlFetcher};
pub use manifest::{FileRecord, Manifest, ManifestScope};
