//! Reconciliation run: classify, plan, fetch, patch.
//!
//! A run moves through `Classifying -> Planning -> Fetching -> Patching ->
//! Done`. Any unreadable file or checksum mismatch stops it before a single
//! byte is written. Patching is sequential and stops at the first failure;
//! files patched before that point stay patched and a re-run picks up the rest.
use crate::apply;
use crate::cache::PatchCache;
use crate::checksum::hash_file;
use crate::classify::{classify_all, target_path, Classification, FileState};
use crate::config::Config;
use crate::error::{ErrorKind, ReconcileError};
use crate::fetch::Fetch;
use crate::manifest::{FileRecord, ManifestScope};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Classify and plan only; no network access and no writes.
    Check,
    Fix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Classifying,
    Planning,
    Fetching,
    Patching,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Patch,
    WipeAndPatch,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub relative_path: String,
    pub action: PlanAction,
}

/// Files that need work, in manifest order.
pub fn plan_from(classifications: &[Classification]) -> Vec<PlanStep> {
    classifications
        .iter()
        .filter_map(|c| {
            let action = match c.state {
                FileState::NeedsFix => PlanAction::Patch,
                FileState::NeedsWipeAndFix => PlanAction::WipeAndPatch,
                FileState::NeedsDelete => PlanAction::Delete,
                _ => return None,
            };
            Some(PlanStep {
                relative_path: c.relative_path.clone(),
                action,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        patched: Vec<String>,
        deleted: Vec<String>,
    },
    Checked {
        pending: usize,
    },
    AbortedMismatch {
        paths: Vec<String>,
    },
    Aborted {
        kind: ErrorKind,
        detail: String,
        patched: Vec<String>,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        match self {
            Self::Success { .. } => true,
            Self::Checked { pending } => *pending == 0,
            _ => false,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Success { .. } => 0,
            Self::Checked { pending: 0 } => 0,
            Self::Checked { .. } => 10,
            Self::AbortedMismatch { .. } => 2,
            Self::Aborted { kind, .. } => match kind {
                ErrorKind::IntegrityMismatch => 2,
                ErrorKind::Environment => 3,
                ErrorKind::Network => 4,
                ErrorKind::PartialPatch => 5,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub platform: String,
    pub branch: String,
    pub mode: RunMode,
    pub phase: Phase,
    pub classifications: Vec<Classification>,
    pub plan: Vec<PlanStep>,
    pub outcome: Outcome,
    pub elapsed_ms: u128,
}

/// Engine knobs taken from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub mode: RunMode,
    pub hash_threads: usize,
    pub download_jobs: usize,
    pub attempts: u32,
}

impl EngineOptions {
    pub fn from_config(config: &Config, mode: RunMode) -> Self {
        Self {
            mode,
            hash_threads: config.hash_threads(),
            download_jobs: config.download_jobs.max(1),
            attempts: config.retries.max(1),
        }
    }
}

pub struct Engine<'a, F: Fetch + ?Sized> {
    options: EngineOptions,
    fetcher: &'a F,
    hash_pool: rayon::ThreadPool,
    download_pool: rayon::ThreadPool,
}

impl<'a, F: Fetch + ?Sized> Engine<'a, F> {
    pub fn new(options: EngineOptions, fetcher: &'a F) -> Result<Self, rayon::ThreadPoolBuildError> {
        let hash_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.hash_threads.max(1))
            .thread_name(|index| format!("hash-{index}"))
            .build()?;
        let download_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.download_jobs.max(1))
            .thread_name(|index| format!("download-{index}"))
            .build()?;
        Ok(Self {
            options,
            fetcher,
            hash_pool,
            download_pool,
        })
    }

    /// Reconcile every file of `scope` under `root`, using `cache_root` for patches.
    pub fn run(&self, scope: &ManifestScope, root: &Path, cache_root: &Path) -> RunReport {
        let start = Instant::now();
        let mut run = Run {
            phase: Phase::Idle,
            classifications: Vec::new(),
            plan: Vec::new(),
            patched: Vec::new(),
            deleted: Vec::new(),
        };
        let outcome = match self.reconcile(&mut run, scope, root, cache_root) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(phase = ?run.phase, error = %err, "reconciliation aborted");
                match err {
                    ReconcileError::IntegrityMismatch { paths } => Outcome::AbortedMismatch { paths },
                    err => Outcome::Aborted {
                        kind: err.kind(),
                        detail: err.to_string(),
                        patched: run.patched.clone(),
                    },
                }
            }
        };
        let elapsed_ms = start.elapsed().as_millis();
        tracing::info!(
            elapsed_ms,
            files = scope.len(),
            pending = run.plan.len(),
            "reconciliation finished"
        );
        RunReport {
            platform: scope.platform.clone(),
            branch: scope.branch.clone(),
            mode: self.options.mode,
            phase: run.phase,
            classifications: run.classifications,
            plan: run.plan,
            outcome,
            elapsed_ms,
        }
    }

    fn reconcile(
        &self,
        run: &mut Run,
        scope: &ManifestScope,
        root: &Path,
        cache_root: &Path,
    ) -> Result<Outcome, ReconcileError> {
        run.enter(Phase::Classifying);
        run.classifications = classify_all(&self.hash_pool, scope, root);
        check_classifications(&run.classifications, root)?;

        run.enter(Phase::Planning);
        run.plan = plan_from(&run.classifications);
        if self.options.mode == RunMode::Check {
            run.enter(Phase::Done);
            return Ok(Outcome::Checked {
                pending: run.plan.len(),
            });
        }
        if run.plan.is_empty() {
            apply_executable_bits(scope, root);
            run.enter(Phase::Done);
            return Ok(Outcome::Success {
                patched: Vec::new(),
                deleted: Vec::new(),
            });
        }

        run.enter(Phase::Fetching);
        let cache = PatchCache::new(cache_root, scope, self.options.attempts);
        let patches = self.fetch_patches(&run.plan, scope, &cache)?;

        run.enter(Phase::Patching);
        for step in run.plan.clone() {
            let record = lookup(scope, &step.relative_path)?;
            let target = target_path(root, &record.relative_path);
            let result = match step.action {
                PlanAction::Delete => apply::delete(&target)
                    .map(|()| run.deleted.push(step.relative_path.clone())),
                PlanAction::Patch | PlanAction::WipeAndPatch => patches
                    .get(&step.relative_path)
                    .ok_or_else(|| {
                        ReconcileError::cache_access(
                            cache.entry_path(&step.relative_path),
                            "patch was not fetched",
                        )
                    })
                    .and_then(|patch| {
                        apply::patch_in_place(
                            &target,
                            patch,
                            step.action == PlanAction::WipeAndPatch,
                        )
                    })
                    .and_then(|()| {
                        // The file is rewritten from here on, verified or not.
                        run.patched.push(step.relative_path.clone());
                        verify_fixed(record, &target)
                    }),
            };
            if let Err(err) = result {
                if run.patched.is_empty() && run.deleted.is_empty() {
                    return Err(err);
                }
                let mut done = run.patched.clone();
                done.extend(run.deleted.iter().cloned());
                return Err(ReconcileError::PartialPatch {
                    patched: done,
                    source: Box::new(err),
                });
            }
            tracing::info!(path = %step.relative_path, action = ?step.action, "patched");
        }

        apply_executable_bits(scope, root);
        run.enter(Phase::Done);
        Ok(Outcome::Success {
            patched: run.patched.clone(),
            deleted: run.deleted.clone(),
        })
    }

    fn fetch_patches(
        &self,
        plan: &[PlanStep],
        scope: &ManifestScope,
        cache: &PatchCache,
    ) -> Result<HashMap<String, PathBuf>, ReconcileError> {
        let wanted = plan
            .iter()
            .filter(|step| step.action != PlanAction::Delete)
            .map(|step| lookup(scope, &step.relative_path))
            .collect::<Result<Vec<_>, _>>()?;
        let fetcher = self.fetcher;
        let results: Vec<Result<(String, PathBuf), ReconcileError>> =
            self.download_pool.install(|| {
                wanted
                    .par_iter()
                    .map(|record| {
                        cache
                            .resolve(record, fetcher)
                            .map(|resolution| (record.relative_path.clone(), resolution.path))
                    })
                    .collect()
            });
        results.into_iter().collect()
    }
}

struct Run {
    phase: Phase,
    classifications: Vec<Classification>,
    plan: Vec<PlanStep>,
    patched: Vec<String>,
    deleted: Vec<String>,
}

impl Run {
    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }
}

fn check_classifications(
    classifications: &[Classification],
    root: &Path,
) -> Result<(), ReconcileError> {
    let read_errors: Vec<&Classification> = classifications
        .iter()
        .filter(|c| c.state == FileState::ReadError)
        .collect();
    if let Some(first) = read_errors.first() {
        let mut detail = first.detail.clone().unwrap_or_default();
        if read_errors.len() > 1 {
            detail.push_str(&format!(" (and {} more unreadable file(s))", read_errors.len() - 1));
        }
        return Err(ReconcileError::Read {
            path: target_path(root, &first.relative_path),
            detail,
        });
    }
    let mismatched: Vec<String> = classifications
        .iter()
        .filter(|c| c.state == FileState::Mismatch)
        .map(|c| c.relative_path.clone())
        .collect();
    if !mismatched.is_empty() {
        return Err(ReconcileError::IntegrityMismatch { paths: mismatched });
    }
    Ok(())
}

fn lookup<'s>(scope: &'s ManifestScope, relative_path: &str) -> Result<&'s FileRecord, ReconcileError> {
    scope.get(relative_path).ok_or_else(|| ReconcileError::Read {
        path: PathBuf::from(relative_path),
        detail: "file is not part of the manifest scope".to_string(),
    })
}

fn verify_fixed(record: &FileRecord, target: &Path) -> Result<(), ReconcileError> {
    let actual = hash_file(target).map_err(|err| ReconcileError::Read {
        path: err.path,
        detail: err.detail,
    })?;
    if actual != record.fixed {
        return Err(ReconcileError::PatchVerification {
            relative_path: record.relative_path.clone(),
            expected: record.fixed.clone(),
            actual,
        });
    }
    Ok(())
}

/// Ensure files flagged executable in the manifest carry the execute bits.
#[cfg(unix)]
fn apply_executable_bits(scope: &ManifestScope, root: &Path) {
    use std::os::unix::fs::PermissionsExt;

    for record in scope.records().filter(|record| record.executable) {
        let path = target_path(root, &record.relative_path);
        if !path.is_file() {
            continue;
        }
        let result = std::fs::metadata(&path).and_then(|metadata| {
            let mut permissions = metadata.permissions();
            permissions.set_mode(permissions.mode() | 0o111);
            std::fs::set_permissions(&path, permissions)
        });
        match result {
            Ok(()) => tracing::debug!(path = %record.relative_path, "executable bits applied"),
            Err(err) => tracing::warn!(
                path = %record.relative_path,
                error = %err,
                "failed to apply executable bits"
            ),
        }
    }
}

#[cfg(not(unix))]
fn apply_executable_bits(_scope: &ManifestScope, _root: &Path) {}
