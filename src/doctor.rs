//! Health checks and repair actions over the on-disk layout.
//!
//! Doctor never guesses: every check maps to a layout invariant, and every
//! repair is idempotent cleanup of an unambiguous artifact (staging suffix,
//! missing READY, orphan intent, expired lock). Intent files are forensics,
//! not redo logs — repair deletes partial work, it never completes it.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::audit;
use crate::config::JvsConfig;
use crate::error::{JvsError, Result, Severity};
use crate::fsutil;
use crate::lock::{LockManager, LockStatus};
use crate::model::types::{SnapshotId, WorktreeName};
use crate::repo::Repository;
use crate::snapshot::verify;
use crate::worktree::restore::PARKED_INFIX;

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

/// One observation from a doctor run.
#[derive(Clone, Debug, Serialize)]
pub struct Finding {
    pub severity: Severity,
    /// Which check produced this (stable identifier, e.g. `ready_marker`).
    pub check: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Everything a doctor run observed.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DoctorReport {
    pub findings: Vec<Finding>,
}

impl DoctorReport {
    /// No findings at error severity or above.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self
            .findings
            .iter()
            .any(|f| matches!(f.severity, Severity::Critical | Severity::Error))
    }

    fn push(&mut self, severity: Severity, check: &'static str, message: String, path: Option<PathBuf>) {
        self.findings.push(Finding {
            severity,
            check,
            message,
            path,
        });
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Run all checks. `strict` additionally re-verifies every snapshot's
/// payload hash (expensive on large repositories).
///
/// # Errors
/// I/O failures while scanning; individual invariant violations become
/// findings, not errors.
pub fn check(repo: &Repository, config: &JvsConfig, strict: bool) -> Result<DoctorReport> {
    let mut report = DoctorReport::default();

    if let Err(e) = repo.format_version() {
        report.push(Severity::Critical, "format_version", e.to_string(), None);
    }

    check_worktrees(repo, config, &mut report)?;
    check_snapshots(repo, strict, &mut report)?;
    check_tmp_artifacts(repo, &mut report)?;
    check_intents(repo, &mut report)?;

    match audit::verify_chain(repo) {
        Ok(_) => {}
        Err(e) => report.push(Severity::Error, "audit_chain", e.to_string(), Some(repo.audit_path())),
    }

    Ok(report)
}

fn check_worktrees(repo: &Repository, config: &JvsConfig, report: &mut DoctorReport) -> Result<()> {
    let locks = LockManager::new(repo, &config.lock);
    for entry in std::fs::read_dir(repo.control_dir().join("worktrees"))? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let raw_name = entry.file_name().to_string_lossy().into_owned();
        let Ok(name) = WorktreeName::new(&raw_name) else {
            report.push(
                Severity::Warning,
                "worktree_name",
                format!("metadata directory '{raw_name}' is not a valid worktree name"),
                Some(entry.path()),
            );
            continue;
        };

        let wt = match repo.load_worktree(&name) {
            Ok(wt) => wt,
            Err(e) => {
                report.push(
                    Severity::Error,
                    "worktree_config",
                    format!("worktree '{name}': {e}"),
                    Some(repo.worktree_config_path(&name)),
                );
                continue;
            }
        };

        if !repo.payload_root(&name).is_dir() {
            report.push(
                Severity::Error,
                "worktree_payload",
                format!("worktree '{name}' has no payload root"),
                Some(repo.payload_root(&name)),
            );
        }
        for (field, id) in [
            ("head_snapshot_id", &wt.head_snapshot_id),
            ("latest_snapshot_id", &wt.latest_snapshot_id),
        ] {
            if let Some(id) = id {
                if !repo.descriptor_path(id).is_file() {
                    report.push(
                        Severity::Error,
                        "worktree_head",
                        format!(
                            "worktree '{name}' {field} {} has no descriptor (repair: advance_head)",
                            id.short()
                        ),
                        Some(repo.descriptor_path(id)),
                    );
                }
            }
        }

        if let LockStatus::Expired(record) = locks.status(&name)? {
            report.push(
                Severity::Info,
                "expired_lock",
                format!(
                    "worktree '{name}' carries an expired lock (holder session {}, expired {})",
                    record.session_id, record.expires_at
                ),
                Some(repo.lock_path(&name)),
            );
        }
    }
    Ok(())
}

fn check_snapshots(repo: &Repository, strict: bool, report: &mut DoctorReport) -> Result<()> {
    for id in repo.snapshot_ids()? {
        if !repo.snapshot_dir(&id).is_dir() {
            report.push(
                Severity::Critical,
                "snapshot_payload",
                format!("snapshot {} has a descriptor but no payload directory", id.short()),
                Some(repo.snapshot_dir(&id)),
            );
            continue;
        }
        if !repo.ready_path(&id).is_file() {
            report.push(
                Severity::Critical,
                "ready_marker",
                format!(
                    "snapshot {} is missing its READY marker (incomplete publication; repair: clean_tmp)",
                    id.short()
                ),
                Some(repo.snapshot_dir(&id)),
            );
        }
    }

    // Payload directories nothing points at (GC crash leftovers).
    for entry in std::fs::read_dir(repo.snapshots_dir())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if fsutil::is_tmp_name(&name) || name.ends_with(crate::repo::STAGING_SUFFIX) {
            continue; // reported by the tmp check
        }
        if let Ok(id) = SnapshotId::new(&name) {
            if !repo.descriptor_path(&id).is_file() {
                report.push(
                    Severity::Warning,
                    "orphan_payload",
                    format!(
                        "snapshot payload {} has no descriptor (repair: clean_tmp)",
                        id.short()
                    ),
                    Some(entry.path()),
                );
            }
        }
    }

    if strict {
        for outcome in verify::verify_all(repo, true)? {
            if !outcome.ok {
                report.push(
                    Severity::Critical,
                    "integrity",
                    outcome.message.unwrap_or_else(|| {
                        format!("snapshot {} failed verification", outcome.snapshot_id)
                    }),
                    None,
                );
            }
        }
    }
    Ok(())
}

fn check_tmp_artifacts(repo: &Repository, report: &mut DoctorReport) -> Result<()> {
    for path in tmp_artifacts(repo)? {
        report.push(
            Severity::Warning,
            "tmp_artifact",
            "orphan temp artifact (repair: clean_tmp)".to_owned(),
            Some(path),
        );
    }
    Ok(())
}

fn check_intents(repo: &Repository, report: &mut DoctorReport) -> Result<()> {
    for entry in std::fs::read_dir(repo.intents_dir())? {
        let entry = entry?;
        report.push(
            Severity::Warning,
            "orphan_intent",
            "in-flight intent with no running operation (repair: clean_intents)".to_owned(),
            Some(entry.path()),
        );
    }
    Ok(())
}

/// Every transient artifact a crash can leave behind: `*.tmp*` entries in
/// the snapshots directory, atomic-write siblings anywhere in the control
/// plane, and parked `.old-*` payloads next to worktree roots.
fn tmp_artifacts(repo: &Repository) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();

    for entry in std::fs::read_dir(repo.snapshots_dir())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if fsutil::is_tmp_name(&name) || name.ends_with(crate::repo::STAGING_SUFFIX) {
            out.push(entry.path());
        }
    }

    let mut payload_parents = vec![repo.root().to_path_buf()];
    let named = repo.root().join("worktrees");
    if named.is_dir() {
        payload_parents.push(named);
    }
    for parent in payload_parents {
        for entry in std::fs::read_dir(&parent)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(PARKED_INFIX) || fsutil::is_tmp_name(&name) {
                out.push(entry.path());
            }
        }
    }

    out.sort();
    Ok(out)
}

// ---------------------------------------------------------------------------
// Repairs
// ---------------------------------------------------------------------------

/// The enumerated, idempotent repair actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum RepairAction {
    /// Reap staging directories, parked payloads, incomplete snapshots, and
    /// orphan payload directories.
    CleanTmp,
    /// Remove all intent files.
    CleanIntents,
    /// Remove expired lock files and their session sidecars.
    CleanLocks,
    /// Point each worktree's head/latest at the most recent descriptor that
    /// still exists for its lineage.
    AdvanceHead,
    /// Reconcile worktree configs against the descriptors on disk.
    RebuildIndex,
    /// Recompute the audit hash chain over the records present.
    AuditRepair,
}

impl std::fmt::Display for RepairAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CleanTmp => f.write_str("clean_tmp"),
            Self::CleanIntents => f.write_str("clean_intents"),
            Self::CleanLocks => f.write_str("clean_locks"),
            Self::AdvanceHead => f.write_str("advance_head"),
            Self::RebuildIndex => f.write_str("rebuild_index"),
            Self::AuditRepair => f.write_str("audit_repair"),
        }
    }
}

/// What one repair action did.
#[derive(Clone, Debug, Serialize)]
pub struct RepairOutcome {
    pub action: String,
    /// Human-readable summaries of each change made.
    pub changes: Vec<String>,
}

/// Run one repair action.
///
/// # Errors
/// I/O failures only; an already-clean repository yields an empty outcome.
pub fn repair(repo: &Repository, config: &JvsConfig, action: RepairAction) -> Result<RepairOutcome> {
    let changes = match action {
        RepairAction::CleanTmp => clean_tmp(repo)?,
        RepairAction::CleanIntents => clean_intents(repo)?,
        RepairAction::CleanLocks => clean_locks(repo, config)?,
        RepairAction::AdvanceHead => advance_head(repo)?,
        RepairAction::RebuildIndex => rebuild_index(repo)?,
        RepairAction::AuditRepair => {
            let count = audit::repair_chain(repo)?;
            vec![format!("audit chain rebuilt over {count} record(s)")]
        }
    };
    if !changes.is_empty() {
        audit::record(
            repo,
            "repair",
            None,
            None,
            serde_json::json!({ "action": action.to_string(), "changes": changes.len() }),
        );
    }
    Ok(RepairOutcome {
        action: action.to_string(),
        changes,
    })
}

/// The runtime-state repairs `doctor --repair-runtime` runs, in order.
pub const RUNTIME_REPAIRS: &[RepairAction] = &[
    RepairAction::CleanTmp,
    RepairAction::CleanIntents,
    RepairAction::CleanLocks,
    RepairAction::AdvanceHead,
];

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(JvsError::Io(e)),
        }
    }
    Ok(())
}

fn clean_tmp(repo: &Repository) -> Result<Vec<String>> {
    let mut changes = Vec::new();

    for path in tmp_artifacts(repo)? {
        remove_path(&path)?;
        changes.push(format!("removed {}", path.display()));
    }

    // Incomplete publications: payload without READY loses both payload and
    // descriptor; payload without descriptor just goes.
    for entry in std::fs::read_dir(repo.snapshots_dir())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(id) = SnapshotId::new(&name) else {
            continue;
        };
        let has_ready = repo.ready_path(&id).is_file();
        let has_descriptor = repo.descriptor_path(&id).is_file();
        if has_ready && has_descriptor {
            continue; // published; never touched
        }
        remove_path(&entry.path())?;
        changes.push(format!("reaped incomplete snapshot {}", id.short()));
        if has_descriptor {
            remove_path(&repo.descriptor_path(&id))?;
            changes.push(format!("removed descriptor of incomplete snapshot {}", id.short()));
        }
    }

    // Descriptors whose payload vanished entirely (crashed GC ran in the
    // opposite order or the directory was removed by hand) stay — they are
    // critical findings for the operator, not silently reapable state.
    Ok(changes)
}

fn clean_intents(repo: &Repository) -> Result<Vec<String>> {
    let mut changes = Vec::new();
    for entry in std::fs::read_dir(repo.intents_dir())? {
        let entry = entry?;
        remove_path(&entry.path())?;
        changes.push(format!("removed intent {}", entry.file_name().to_string_lossy()));
    }
    Ok(changes)
}

fn clean_locks(repo: &Repository, config: &JvsConfig) -> Result<Vec<String>> {
    let locks = LockManager::new(repo, &config.lock);
    let mut changes = Vec::new();
    for wt in repo.list_worktrees()? {
        if let LockStatus::Expired(record) = locks.status(&wt.name)? {
            remove_path(&repo.lock_path(&wt.name))?;
            remove_path(&repo.session_path(&wt.name))?;
            changes.push(format!(
                "removed expired lock on '{}' (token {})",
                wt.name, record.fencing_token
            ));
        }
    }
    Ok(changes)
}

/// Most recent descriptor belonging to `name`, by id order.
fn latest_descriptor_for(repo: &Repository, name: &WorktreeName) -> Result<Option<SnapshotId>> {
    let mut latest = None;
    for id in repo.snapshot_ids()? {
        if let Ok(d) = repo.load_descriptor(&id) {
            if d.worktree_name == *name {
                latest = Some(id);
            }
        }
    }
    Ok(latest)
}

fn advance_head(repo: &Repository) -> Result<Vec<String>> {
    let mut changes = Vec::new();
    for mut wt in repo.list_worktrees()? {
        let head_dangling = wt
            .head_snapshot_id
            .as_ref()
            .is_some_and(|id| !repo.descriptor_path(id).is_file());
        let latest_dangling = wt
            .latest_snapshot_id
            .as_ref()
            .is_some_and(|id| !repo.descriptor_path(id).is_file());
        if !head_dangling && !latest_dangling {
            continue;
        }

        let replacement = latest_descriptor_for(repo, &wt.name)?;
        wt.head_snapshot_id = replacement.clone();
        wt.latest_snapshot_id = replacement.clone();
        repo.store_worktree(&wt)?;
        changes.push(match replacement {
            Some(id) => format!("worktree '{}' head advanced to {}", wt.name, id.short()),
            None => format!("worktree '{}' head cleared (no snapshots remain)", wt.name),
        });
    }
    Ok(changes)
}

fn rebuild_index(repo: &Repository) -> Result<Vec<String>> {
    let mut changes = Vec::new();
    for mut wt in repo.list_worktrees()? {
        let mut touched = false;

        let actual_latest = latest_descriptor_for(repo, &wt.name)?;
        if wt.latest_snapshot_id != actual_latest {
            wt.latest_snapshot_id = actual_latest.clone();
            touched = true;
        }
        // A head that is gone or was never set cannot be detached-on-purpose;
        // reattach it to whatever latest resolves to.
        let head_usable = wt
            .head_snapshot_id
            .as_ref()
            .is_some_and(|id| repo.descriptor_path(id).is_file());
        if !head_usable && wt.head_snapshot_id != actual_latest {
            wt.head_snapshot_id = actual_latest;
            touched = true;
        }
        if wt
            .base_snapshot_id
            .as_ref()
            .is_some_and(|id| !repo.descriptor_path(id).is_file())
        {
            wt.base_snapshot_id = None;
            touched = true;
        }

        if touched {
            repo.store_worktree(&wt)?;
            changes.push(format!("worktree '{}' reconciled against descriptors", wt.name));
        }
    }
    Ok(changes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
