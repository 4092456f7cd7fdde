//! Two-phase garbage collection: plan, then run.
//!
//! The protection set is the union of every worktree's head and latest
//! snapshot, the full parent-chain ancestry of every protected snapshot,
//! active pins, refs, and retention tags from config. Candidates are the
//! published snapshots left over, persisted in a plan file; running the plan
//! revalidates protection from scratch and refuses if anything it would
//! delete has since become protected.
//!
//! Deletion order is descriptor first, payload second: a crash in between
//! leaves an orphan payload directory that doctor reaps, never a descriptor
//! pointing at nothing.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit;
use crate::config::JvsConfig;
use crate::error::{JvsError, Result};
use crate::fsutil;
use crate::lock::LockManager;
use crate::model::types::{SnapshotId, WorktreeName};
use crate::refs;
use crate::repo::Repository;
use crate::timeutil;

// ---------------------------------------------------------------------------
// Plan file
// ---------------------------------------------------------------------------

/// A persisted GC plan (`.jvs/gc/<plan_id>.json`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFile {
    pub plan_id: String,
    pub created_at: String,
    /// Snapshots the run phase will delete, ascending by id.
    pub candidates: Vec<SnapshotId>,
    pub protected_by_worktree: Vec<SnapshotId>,
    pub protected_by_lineage: Vec<SnapshotId>,
    pub protected_by_pin: Vec<SnapshotId>,
    pub protected_by_ref: Vec<SnapshotId>,
    pub protected_by_tag: Vec<SnapshotId>,
}

impl PlanFile {
    /// Total number of protected snapshots across all categories.
    #[must_use]
    pub fn protected_count(&self) -> usize {
        self.protected_by_worktree.len()
            + self.protected_by_lineage.len()
            + self.protected_by_pin.len()
            + self.protected_by_ref.len()
            + self.protected_by_tag.len()
    }
}

/// What a run deleted.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunReport {
    pub plan_id: String,
    pub deleted: Vec<SnapshotId>,
    /// Candidates that were already gone when the run reached them.
    pub skipped: Vec<SnapshotId>,
}

// ---------------------------------------------------------------------------
// Protection set
// ---------------------------------------------------------------------------

/// The full protection set, by category. A snapshot may appear in several.
#[derive(Clone, Debug, Default)]
pub struct ProtectionSet {
    pub worktree: BTreeSet<SnapshotId>,
    pub lineage: BTreeSet<SnapshotId>,
    pub pin: BTreeSet<SnapshotId>,
    pub r#ref: BTreeSet<SnapshotId>,
    pub tag: BTreeSet<SnapshotId>,
}

impl ProtectionSet {
    /// Whether `id` is protected by any category.
    #[must_use]
    pub fn contains(&self, id: &SnapshotId) -> bool {
        self.worktree.contains(id)
            || self.lineage.contains(id)
            || self.pin.contains(id)
            || self.r#ref.contains(id)
            || self.tag.contains(id)
    }
}

/// Compute the protection set for the current repository state.
///
/// # Errors
/// `E_LINEAGE_BROKEN` when a parent chain cycles, or I/O failures.
pub fn protection_set(repo: &Repository, config: &JvsConfig) -> Result<ProtectionSet> {
    let mut set = ProtectionSet::default();
    let now = timeutil::now_ms();

    for wt in repo.list_worktrees()? {
        set.worktree.extend(wt.head_snapshot_id.clone());
        set.worktree.extend(wt.latest_snapshot_id.clone());
    }
    for pin in refs::list_pins(repo)? {
        if pin.is_active(now) {
            set.pin.insert(pin.snapshot_id);
        }
    }
    for r in refs::list_refs(repo)? {
        set.r#ref.insert(r.snapshot_id);
    }
    if !config.gc.retain_tags.is_empty() {
        for id in repo.snapshot_ids()? {
            if let Ok(d) = repo.load_descriptor(&id) {
                if d.tags.iter().any(|t| config.gc.retain_tags.contains(t)) {
                    set.tag.insert(id);
                }
            }
        }
    }

    // Every protected snapshot drags its whole ancestry in.
    let seeds: Vec<SnapshotId> = set
        .worktree
        .iter()
        .chain(&set.pin)
        .chain(&set.r#ref)
        .chain(&set.tag)
        .cloned()
        .collect();
    for seed in seeds {
        let mut walked = BTreeSet::new();
        let mut cursor = Some(seed);
        while let Some(id) = cursor {
            if !walked.insert(id.clone()) {
                return Err(JvsError::LineageBroken {
                    snapshot_id: id.as_str().to_owned(),
                    detail: "parent chain contains a cycle".to_owned(),
                });
            }
            cursor = match repo.load_descriptor(&id) {
                Ok(d) => d.parent_id,
                // A missing ancestor ends the walk; doctor reports it.
                Err(_) => None,
            };
            if let Some(parent) = &cursor {
                set.lineage.insert(parent.clone());
            }
        }
    }

    Ok(set)
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Compute and persist a GC plan.
///
/// # Errors
/// As [`protection_set`], plus I/O failures.
pub fn plan(repo: &Repository, config: &JvsConfig) -> Result<PlanFile> {
    let protection = protection_set(repo, config)?;

    let mut candidates = Vec::new();
    for id in repo.snapshot_ids()? {
        if repo.is_published(&id) && !protection.contains(&id) {
            candidates.push(id);
        }
    }

    let plan = PlanFile {
        plan_id: fsutil::rand_hex(16),
        created_at: timeutil::format_rfc3339_ms(timeutil::now_ms()),
        candidates,
        protected_by_worktree: protection.worktree.into_iter().collect(),
        protected_by_lineage: protection.lineage.into_iter().collect(),
        protected_by_pin: protection.pin.into_iter().collect(),
        protected_by_ref: protection.r#ref.into_iter().collect(),
        protected_by_tag: protection.tag.into_iter().collect(),
    };

    let bytes = serde_json::to_vec_pretty(&plan)
        .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
    fsutil::atomic_write(&repo.plan_path(&plan.plan_id), &bytes)?;
    Ok(plan)
}

/// Load a persisted plan.
///
/// # Errors
/// `E_GC_PLAN_MISMATCH` when the plan does not exist or is unparseable.
pub fn load_plan(repo: &Repository, plan_id: &str) -> Result<PlanFile> {
    let path = repo.plan_path(plan_id);
    let raw = std::fs::read(&path).map_err(|_| JvsError::GcPlanMismatch {
        plan_id: plan_id.to_owned(),
        detail: "no such plan on disk".to_owned(),
    })?;
    serde_json::from_slice(&raw).map_err(|e| JvsError::GcPlanMismatch {
        plan_id: plan_id.to_owned(),
        detail: format!("plan file is unparseable: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Execute a persisted plan.
///
/// Revalidates the protection set first: any candidate that became protected
/// since the plan was made fails the whole run. Holds the invoking
/// worktree's lease and validates fencing before each deletion; each
/// candidate loses its descriptor first, then its payload directory.
///
/// # Errors
/// `E_GC_PLAN_MISMATCH` for stale plans, lock/fencing errors, or I/O
/// failures.
pub fn run(
    repo: &Repository,
    config: &JvsConfig,
    worktree: &WorktreeName,
    plan_id: &str,
) -> Result<RunReport> {
    let plan = load_plan(repo, plan_id)?;
    let protection = protection_set(repo, config)?;

    let newly_protected: Vec<&SnapshotId> = plan
        .candidates
        .iter()
        .filter(|id| protection.contains(id))
        .collect();
    if !newly_protected.is_empty() {
        return Err(JvsError::GcPlanMismatch {
            plan_id: plan_id.to_owned(),
            detail: format!(
                "{} candidate(s) became protected since the plan was made: {}",
                newly_protected.len(),
                newly_protected
                    .iter()
                    .map(|id| id.short())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        });
    }

    let locks = LockManager::new(repo, &config.lock);
    let (lease, acquired) = locks.hold(worktree, "gc run")?;

    let mut report = RunReport {
        plan_id: plan_id.to_owned(),
        ..RunReport::default()
    };
    let result = (|| -> Result<()> {
        for id in &plan.candidates {
            if !repo.descriptor_path(id).exists() && !repo.snapshot_dir(id).exists() {
                report.skipped.push(id.clone());
                continue;
            }
            locks.validate_fencing(worktree, lease.fencing_token)?;
            match std::fs::remove_file(repo.descriptor_path(id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(JvsError::Io(e)),
            }
            if repo.snapshot_dir(id).exists() {
                std::fs::remove_dir_all(repo.snapshot_dir(id))?;
            }
            report.deleted.push(id.clone());
        }
        Ok(())
    })();

    if acquired {
        let _ = locks.release(worktree, &lease.holder_nonce);
    }
    let () = result?;

    let _ = std::fs::remove_file(repo.plan_path(plan_id));
    audit::record(
        repo,
        "gc_run",
        Some(worktree.as_str()),
        None,
        serde_json::json!({
            "plan_id": plan_id,
            "deleted": report.deleted.iter().map(|id| id.as_str().to_owned()).collect::<Vec<_>>(),
        }),
    );
    info!(plan_id, deleted = report.deleted.len(), "gc run complete");
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;
    use crate::snapshot::create::{CreateOptions, create};
    use crate::worktree as wt;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository, JvsConfig) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(&dir.path().join("repo")).unwrap();
        (dir, repo, JvsConfig::default())
    }

    fn snap(repo: &Repository, config: &JvsConfig, worktree: &WorktreeName, content: &str) -> SnapshotId {
        std::fs::write(repo.payload_root(worktree).join("data.txt"), content).unwrap();
        create(
            repo,
            config,
            worktree,
            &CreateOptions {
                engine: Some(EngineKind::Copy),
                ..CreateOptions::default()
            },
        )
        .unwrap()
        .descriptor
        .snapshot_id
    }

    #[test]
    fn lineage_protects_whole_ancestry() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        snap(&repo, &config, &main, "a");
        snap(&repo, &config, &main, "b");
        snap(&repo, &config, &main, "c");

        // All three are in the head's ancestry: nothing to collect.
        let plan = plan(&repo, &config).unwrap();
        assert!(plan.candidates.is_empty(), "{plan:?}");
        assert!(plan.protected_count() > 0);
    }

    #[test]
    fn removed_worktree_frees_its_snapshots() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        snap(&repo, &config, &main, "a");

        let temp = WorktreeName::new("temp").unwrap();
        wt::fork::fork(&repo, &config, "HEAD", &main, &temp).unwrap();
        let t = snap(&repo, &config, &temp, "t");
        wt::remove(&repo, &config, &temp).unwrap();

        let plan = plan(&repo, &config).unwrap();
        assert_eq!(plan.candidates, vec![t.clone()]);

        let report = run(&repo, &config, &main, &plan.plan_id).unwrap();
        assert_eq!(report.deleted, vec![t.clone()]);
        assert!(!repo.is_published(&t));
        assert!(!repo.descriptor_path(&t).exists());
        assert!(!repo.snapshot_dir(&t).exists());
        // Main's lineage survived.
        assert_eq!(repo.snapshot_ids().unwrap().len(), 1);
    }

    #[test]
    fn plans_are_deterministic_on_unchanged_repo() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        snap(&repo, &config, &main, "a");

        let one = plan(&repo, &config).unwrap();
        let two = plan(&repo, &config).unwrap();
        assert_eq!(one.candidates, two.candidates);
        assert_ne!(one.plan_id, two.plan_id);
    }

    #[test]
    fn pin_protects_candidate() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        snap(&repo, &config, &main, "a");
        let temp = WorktreeName::new("temp").unwrap();
        wt::fork::fork(&repo, &config, "HEAD", &main, &temp).unwrap();
        let t = snap(&repo, &config, &temp, "t");
        wt::remove(&repo, &config, &temp).unwrap();

        refs::add_pin(&repo, &t, Some("keep for forensics"), None).unwrap();
        let plan = plan(&repo, &config).unwrap();
        assert!(plan.candidates.is_empty());
        assert!(plan.protected_by_pin.contains(&t));
    }

    #[test]
    fn stale_plan_is_refused() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        snap(&repo, &config, &main, "a");
        let temp = WorktreeName::new("temp").unwrap();
        wt::fork::fork(&repo, &config, "HEAD", &main, &temp).unwrap();
        let t = snap(&repo, &config, &temp, "t");
        wt::remove(&repo, &config, &temp).unwrap();

        let stale = plan(&repo, &config).unwrap();
        assert_eq!(stale.candidates, vec![t.clone()]);

        // The candidate becomes protected after planning.
        refs::create_ref(&repo, "rescued", &t).unwrap();

        let err = run(&repo, &config, &main, &stale.plan_id).unwrap_err();
        assert_eq!(err.code(), "E_GC_PLAN_MISMATCH");
        assert!(repo.is_published(&t), "stale run must not delete anything");
    }

    #[test]
    fn unknown_plan_is_refused() {
        let (_dir, repo, config) = setup();
        let err = run(&repo, &config, &WorktreeName::main(), "feedfacecafebeef").unwrap_err();
        assert_eq!(err.code(), "E_GC_PLAN_MISMATCH");
    }

    #[test]
    fn retention_tag_protects() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        snap(&repo, &config, &main, "a");
        let temp = WorktreeName::new("temp").unwrap();
        wt::fork::fork(&repo, &config, "HEAD", &main, &temp).unwrap();
        std::fs::write(repo.payload_root(&temp).join("data.txt"), "keepme").unwrap();
        let kept = create(
            &repo,
            &config,
            &temp,
            &CreateOptions {
                tags: vec!["keep".to_owned()],
                engine: Some(EngineKind::Copy),
                ..CreateOptions::default()
            },
        )
        .unwrap()
        .descriptor
        .snapshot_id;
        wt::remove(&repo, &config, &temp).unwrap();

        let retain_config = JvsConfig {
            gc: crate::config::GcConfig {
                retain_tags: vec!["keep".to_owned()],
            },
            ..JvsConfig::default()
        };
        let plan = plan(&repo, &retain_config).unwrap();
        assert!(!plan.candidates.contains(&kept));
        assert!(plan.protected_by_tag.contains(&kept));
    }

    #[test]
    fn cycle_in_lineage_is_an_error() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        let a = snap(&repo, &config, &main, "a");
        let b = snap(&repo, &config, &main, "b");

        // Forge a cycle: a's parent becomes b.
        let mut d = repo.load_descriptor(&a).unwrap();
        d.parent_id = Some(b);
        d.seal().unwrap();
        repo.store_descriptor(&d).unwrap();

        let err = protection_set(&repo, &config).unwrap_err();
        assert_eq!(err.code(), "E_LINEAGE_BROKEN");
    }
}
