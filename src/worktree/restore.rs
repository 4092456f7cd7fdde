//! In-place restore: replace a worktree's payload with a past snapshot.
//!
//! The payload root must never observably hold a mix of old and new state.
//! This implementation parks the live payload aside with one rename, clones
//! the snapshot into place, then deletes the parked copy:
//!
//! ```text
//! main/  ── rename ──▶  main.old-<rand>/
//! snapshots/<id>/  ── clone ──▶  main/
//! main.old-<rand>/  ── remove
//! ```
//!
//! Both renames stay inside one parent directory, so they are atomic on the
//! same filesystem. A crash mid-way leaves a parked `.old-*` directory that
//! doctor reaps. The fencing token is validated immediately before the
//! first rename.
//!
//! Restoring to anything but the latest snapshot leaves the worktree
//! *detached* (head ≠ latest); `restore HEAD` returns to latest.

use tracing::info;

use crate::audit;
use crate::config::JvsConfig;
use crate::engine::{self, CloneEngine as _};
use crate::error::{JvsError, Result};
use crate::fsutil;
use crate::lock::LockManager;
use crate::model::descriptor::READY_FILE;
use crate::model::types::{SnapshotId, WorktreeName};
use crate::repo::Repository;
use crate::snapshot;
use crate::snapshot::find::resolve_reference;

/// Infix of parked pre-restore payload directories (`main.old-<hex>`).
pub const PARKED_INFIX: &str = ".old-";

/// What a successful restore changed.
#[derive(Clone, Debug)]
pub struct Restored {
    pub snapshot_id: SnapshotId,
    /// Whether the worktree is now detached (head behind latest).
    pub detached: bool,
}

/// Restore `worktree`'s payload to the snapshot named by `reference`.
///
/// Requires the explicit force flag and a non-empty reason; holds the
/// worktree lease for the duration.
///
/// # Errors
/// `E_FORCE_REQUIRED` without confirmation, resolution and lock/fencing
/// errors, or I/O failures.
pub fn inplace_restore(
    repo: &Repository,
    config: &JvsConfig,
    worktree: &WorktreeName,
    reference: &str,
    force: bool,
    reason: &str,
) -> Result<Restored> {
    if !force {
        return Err(JvsError::ForceRequired {
            operation: "in-place restore".to_owned(),
            detail: "pass --force to overwrite the worktree payload".to_owned(),
        });
    }
    if reason.trim().is_empty() {
        return Err(JvsError::ForceRequired {
            operation: "in-place restore".to_owned(),
            detail: "pass --reason with a non-empty explanation".to_owned(),
        });
    }

    let id = resolve_reference(repo, worktree, reference)?;
    let mut wt = repo.load_worktree(worktree)?;

    let locks = LockManager::new(repo, &config.lock);
    let (lease, acquired) = locks.hold(worktree, "inplace restore")?;

    let result = restore_locked(repo, config, worktree, &id, &locks, lease.fencing_token);

    if acquired {
        let _ = locks.release(worktree, &lease.holder_nonce);
    }
    let () = result?;

    wt.head_snapshot_id = Some(id.clone());
    repo.store_worktree(&wt)?;
    let detached = wt.is_detached();

    snapshot::remove_intent(repo, &id);
    audit::record(
        repo,
        "restore_inplace",
        Some(worktree.as_str()),
        Some(id.as_str()),
        serde_json::json!({ "reason": reason, "detached": detached }),
    );
    info!(
        snapshot = id.as_str(),
        worktree = worktree.as_str(),
        detached,
        "payload restored in place"
    );

    Ok(Restored {
        snapshot_id: id,
        detached,
    })
}

fn restore_locked(
    repo: &Repository,
    config: &JvsConfig,
    worktree: &WorktreeName,
    id: &SnapshotId,
    locks: &LockManager<'_>,
    fencing_token: i64,
) -> Result<()> {
    snapshot::write_intent(repo, "restore_inplace", id, worktree)?;

    let payload = repo.payload_root(worktree);
    let parked = {
        let mut name = payload.as_os_str().to_os_string();
        name.push(format!("{PARKED_INFIX}{}", fsutil::rand_hex(8)));
        std::path::PathBuf::from(name)
    };

    let engine = engine::select_engine(config.engine.default.forced(), engine::capabilities())?;

    // Linearization point: a stolen lock stops us before the payload moves.
    locks.validate_fencing(worktree, fencing_token)?;
    std::fs::rename(&payload, &parked)?;

    if let Err(e) = engine.clone_tree(&repo.snapshot_dir(id), &payload) {
        // Clone failed with the payload parked; put the original back so the
        // worktree never disappears from under the operator.
        let _ = std::fs::remove_dir_all(&payload);
        let _ = std::fs::rename(&parked, &payload);
        return Err(e);
    }
    // The publication marker belongs to the snapshot, not the worktree.
    let _ = std::fs::remove_file(payload.join(READY_FILE));
    fsutil::sync_parent(&payload);

    std::fs::remove_dir_all(&parked)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;
    use crate::snapshot::create::{CreateOptions, create};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository, JvsConfig) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(&dir.path().join("repo")).unwrap();
        (dir, repo, JvsConfig::default())
    }

    fn snap(repo: &Repository, config: &JvsConfig, content: &str) -> SnapshotId {
        std::fs::write(
            repo.payload_root(&WorktreeName::main()).join("data.txt"),
            content,
        )
        .unwrap();
        create(
            repo,
            config,
            &WorktreeName::main(),
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
    fn restore_requires_force_and_reason() {
        let (_dir, repo, config) = setup();
        let a = snap(&repo, &config, "v1");
        let main = WorktreeName::main();

        let err =
            inplace_restore(&repo, &config, &main, a.as_str(), false, "why").unwrap_err();
        assert_eq!(err.code(), "E_FORCE_REQUIRED");

        let err = inplace_restore(&repo, &config, &main, a.as_str(), true, "  ").unwrap_err();
        assert_eq!(err.code(), "E_FORCE_REQUIRED");
    }

    #[test]
    fn restore_rewinds_payload_and_detaches() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        let a = snap(&repo, &config, "v1");
        let b = snap(&repo, &config, "v2");

        let restored =
            inplace_restore(&repo, &config, &main, a.as_str(), true, "rewind to v1").unwrap();
        assert_eq!(restored.snapshot_id, a);
        assert!(restored.detached);

        let payload = repo.payload_root(&main);
        assert_eq!(std::fs::read_to_string(payload.join("data.txt")).unwrap(), "v1");
        // No publication marker leaked into the worktree.
        assert!(!payload.join(READY_FILE).exists());

        let wt = repo.load_worktree(&main).unwrap();
        assert_eq!(wt.head_snapshot_id, Some(a));
        assert_eq!(wt.latest_snapshot_id, Some(b));
        assert!(wt.is_detached());
    }

    #[test]
    fn restore_head_reattaches() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        let a = snap(&repo, &config, "v1");
        let b = snap(&repo, &config, "v2");

        inplace_restore(&repo, &config, &main, a.as_str(), true, "rewind").unwrap();
        let restored = inplace_restore(&repo, &config, &main, "HEAD", true, "back to tip").unwrap();
        assert_eq!(restored.snapshot_id, b);
        assert!(!restored.detached);
        assert_eq!(
            std::fs::read_to_string(repo.payload_root(&main).join("data.txt")).unwrap(),
            "v2"
        );
        assert!(!repo.load_worktree(&main).unwrap().is_detached());
    }

    #[test]
    fn restore_round_trip_preserves_bytes() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        let payload = repo.payload_root(&main);
        std::fs::create_dir_all(payload.join("sub")).unwrap();
        std::fs::write(payload.join("sub/deep.txt"), "deep").unwrap();
        let a = snap(&repo, &config, "v1");
        let before = crate::integrity::payload_root_hash(&payload).unwrap();

        // Mutate, then restore back.
        std::fs::write(payload.join("data.txt"), "scribble").unwrap();
        std::fs::remove_file(payload.join("sub/deep.txt")).unwrap();
        inplace_restore(&repo, &config, &main, a.as_str(), true, "undo scribble").unwrap();

        assert_eq!(
            crate::integrity::payload_root_hash(&payload).unwrap(),
            before
        );
    }

    #[test]
    fn restore_leaves_no_parked_directories() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        let a = snap(&repo, &config, "v1");
        inplace_restore(&repo, &config, &main, a.as_str(), true, "check cleanup").unwrap();

        let parked: Vec<_> = std::fs::read_dir(repo.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(PARKED_INFIX))
            .collect();
        assert!(parked.is_empty(), "{parked:?}");
    }

    #[test]
    fn restore_unknown_reference_fails() {
        let (_dir, repo, config) = setup();
        snap(&repo, &config, "v1");
        let err = inplace_restore(
            &repo,
            &config,
            &WorktreeName::main(),
            "nonexistent",
            true,
            "why",
        )
        .unwrap_err();
        assert_eq!(err.code(), "E_SNAPSHOT_NOT_FOUND");
    }
}
