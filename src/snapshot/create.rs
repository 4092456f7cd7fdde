//! Snapshot creation: stage → hash → publish → advance head.
//!
//! Publication follows the READY protocol, in this exact order:
//!
//! 1. descriptor written to `descriptors/<id>.json` (atomic),
//! 2. staging directory renamed to `snapshots/<id>/`,
//! 3. `.READY` marker written inside it (atomic).
//!
//! A crash before (1) leaves only a `.tmp` staging directory; between (2)
//! and (3) a payload without `.READY`. Both are unambiguous incomplete
//! states that doctor reaps. The head update after (3) can be lost and is
//! recovered by the `advance_head` repair.

use tracing::info;

use crate::audit;
use crate::config::JvsConfig;
use crate::engine::{self, CloneEngine as _, CloneOutcome, EngineKind};
use crate::error::{JvsError, Result};
use crate::lock::LockManager;
use crate::model::descriptor::{Descriptor, IntegrityState, ReadyMarker};
use crate::model::types::{SnapshotId, WorktreeName};
use crate::model::worktree::WorktreeConfig;
use crate::repo::Repository;
use crate::timeutil;

/// Options for one snapshot creation.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    pub note: Option<String>,
    pub tags: Vec<String>,
    /// Force a specific engine instead of the configured/auto choice.
    pub engine: Option<EngineKind>,
}

/// What a successful creation produced.
#[derive(Clone, Debug)]
pub struct Created {
    pub descriptor: Descriptor,
    pub clone_outcome: CloneOutcome,
}

/// Create a snapshot of `worktree`'s payload.
///
/// Holds the worktree lease for the duration (resuming the caller's session
/// lease when one exists) and validates the fencing token immediately before
/// publication. The first snapshot of a fresh worktree is allowed even
/// though head and latest are both unset; any other head/latest divergence
/// is the detached state and refuses.
///
/// # Errors
/// `E_SNAPSHOT_DETACHED`, lock/fencing errors, engine errors, or I/O
/// failures. On failure after staging began, the intent file and `.tmp`
/// staging directory are left for doctor.
pub fn create(
    repo: &Repository,
    config: &JvsConfig,
    worktree: &WorktreeName,
    opts: &CreateOptions,
) -> Result<Created> {
    let mut wt = repo.load_worktree(worktree)?;
    if wt.is_detached() {
        return Err(JvsError::SnapshotDetached {
            worktree: worktree.as_str().to_owned(),
            head: wt
                .head_snapshot_id
                .as_ref()
                .map_or_else(String::new, |id| id.as_str().to_owned()),
            latest: wt
                .latest_snapshot_id
                .as_ref()
                .map_or_else(String::new, |id| id.as_str().to_owned()),
        });
    }

    for tag in &opts.tags {
        if tag.trim().is_empty() || tag.chars().any(char::is_control) {
            return Err(JvsError::NameInvalid {
                value: tag.clone(),
                reason: "tags must be nonempty and free of control characters".to_owned(),
            });
        }
    }

    let locks = LockManager::new(repo, &config.lock);
    let (lease, acquired) = locks.hold(worktree, "snapshot create")?;

    let result = create_locked(repo, config, worktree, &mut wt, opts, &locks, lease.fencing_token);

    if acquired {
        let _ = locks.release(worktree, &lease.holder_nonce);
    }
    result
}

fn create_locked(
    repo: &Repository,
    config: &JvsConfig,
    worktree: &WorktreeName,
    wt: &mut WorktreeConfig,
    opts: &CreateOptions,
    locks: &LockManager<'_>,
    fencing_token: i64,
) -> Result<Created> {
    let id = SnapshotId::generate(timeutil::now_ms());
    let created_at = timeutil::format_rfc3339_ms(id.timestamp_ms());

    super::write_intent(repo, "snapshot_create", &id, worktree)?;

    let forced = opts.engine.or_else(|| config.engine.default.forced());
    let engine = engine::select_engine(forced, engine::capabilities())?;

    // Stage the payload clone under a `.tmp` name.
    let staging = repo.staging_dir(&id);
    let clone_outcome = engine.clone_tree(&repo.payload_root(worktree), &staging)?;
    let payload_root_hash = crate::integrity::payload_root_hash(&staging)?;

    let mut descriptor = Descriptor {
        snapshot_id: id.clone(),
        worktree_name: worktree.clone(),
        parent_id: wt.latest_snapshot_id.clone(),
        created_at: created_at.clone(),
        note: opts.note.clone(),
        tags: opts.tags.clone(),
        engine: engine.kind(),
        payload_root_hash: payload_root_hash.clone(),
        descriptor_checksum: String::new(),
        integrity_state: IntegrityState::Unverified,
    };
    descriptor.seal()?;

    // Publish. The fencing check sits immediately before the first durable
    // mutation; a stolen lock stops us here with the staging dir intact.
    locks.validate_fencing(worktree, fencing_token)?;
    repo.store_descriptor(&descriptor)?;
    std::fs::rename(&staging, repo.snapshot_dir(&id))?;
    crate::fsutil::sync_parent(&repo.snapshot_dir(&id));
    repo.store_ready(&ReadyMarker {
        snapshot_id: id.clone(),
        created_at,
        engine: engine.kind(),
        payload_root_hash,
    })?;

    wt.advance(id.clone());
    repo.store_worktree(wt)?;

    super::remove_intent(repo, &id);
    audit::record(
        repo,
        "snapshot_create",
        Some(worktree.as_str()),
        Some(id.as_str()),
        serde_json::json!({
            "engine": engine.kind().to_string(),
            "degraded": clone_outcome.degraded,
            "parent": descriptor.parent_id.as_ref().map(|p| p.as_str().to_owned()),
        }),
    );
    info!(snapshot = id.as_str(), worktree = worktree.as_str(), "snapshot published");

    Ok(Created {
        descriptor,
        clone_outcome,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository, JvsConfig) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(&dir.path().join("repo")).unwrap();
        std::fs::write(repo.payload_root(&WorktreeName::main()).join("data.txt"), "v1").unwrap();
        (dir, repo, JvsConfig::default())
    }

    #[test]
    fn create_publishes_complete_snapshot() {
        let (_dir, repo, config) = setup();
        let created = create(
            &repo,
            &config,
            &WorktreeName::main(),
            &CreateOptions {
                note: Some("first".to_owned()),
                tags: vec!["v1".to_owned()],
                engine: Some(EngineKind::Copy),
            },
        )
        .unwrap();

        let id = &created.descriptor.snapshot_id;
        assert!(repo.is_published(id));
        assert!(repo.snapshot_dir(id).join("data.txt").is_file());
        created.descriptor.verify_checksum().unwrap();
        assert_eq!(created.descriptor.parent_id, None);

        // Head and latest both advanced.
        let wt = repo.load_worktree(&WorktreeName::main()).unwrap();
        assert_eq!(wt.head_snapshot_id.as_ref(), Some(id));
        assert_eq!(wt.latest_snapshot_id.as_ref(), Some(id));

        // Ready marker agrees with the descriptor.
        let ready = repo.load_ready(id).unwrap();
        assert_eq!(ready.payload_root_hash, created.descriptor.payload_root_hash);

        // No staging or intent leftovers.
        assert!(!repo.staging_dir(id).exists());
        assert!(!repo.intent_path(id).exists());
    }

    #[test]
    fn second_snapshot_links_parent() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        let first = create(&repo, &config, &main, &CreateOptions::default()).unwrap();
        std::fs::write(repo.payload_root(&main).join("data.txt"), "v2").unwrap();
        let second = create(&repo, &config, &main, &CreateOptions::default()).unwrap();

        assert_eq!(
            second.descriptor.parent_id.as_ref(),
            Some(&first.descriptor.snapshot_id)
        );
        assert_ne!(
            first.descriptor.payload_root_hash,
            second.descriptor.payload_root_hash
        );
    }

    #[test]
    fn detached_worktree_refuses_snapshot() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        let first = create(&repo, &config, &main, &CreateOptions::default()).unwrap();
        std::fs::write(repo.payload_root(&main).join("data.txt"), "v2").unwrap();
        create(&repo, &config, &main, &CreateOptions::default()).unwrap();

        // Detach by pointing head at the first snapshot.
        let mut wt = repo.load_worktree(&main).unwrap();
        wt.head_snapshot_id = Some(first.descriptor.snapshot_id.clone());
        repo.store_worktree(&wt).unwrap();

        let err = create(&repo, &config, &main, &CreateOptions::default()).unwrap_err();
        assert_eq!(err.code(), "E_SNAPSHOT_DETACHED");
    }

    #[test]
    fn first_snapshot_of_fresh_worktree_is_allowed() {
        let (_dir, repo, config) = setup();
        // A fresh worktree has neither head nor latest; that is not detached.
        let wt = repo.load_worktree(&WorktreeName::main()).unwrap();
        assert!(!wt.is_detached());
        create(&repo, &config, &WorktreeName::main(), &CreateOptions::default()).unwrap();
    }

    #[test]
    fn empty_tag_is_rejected() {
        let (_dir, repo, config) = setup();
        let err = create(
            &repo,
            &config,
            &WorktreeName::main(),
            &CreateOptions {
                tags: vec!["  ".to_owned()],
                ..CreateOptions::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "E_NAME_INVALID");
    }

    #[test]
    fn snapshot_payload_is_pure() {
        let (_dir, repo, config) = setup();
        let created = create(&repo, &config, &WorktreeName::main(), &CreateOptions::default())
            .unwrap();
        // The snapshot contains the payload plus the READY marker and nothing
        // from the control plane.
        let entries: Vec<String> = std::fs::read_dir(repo.snapshot_dir(&created.descriptor.snapshot_id))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(entries.contains(&"data.txt".to_owned()));
        assert!(entries.contains(&".READY".to_owned()));
        assert!(!entries.iter().any(|e| e.starts_with(".jvs")));
    }

    #[test]
    fn create_respects_existing_session_lease() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        let locks = LockManager::new(&repo, &config.lock);
        let (lease, _) = locks.hold(&main, "interactive session").unwrap();

        // Snapshot reuses the session lease rather than conflicting, and the
        // lease survives the operation.
        create(&repo, &config, &main, &CreateOptions::default()).unwrap();
        let current = locks.current_lease(&main).unwrap().unwrap();
        assert_eq!(current.session_id, lease.session_id);
    }
}
