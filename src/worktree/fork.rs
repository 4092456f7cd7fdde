//! Fork: materialize a new worktree from a snapshot.
//!
//! The safe counterpart to in-place restore — nothing existing is touched.
//! The payload is staged under a `.tmp-*` name and renamed into place, so a
//! crash leaves only a reapable staging directory and never a half-built
//! worktree with a config.

use tracing::info;

use crate::audit;
use crate::config::JvsConfig;
use crate::engine::{self, CloneEngine as _};
use crate::error::{JvsError, Result};
use crate::fsutil;
use crate::model::descriptor::READY_FILE;
use crate::model::types::WorktreeName;
use crate::model::worktree::WorktreeConfig;
use crate::repo::Repository;
use crate::snapshot::find::resolve_reference;
use crate::timeutil;

/// Create worktree `new_name` from the snapshot named by `source`.
///
/// `source` accepts everything [`resolve_reference`] does; `HEAD` means the
/// invoking worktree's latest snapshot. The new worktree starts with
/// `base = head = latest = source`.
///
/// # Errors
/// `E_WORKTREE_EXISTS` on a name conflict, `E_NAME_INVALID` for `main`,
/// resolution errors, or I/O failures.
pub fn fork(
    repo: &Repository,
    config: &JvsConfig,
    source: &str,
    current: &WorktreeName,
    new_name: &WorktreeName,
) -> Result<WorktreeConfig> {
    if new_name.is_main() {
        return Err(JvsError::NameInvalid {
            value: new_name.as_str().to_owned(),
            reason: "'main' is reserved for the primary worktree".to_owned(),
        });
    }
    if repo.worktree_exists(new_name) || repo.payload_root(new_name).exists() {
        return Err(JvsError::WorktreeExists {
            name: new_name.as_str().to_owned(),
        });
    }

    let id = resolve_reference(repo, current, source)?;

    let payload = repo.payload_root(new_name);
    if let Some(parent) = payload.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let staging = fsutil::temp_sibling(&payload);
    let engine = engine::select_engine(config.engine.default.forced(), engine::capabilities())?;
    engine.clone_tree(&repo.snapshot_dir(&id), &staging)?;
    let _ = std::fs::remove_file(staging.join(READY_FILE));
    std::fs::rename(&staging, &payload)?;
    fsutil::sync_parent(&payload);

    let mut cfg = WorktreeConfig::new(
        new_name.clone(),
        timeutil::format_rfc3339_ms(timeutil::now_ms()),
    );
    cfg.base_snapshot_id = Some(id.clone());
    cfg.advance(id.clone());
    repo.store_worktree(&cfg)?;

    audit::record(
        repo,
        "worktree_fork",
        Some(new_name.as_str()),
        Some(id.as_str()),
        serde_json::json!({ "source": source }),
    );
    info!(
        worktree = new_name.as_str(),
        snapshot = id.as_str(),
        "worktree forked"
    );
    Ok(cfg)
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
        std::fs::write(repo.payload_root(&WorktreeName::main()).join("data.txt"), "v1").unwrap();
        create(
            &repo,
            &JvsConfig::default(),
            &WorktreeName::main(),
            &CreateOptions {
                engine: Some(EngineKind::Copy),
                ..CreateOptions::default()
            },
        )
        .unwrap();
        (dir, repo, JvsConfig::default())
    }

    #[test]
    fn fork_materializes_payload_and_config() {
        let (_dir, repo, config) = setup();
        let feat = WorktreeName::new("feat").unwrap();
        let cfg = fork(&repo, &config, "HEAD", &WorktreeName::main(), &feat).unwrap();

        assert_eq!(cfg.base_snapshot_id, cfg.head_snapshot_id);
        assert_eq!(cfg.head_snapshot_id, cfg.latest_snapshot_id);
        assert!(!cfg.is_detached());

        let payload = repo.payload_root(&feat);
        assert_eq!(std::fs::read_to_string(payload.join("data.txt")).unwrap(), "v1");
        assert!(!payload.join(READY_FILE).exists());
    }

    #[test]
    fn fork_is_isolated_from_source() {
        let (_dir, repo, config) = setup();
        let feat = WorktreeName::new("feat").unwrap();
        fork(&repo, &config, "HEAD", &WorktreeName::main(), &feat).unwrap();

        // Writes in the fork stay in the fork.
        std::fs::write(repo.payload_root(&feat).join("x.txt"), "fork only").unwrap();
        assert!(
            !repo
                .payload_root(&WorktreeName::main())
                .join("x.txt")
                .exists()
        );

        // Writes in main stay in main.
        std::fs::write(
            repo.payload_root(&WorktreeName::main()).join("y.txt"),
            "main only",
        )
        .unwrap();
        assert!(!repo.payload_root(&feat).join("y.txt").exists());
    }

    #[test]
    fn fork_payload_matches_snapshot_bytes() {
        let (_dir, repo, config) = setup();
        let feat = WorktreeName::new("feat").unwrap();
        let cfg = fork(&repo, &config, "HEAD", &WorktreeName::main(), &feat).unwrap();
        let id = cfg.base_snapshot_id.unwrap();

        let descriptor = repo.load_descriptor(&id).unwrap();
        assert_eq!(
            crate::integrity::payload_root_hash(&repo.payload_root(&feat)).unwrap(),
            descriptor.payload_root_hash
        );
    }

    #[test]
    fn fork_rejects_conflicts_and_main() {
        let (_dir, repo, config) = setup();
        let feat = WorktreeName::new("feat").unwrap();
        fork(&repo, &config, "HEAD", &WorktreeName::main(), &feat).unwrap();

        let err = fork(&repo, &config, "HEAD", &WorktreeName::main(), &feat).unwrap_err();
        assert_eq!(err.code(), "E_WORKTREE_EXISTS");

        let err = fork(
            &repo,
            &config,
            "HEAD",
            &WorktreeName::main(),
            &WorktreeName::main(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "E_NAME_INVALID");
    }

    #[test]
    fn fork_from_explicit_snapshot_id() {
        let (_dir, repo, config) = setup();
        let main = WorktreeName::main();
        // Advance main past the first snapshot.
        std::fs::write(repo.payload_root(&main).join("data.txt"), "v2").unwrap();
        create(
            &repo,
            &config,
            &main,
            &CreateOptions {
                engine: Some(EngineKind::Copy),
                ..CreateOptions::default()
            },
        )
        .unwrap();

        let first = repo.snapshot_ids().unwrap()[0].clone();
        let feat = WorktreeName::new("from-old").unwrap();
        fork(&repo, &config, first.as_str(), &main, &feat).unwrap();
        assert_eq!(
            std::fs::read_to_string(repo.payload_root(&feat).join("data.txt")).unwrap(),
            "v1"
        );
    }
}
