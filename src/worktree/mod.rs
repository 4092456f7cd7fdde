//! Worktree lifecycle: list, rename, remove, path.
//!
//! A worktree is destroyed by deleting both its payload root and its
//! control-plane metadata directory; its snapshots stay behind and become
//! GC candidates once nothing protects them. `main` is structural and can
//! be neither removed nor renamed.

pub mod fork;
pub mod restore;

use std::path::PathBuf;

use crate::audit;
use crate::config::JvsConfig;
use crate::error::{JvsError, Result};
use crate::lock::{LockManager, LockStatus};
use crate::model::types::WorktreeName;
use crate::model::worktree::WorktreeConfig;
use crate::repo::Repository;

/// All worktrees, sorted by name.
///
/// # Errors
/// I/O failures while scanning.
pub fn list(repo: &Repository) -> Result<Vec<WorktreeConfig>> {
    repo.list_worktrees()
}

/// The payload root of a worktree.
///
/// # Errors
/// `E_WORKTREE_NOT_FOUND` when the worktree does not exist.
pub fn path(repo: &Repository, name: &WorktreeName) -> Result<PathBuf> {
    if !repo.worktree_exists(name) {
        return Err(JvsError::WorktreeNotFound {
            name: name.as_str().to_owned(),
        });
    }
    Ok(repo.payload_root(name))
}

/// Refuse the operation while any lock record exists on `name`.
///
/// Even an expired record marks an unfinished holder; takeover should go
/// through `lock steal`, not through destroying the worktree under it.
fn require_unlocked(repo: &Repository, config: &JvsConfig, name: &WorktreeName) -> Result<()> {
    let locks = LockManager::new(repo, &config.lock);
    match locks.status(name)? {
        LockStatus::Free => Ok(()),
        LockStatus::Held(record) => Err(JvsError::LockConflict {
            worktree: name.as_str().to_owned(),
            expired: false,
            expires_at: record.expires_at,
        }),
        LockStatus::Expired(record) => Err(JvsError::LockConflict {
            worktree: name.as_str().to_owned(),
            expired: true,
            expires_at: record.expires_at,
        }),
    }
}

/// Remove a worktree: payload root and metadata both go.
///
/// # Errors
/// `E_NAME_INVALID` for `main`, `E_WORKTREE_NOT_FOUND`, `E_LOCK_CONFLICT`
/// while a lock record exists, or I/O failures.
pub fn remove(repo: &Repository, config: &JvsConfig, name: &WorktreeName) -> Result<()> {
    if name.is_main() {
        return Err(JvsError::NameInvalid {
            value: name.as_str().to_owned(),
            reason: "the main worktree cannot be removed".to_owned(),
        });
    }
    if !repo.worktree_exists(name) {
        return Err(JvsError::WorktreeNotFound {
            name: name.as_str().to_owned(),
        });
    }
    require_unlocked(repo, config, name)?;

    let payload = repo.payload_root(name);
    if payload.exists() {
        std::fs::remove_dir_all(&payload)?;
    }
    std::fs::remove_dir_all(repo.worktree_meta_dir(name))?;

    audit::record(
        repo,
        "worktree_remove",
        Some(name.as_str()),
        None,
        serde_json::json!({}),
    );
    Ok(())
}

/// Rename a worktree: payload directory, metadata directory, and the name
/// recorded in its config.
///
/// # Errors
/// `E_NAME_INVALID` for `main` on either side, `E_WORKTREE_EXISTS` on a
/// conflict, `E_LOCK_CONFLICT` while a lock record exists, or I/O failures.
pub fn rename(
    repo: &Repository,
    config: &JvsConfig,
    old: &WorktreeName,
    new: &WorktreeName,
) -> Result<()> {
    if old.is_main() || new.is_main() {
        return Err(JvsError::NameInvalid {
            value: WorktreeName::MAIN.to_owned(),
            reason: "the main worktree cannot be renamed".to_owned(),
        });
    }
    let mut cfg = repo.load_worktree(old)?;
    if repo.worktree_exists(new) || repo.payload_root(new).exists() {
        return Err(JvsError::WorktreeExists {
            name: new.as_str().to_owned(),
        });
    }
    require_unlocked(repo, config, old)?;

    std::fs::rename(repo.payload_root(old), repo.payload_root(new))?;
    std::fs::rename(repo.worktree_meta_dir(old), repo.worktree_meta_dir(new))?;
    cfg.name = new.clone();
    repo.store_worktree(&cfg)?;

    audit::record(
        repo,
        "worktree_rename",
        Some(new.as_str()),
        None,
        serde_json::json!({ "from": old.as_str() }),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
