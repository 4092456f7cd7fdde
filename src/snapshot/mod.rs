//! Snapshot pipelines: create, verify, find.

pub mod create;
pub mod find;
pub mod verify;

use serde::{Deserialize, Serialize};

use crate::error::{JvsError, Result};
use crate::fsutil;
use crate::model::types::{SnapshotId, WorktreeName};
use crate::repo::Repository;
use crate::timeutil;

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

/// An in-flight operation record at `.jvs/intents/<id>.json`.
///
/// Intents describe what a crashed process was doing — they exist for human
/// forensics, not replay. Repair is idempotent cleanup, never redo.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRecord {
    /// What the operation was (`snapshot_create`, `restore_inplace`, ...).
    pub operation: String,
    pub snapshot_id: SnapshotId,
    pub worktree: WorktreeName,
    pub created_at: String,
}

/// Durably record an intent before staging begins.
///
/// # Errors
/// Any I/O failure.
pub fn write_intent(
    repo: &Repository,
    operation: &str,
    id: &SnapshotId,
    worktree: &WorktreeName,
) -> Result<()> {
    let intent = IntentRecord {
        operation: operation.to_owned(),
        snapshot_id: id.clone(),
        worktree: worktree.clone(),
        created_at: timeutil::format_rfc3339_ms(timeutil::now_ms()),
    };
    let bytes = serde_json::to_vec_pretty(&intent)
        .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
    fsutil::atomic_write(&repo.intent_path(id), &bytes)
}

/// Remove an intent after the operation completed. A missing intent is fine.
pub fn remove_intent(repo: &Repository, id: &SnapshotId) {
    let _ = std::fs::remove_file(repo.intent_path(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn intent_round_trip_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(&dir.path().join("repo")).unwrap();
        let id = SnapshotId::new("1785542400000-09af31bc").unwrap();

        write_intent(&repo, "snapshot_create", &id, &WorktreeName::main()).unwrap();
        let raw = std::fs::read(repo.intent_path(&id)).unwrap();
        let intent: IntentRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(intent.operation, "snapshot_create");
        assert_eq!(intent.snapshot_id, id);

        remove_intent(&repo, &id);
        assert!(!repo.intent_path(&id).exists());
        // Removing again is harmless.
        remove_intent(&repo, &id);
    }
}
