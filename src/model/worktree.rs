//! Per-worktree metadata (`.jvs/worktrees/<name>/config.json`).

use serde::{Deserialize, Serialize};

use crate::model::types::{SnapshotId, WorktreeName};

/// Durable metadata for one worktree.
///
/// `head_snapshot_id` may lag `latest_snapshot_id` after an in-place restore;
/// that state is *detached* and new snapshots are forbidden until the head
/// returns to latest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeConfig {
    /// Unique, path-safe name.
    pub name: WorktreeName,
    /// Snapshot this worktree was forked from (`None` for a fresh main).
    pub base_snapshot_id: Option<SnapshotId>,
    /// Current head for this worktree.
    pub head_snapshot_id: Option<SnapshotId>,
    /// Most recent snapshot in this worktree's lineage.
    pub latest_snapshot_id: Option<SnapshotId>,
    /// Creation instant, RFC 3339 UTC.
    pub created_at: String,
}

impl WorktreeConfig {
    /// A fresh worktree with no lineage yet.
    #[must_use]
    pub const fn new(name: WorktreeName, created_at: String) -> Self {
        Self {
            name,
            base_snapshot_id: None,
            head_snapshot_id: None,
            latest_snapshot_id: None,
            created_at,
        }
    }

    /// Whether the head lags the latest snapshot.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        match (&self.latest_snapshot_id, &self.head_snapshot_id) {
            (Some(latest), head) => head.as_ref() != Some(latest),
            (None, _) => false,
        }
    }

    /// Record a newly published snapshot: head and latest both advance.
    pub fn advance(&mut self, id: SnapshotId) {
        self.head_snapshot_id = Some(id.clone());
        self.latest_snapshot_id = Some(id);
    }
}
