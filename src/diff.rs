//! Snapshot-to-snapshot diff: file presence and content hashes only.
//!
//! This is not a textual diff — it answers "which paths appeared,
//! disappeared, or changed bytes" between two published snapshots.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::Result;
use crate::fsutil;
use crate::integrity;
use crate::model::descriptor::READY_FILE;
use crate::model::types::SnapshotId;
use crate::repo::Repository;

/// File-level differences from snapshot `a` to snapshot `b`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DiffReport {
    pub a: String,
    pub b: String,
    /// Present in `b` only.
    pub added: Vec<String>,
    /// Present in `a` only.
    pub removed: Vec<String>,
    /// Present in both with different content.
    pub changed: Vec<String>,
}

impl DiffReport {
    /// No differences at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compare two published snapshots.
///
/// # Errors
/// Resolution failures when either snapshot is not published, or I/O
/// failures while walking.
pub fn diff_snapshots(repo: &Repository, a: &SnapshotId, b: &SnapshotId) -> Result<DiffReport> {
    // Loading the descriptors up front surfaces missing snapshots cleanly.
    repo.load_descriptor(a)?;
    repo.load_descriptor(b)?;

    let dir_a = repo.snapshot_dir(a);
    let dir_b = repo.snapshot_dir(b);

    let files_a: BTreeSet<String> = fsutil::walk_regular_files(&dir_a)?
        .into_iter()
        .filter(|rel| rel != READY_FILE)
        .collect();
    let files_b: BTreeSet<String> = fsutil::walk_regular_files(&dir_b)?
        .into_iter()
        .filter(|rel| rel != READY_FILE)
        .collect();

    let mut report = DiffReport {
        a: a.as_str().to_owned(),
        b: b.as_str().to_owned(),
        ..DiffReport::default()
    };

    for rel in files_b.difference(&files_a) {
        report.added.push(rel.clone());
    }
    for rel in files_a.difference(&files_b) {
        report.removed.push(rel.clone());
    }
    for rel in files_a.intersection(&files_b) {
        let hash_a = integrity::file_sha256_hex(&dir_a.join(rel))?;
        let hash_b = integrity::file_sha256_hex(&dir_b.join(rel))?;
        if hash_a != hash_b {
            report.changed.push(rel.clone());
        }
    }

    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
