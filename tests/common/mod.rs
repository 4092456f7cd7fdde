//! Shared helpers for jvs integration tests.
//!
//! All tests run against temp directories — no side effects outside them.
//! Helpers force the `copy` engine so results do not depend on the host
//! filesystem's reflink or native-clone support.
#![allow(dead_code)] // each test binary uses a different subset

use std::path::Path;

use tempfile::TempDir;

use jvs::config::JvsConfig;
use jvs::engine::EngineKind;
use jvs::model::descriptor::Descriptor;
use jvs::model::types::WorktreeName;
use jvs::repo::Repository;
use jvs::snapshot::create::{CreateOptions, create};

/// Create a fresh repository in a temp directory.
pub fn init_repo() -> (TempDir, Repository, JvsConfig) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo = Repository::init(&dir.path().join("repo")).expect("jvs init failed");
    (dir, repo, JvsConfig::default())
}

/// The main worktree's name.
pub fn main_wt() -> WorktreeName {
    WorktreeName::main()
}

/// Write a file (creating parents) inside a worktree's payload.
pub fn write_payload(repo: &Repository, worktree: &WorktreeName, rel: &str, content: &str) {
    let path = repo.payload_root(worktree).join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir failed");
    }
    std::fs::write(path, content).expect("write failed");
}

/// Read a payload file back.
pub fn read_payload(repo: &Repository, worktree: &WorktreeName, rel: &str) -> String {
    std::fs::read_to_string(repo.payload_root(worktree).join(rel)).expect("read failed")
}

/// Snapshot a worktree with a note, forcing the copy engine.
pub fn snapshot(
    repo: &Repository,
    config: &JvsConfig,
    worktree: &WorktreeName,
    note: &str,
) -> Descriptor {
    create(
        repo,
        config,
        worktree,
        &CreateOptions {
            note: Some(note.to_owned()),
            tags: Vec::new(),
            engine: Some(EngineKind::Copy),
        },
    )
    .expect("snapshot failed")
    .descriptor
}

/// Snapshot with tags.
pub fn snapshot_tagged(
    repo: &Repository,
    config: &JvsConfig,
    worktree: &WorktreeName,
    note: &str,
    tags: &[&str],
) -> Descriptor {
    create(
        repo,
        config,
        worktree,
        &CreateOptions {
            note: Some(note.to_owned()),
            tags: tags.iter().map(|&t| t.to_owned()).collect(),
            engine: Some(EngineKind::Copy),
        },
    )
    .expect("snapshot failed")
    .descriptor
}

/// Names of entries in a directory (empty for a missing one).
pub fn dir_entries(path: &Path) -> Vec<String> {
    match std::fs::read_dir(path) {
        Ok(entries) => entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}
