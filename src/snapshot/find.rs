//! Snapshot enumeration, filtering, and reference resolution.

use crate::error::{JvsError, Result};
use crate::model::descriptor::Descriptor;
use crate::model::types::{SnapshotId, WorktreeName};
use crate::refs;
use crate::repo::Repository;

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Filters for `history`-style listings. All criteria are conjunctive.
#[derive(Clone, Debug, Default)]
pub struct SnapshotQuery {
    /// Only snapshots created by this worktree.
    pub worktree: Option<WorktreeName>,
    /// Only snapshots with this exact parent.
    pub parent: Option<SnapshotId>,
    /// Only snapshots carrying this exact tag.
    pub tag: Option<String>,
    /// Only snapshots whose note contains this substring.
    pub note_contains: Option<String>,
    /// Only snapshots created at or after this instant (unix millis).
    pub since_ms: Option<u64>,
    /// Only snapshots created at or before this instant (unix millis).
    pub until_ms: Option<u64>,
    /// Only snapshots that are some worktree's current head.
    pub heads_only: bool,
    /// Keep at most this many results (after sorting).
    pub limit: Option<usize>,
}

impl SnapshotQuery {
    fn matches(&self, d: &Descriptor, heads: &[SnapshotId]) -> bool {
        if let Some(worktree) = &self.worktree {
            if d.worktree_name != *worktree {
                return false;
            }
        }
        if let Some(parent) = &self.parent {
            if d.parent_id.as_ref() != Some(parent) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !d.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(needle) = &self.note_contains {
            if !d.note.as_deref().unwrap_or("").contains(needle.as_str()) {
                return false;
            }
        }
        let created = d.snapshot_id.timestamp_ms();
        if self.since_ms.is_some_and(|since| created < since) {
            return false;
        }
        if self.until_ms.is_some_and(|until| created > until) {
            return false;
        }
        if self.heads_only && !heads.contains(&d.snapshot_id) {
            return false;
        }
        true
    }
}

/// Enumerate descriptors matching `query`, newest first.
///
/// Sorting is lexicographic by snapshot id (monotone with creation time
/// except under clock skew). Unparseable descriptors are skipped — doctor
/// reports them.
///
/// # Errors
/// I/O failures while scanning.
pub fn find(repo: &Repository, query: &SnapshotQuery) -> Result<Vec<Descriptor>> {
    let heads: Vec<SnapshotId> = if query.heads_only {
        repo.list_worktrees()?
            .into_iter()
            .filter_map(|wt| wt.head_snapshot_id)
            .collect()
    } else {
        Vec::new()
    };

    let mut out = Vec::new();
    for id in repo.snapshot_ids()? {
        let Ok(descriptor) = repo.load_descriptor(&id) else {
            continue;
        };
        if query.matches(&descriptor, &heads) {
            out.push(descriptor);
        }
    }
    out.sort_by(|a, b| b.snapshot_id.cmp(&a.snapshot_id));
    if let Some(limit) = query.limit {
        out.truncate(limit);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Reference resolution
// ---------------------------------------------------------------------------

/// The magic reference for the current worktree's latest snapshot.
pub const HEAD_REF: &str = "HEAD";

/// Resolve a user-supplied reference to a published snapshot id.
///
/// Accepted forms, in resolution order: `HEAD` (the current worktree's
/// latest snapshot), a full snapshot id, a ref name, an exact tag (newest
/// match wins), or a unique id prefix of at least
/// [`SnapshotId::SHORT_LEN`] characters.
///
/// # Errors
/// `E_SNAPSHOT_NOT_FOUND` when nothing matches (or a prefix is ambiguous),
/// or the resolved snapshot is not fully published.
pub fn resolve_reference(
    repo: &Repository,
    current: &WorktreeName,
    reference: &str,
) -> Result<SnapshotId> {
    if reference == HEAD_REF {
        let wt = repo.load_worktree(current)?;
        return wt
            .latest_snapshot_id
            .filter(|id| repo.is_published(id))
            .ok_or_else(|| JvsError::SnapshotNotFound {
                reference: format!("{HEAD_REF} (worktree '{current}' has no snapshots)"),
            });
    }

    if let Ok(id) = SnapshotId::new(reference) {
        if repo.is_published(&id) {
            return Ok(id);
        }
        return Err(JvsError::SnapshotNotFound {
            reference: reference.to_owned(),
        });
    }

    if let Some(record) = refs::read_ref(repo, reference)? {
        if repo.is_published(&record.snapshot_id) {
            return Ok(record.snapshot_id);
        }
    }

    // Exact tag: the newest published snapshot carrying it.
    let ids = repo.snapshot_ids()?;
    for id in ids.iter().rev() {
        if let Ok(d) = repo.load_descriptor(id) {
            if d.tags.iter().any(|t| t == reference) && repo.is_published(id) {
                return Ok(id.clone());
            }
        }
    }

    // Unique id prefix (the advertised shortid or longer).
    if reference.len() >= SnapshotId::SHORT_LEN
        && reference.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        let matches: Vec<&SnapshotId> = ids
            .iter()
            .filter(|id| id.as_str().starts_with(reference))
            .collect();
        match matches.as_slice() {
            [only] if repo.is_published(only) => return Ok((*only).clone()),
            [_, _, ..] => {
                return Err(JvsError::SnapshotNotFound {
                    reference: format!("{reference} (ambiguous prefix)"),
                });
            }
            _ => {}
        }
    }

    Err(JvsError::SnapshotNotFound {
        reference: reference.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JvsConfig;
    use crate::engine::EngineKind;
    use crate::snapshot::create::{CreateOptions, create};
    use tempfile::TempDir;

    fn snap(repo: &Repository, note: &str, tags: &[&str]) -> Descriptor {
        std::fs::write(
            repo.payload_root(&WorktreeName::main()).join("data.txt"),
            note,
        )
        .unwrap();
        create(
            repo,
            &JvsConfig::default(),
            &WorktreeName::main(),
            &CreateOptions {
                note: Some(note.to_owned()),
                tags: tags.iter().map(|&t| t.to_owned()).collect(),
                engine: Some(EngineKind::Copy),
            },
        )
        .unwrap()
        .descriptor
    }

    fn setup() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    #[test]
    fn find_returns_newest_first() {
        let (_dir, repo) = setup();
        let a = snap(&repo, "a", &[]);
        let b = snap(&repo, "b", &[]);

        let all = find(&repo, &SnapshotQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].snapshot_id, b.snapshot_id);
        assert_eq!(all[1].snapshot_id, a.snapshot_id);
    }

    #[test]
    fn filters_compose() {
        let (_dir, repo) = setup();
        let a = snap(&repo, "alpha release", &["release"]);
        let _b = snap(&repo, "beta work", &[]);

        let hits = find(
            &repo,
            &SnapshotQuery {
                tag: Some("release".to_owned()),
                note_contains: Some("alpha".to_owned()),
                ..SnapshotQuery::default()
            },
        )
        .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].snapshot_id, a.snapshot_id);

        // Tag match is exact, not substring.
        let none = find(
            &repo,
            &SnapshotQuery {
                tag: Some("rel".to_owned()),
                ..SnapshotQuery::default()
            },
        )
        .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn parent_filter() {
        let (_dir, repo) = setup();
        let a = snap(&repo, "a", &[]);
        let b = snap(&repo, "b", &[]);

        let children = find(
            &repo,
            &SnapshotQuery {
                parent: Some(a.snapshot_id.clone()),
                ..SnapshotQuery::default()
            },
        )
        .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].snapshot_id, b.snapshot_id);
    }

    #[test]
    fn time_window_and_limit() {
        let (_dir, repo) = setup();
        let a = snap(&repo, "a", &[]);
        let b = snap(&repo, "b", &[]);

        let since_b = find(
            &repo,
            &SnapshotQuery {
                since_ms: Some(b.snapshot_id.timestamp_ms()),
                ..SnapshotQuery::default()
            },
        )
        .unwrap();
        assert!(since_b.iter().all(|d| d.snapshot_id >= a.snapshot_id));

        let limited = find(
            &repo,
            &SnapshotQuery {
                limit: Some(1),
                ..SnapshotQuery::default()
            },
        )
        .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].snapshot_id, b.snapshot_id);
    }

    #[test]
    fn heads_only_selects_current_heads() {
        let (_dir, repo) = setup();
        let _a = snap(&repo, "a", &[]);
        let b = snap(&repo, "b", &[]);

        let heads = find(
            &repo,
            &SnapshotQuery {
                heads_only: true,
                ..SnapshotQuery::default()
            },
        )
        .unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].snapshot_id, b.snapshot_id);
    }

    #[test]
    fn resolve_head_full_id_ref_tag_and_prefix() {
        let (_dir, repo) = setup();
        let main = WorktreeName::main();
        let a = snap(&repo, "a", &["golden"]);
        let b = snap(&repo, "b", &[]);
        refs::create_ref(&repo, "stable", &a.snapshot_id).unwrap();

        assert_eq!(
            resolve_reference(&repo, &main, HEAD_REF).unwrap(),
            b.snapshot_id
        );
        assert_eq!(
            resolve_reference(&repo, &main, a.snapshot_id.as_str()).unwrap(),
            a.snapshot_id
        );
        assert_eq!(
            resolve_reference(&repo, &main, "stable").unwrap(),
            a.snapshot_id
        );
        assert_eq!(
            resolve_reference(&repo, &main, "golden").unwrap(),
            a.snapshot_id
        );
        // Unique prefix: chop the last two characters off the full id.
        let prefix = &a.snapshot_id.as_str()[..20];
        assert_eq!(
            resolve_reference(&repo, &main, prefix).unwrap(),
            a.snapshot_id
        );
    }

    #[test]
    fn resolve_failures() {
        let (_dir, repo) = setup();
        let main = WorktreeName::main();

        // HEAD with no snapshots.
        let err = resolve_reference(&repo, &main, HEAD_REF).unwrap_err();
        assert_eq!(err.code(), "E_SNAPSHOT_NOT_FOUND");

        let _a = snap(&repo, "a", &[]);
        let err = resolve_reference(&repo, &main, "no-such-thing").unwrap_err();
        assert_eq!(err.code(), "E_SNAPSHOT_NOT_FOUND");

        // Ambiguous prefix: both snapshots share the millisecond digit prefix
        // only if created in the same millisecond — use a prefix every id
        // shares instead: the first digit of the epoch. Too short anyway.
        let err = resolve_reference(&repo, &main, "1").unwrap_err();
        assert_eq!(err.code(), "E_SNAPSHOT_NOT_FOUND");
    }
}
