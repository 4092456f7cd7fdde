//! Repository root: scaffolding, discovery, and the on-disk stores.
//!
//! A repository is a root directory holding the control plane `.jvs/` and
//! one or more payload roots. The main worktree's payload is `<root>/main/`;
//! named worktrees live under `<root>/worktrees/<name>/`. Payload roots hold
//! ONLY user data — the control plane never appears inside them, and nothing
//! here filters files: purity is structural.
//!
//! ```text
//! <root>/
//! ├── .jvs/
//! │   ├── format_version            single integer, LF-terminated
//! │   ├── repo_id                   opaque nonempty identifier
//! │   ├── config.toml               optional typed config
//! │   ├── worktrees/<name>/         config.json (+ transient lock.json, .session)
//! │   ├── snapshots/<id>/           published payload (staging: <id>.tmp)
//! │   ├── descriptors/<id>.json     published descriptors
//! │   ├── intents/                  in-flight operation intents
//! │   ├── audit/audit.jsonl         hash-chained event log
//! │   ├── gc/<plan_id>.json         persisted GC plans
//! │   ├── refs/<name>.json          named snapshot pointers
//! │   └── pins/<id>.json            GC protection records
//! ├── main/                         primary worktree payload
//! └── worktrees/<name>/             named worktree payloads
//! ```

use std::path::{Path, PathBuf};

use crate::error::{JvsError, Result};
use crate::fsutil;
use crate::model::descriptor::{Descriptor, READY_FILE, ReadyMarker};
use crate::model::types::{SnapshotId, WorktreeName};
use crate::model::worktree::WorktreeConfig;
use crate::timeutil;

/// Control plane directory name.
pub const CONTROL_DIR: &str = ".jvs";

/// Highest repository format version this build understands.
pub const FORMAT_VERSION: u32 = 1;

/// Suffix of snapshot staging directories (`snapshots/<id>.tmp`).
pub const STAGING_SUFFIX: &str = ".tmp";

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Handle to a discovered repository root.
#[derive(Clone, Debug)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Scaffold a new repository at `root` (created if absent) with an empty
    /// `main` worktree.
    ///
    /// # Errors
    /// `E_IO` if `root` already contains a control plane or scaffolding
    /// fails.
    pub fn init(root: &Path) -> Result<Self> {
        let control = root.join(CONTROL_DIR);
        if control.exists() {
            return Err(JvsError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("'{}' is already a JVS repository", root.display()),
            )));
        }

        for dir in [
            control.join("worktrees"),
            control.join("snapshots"),
            control.join("descriptors"),
            control.join("intents"),
            control.join("audit"),
            control.join("gc"),
            control.join("refs"),
            control.join("pins"),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        fsutil::atomic_write(
            &control.join("format_version"),
            format!("{FORMAT_VERSION}\n").as_bytes(),
        )?;
        fsutil::atomic_write(
            &control.join("repo_id"),
            format!("{}\n", fsutil::rand_hex(16)).as_bytes(),
        )?;

        let repo = Self {
            root: root.to_path_buf(),
        };
        std::fs::create_dir_all(repo.payload_root(&WorktreeName::main()))?;
        let cfg = WorktreeConfig::new(
            WorktreeName::main(),
            timeutil::format_rfc3339_ms(timeutil::now_ms()),
        );
        repo.store_worktree(&cfg)?;
        Ok(repo)
    }

    /// Open a repository whose root is already known.
    ///
    /// # Errors
    /// `E_REPO_NOT_FOUND` if there is no control plane at `root`;
    /// `E_FORMAT_UNSUPPORTED` if the format gate fails.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.join(CONTROL_DIR).join("format_version").is_file() {
            return Err(JvsError::RepoNotFound {
                start: root.to_path_buf(),
            });
        }
        let repo = Self {
            root: root.to_path_buf(),
        };
        repo.format_version()?;
        Ok(repo)
    }

    /// Walk up from `start` to find the nearest enclosing repository.
    ///
    /// # Errors
    /// `E_REPO_NOT_FOUND` if no ancestor carries a control plane;
    /// `E_FORMAT_UNSUPPORTED` if the format gate fails.
    pub fn discover(start: &Path) -> Result<Self> {
        let start = start
            .canonicalize()
            .map_err(|_| JvsError::RepoNotFound {
                start: start.to_path_buf(),
            })?;
        let mut dir: &Path = &start;
        loop {
            if dir.join(CONTROL_DIR).join("format_version").is_file() {
                return Self::open(dir);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => {
                    return Err(JvsError::RepoNotFound { start });
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Identity & format gate
    // -----------------------------------------------------------------------

    /// The repository root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The control plane directory.
    #[must_use]
    pub fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR)
    }

    /// The opaque repository identifier.
    ///
    /// # Errors
    /// `E_IO` if the id file is missing or empty.
    pub fn repo_id(&self) -> Result<String> {
        let raw = std::fs::read_to_string(self.control_dir().join("repo_id"))?;
        let id = raw.trim().to_owned();
        if id.is_empty() {
            return Err(JvsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "repo_id is empty",
            )));
        }
        Ok(id)
    }

    /// Read and gate the repository format version.
    ///
    /// # Errors
    /// `E_FORMAT_UNSUPPORTED` if the file is non-numeric or newer than this
    /// build supports.
    pub fn format_version(&self) -> Result<u32> {
        let raw = std::fs::read_to_string(self.control_dir().join("format_version"))?;
        let trimmed = raw.trim();
        let version: u32 = trimmed.parse().map_err(|_| JvsError::FormatUnsupported {
            found: trimmed.to_owned(),
            supported: FORMAT_VERSION,
        })?;
        if version > FORMAT_VERSION {
            return Err(JvsError::FormatUnsupported {
                found: trimmed.to_owned(),
                supported: FORMAT_VERSION,
            });
        }
        Ok(version)
    }

    // -----------------------------------------------------------------------
    // Layout paths
    // -----------------------------------------------------------------------

    /// Payload root for a worktree (`main/` or `worktrees/<name>/`).
    #[must_use]
    pub fn payload_root(&self, name: &WorktreeName) -> PathBuf {
        if name.is_main() {
            self.root.join(WorktreeName::MAIN)
        } else {
            self.root.join("worktrees").join(name.as_str())
        }
    }

    /// Control-plane metadata directory for a worktree.
    #[must_use]
    pub fn worktree_meta_dir(&self, name: &WorktreeName) -> PathBuf {
        self.control_dir().join("worktrees").join(name.as_str())
    }

    /// `config.json` path for a worktree.
    #[must_use]
    pub fn worktree_config_path(&self, name: &WorktreeName) -> PathBuf {
        self.worktree_meta_dir(name).join("config.json")
    }

    /// Transient lock record path for a worktree.
    #[must_use]
    pub fn lock_path(&self, name: &WorktreeName) -> PathBuf {
        self.worktree_meta_dir(name).join("lock.json")
    }

    /// Session sidecar path for a worktree.
    #[must_use]
    pub fn session_path(&self, name: &WorktreeName) -> PathBuf {
        self.worktree_meta_dir(name).join(".session")
    }

    /// Fencing counter path for a worktree (persists token monotonicity
    /// across lease gaps).
    #[must_use]
    pub fn fencing_path(&self, name: &WorktreeName) -> PathBuf {
        self.worktree_meta_dir(name).join(".fencing")
    }

    /// `snapshots/` directory.
    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.control_dir().join("snapshots")
    }

    /// Published payload directory for a snapshot.
    #[must_use]
    pub fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots_dir().join(id.as_str())
    }

    /// Staging directory for a snapshot being created.
    #[must_use]
    pub fn staging_dir(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots_dir()
            .join(format!("{}{STAGING_SUFFIX}", id.as_str()))
    }

    /// READY marker path inside a published snapshot.
    #[must_use]
    pub fn ready_path(&self, id: &SnapshotId) -> PathBuf {
        self.snapshot_dir(id).join(READY_FILE)
    }

    /// `descriptors/` directory.
    #[must_use]
    pub fn descriptors_dir(&self) -> PathBuf {
        self.control_dir().join("descriptors")
    }

    /// Descriptor path for a snapshot.
    #[must_use]
    pub fn descriptor_path(&self, id: &SnapshotId) -> PathBuf {
        self.descriptors_dir().join(format!("{}.json", id.as_str()))
    }

    /// `intents/` directory.
    #[must_use]
    pub fn intents_dir(&self) -> PathBuf {
        self.control_dir().join("intents")
    }

    /// Intent file path for a snapshot-scoped operation.
    #[must_use]
    pub fn intent_path(&self, id: &SnapshotId) -> PathBuf {
        self.intents_dir().join(format!("{}.json", id.as_str()))
    }

    /// The audit log path.
    #[must_use]
    pub fn audit_path(&self) -> PathBuf {
        self.control_dir().join("audit").join("audit.jsonl")
    }

    /// `gc/` plan directory.
    #[must_use]
    pub fn gc_dir(&self) -> PathBuf {
        self.control_dir().join("gc")
    }

    /// Persisted plan path.
    #[must_use]
    pub fn plan_path(&self, plan_id: &str) -> PathBuf {
        self.gc_dir().join(format!("{plan_id}.json"))
    }

    /// `refs/` directory.
    #[must_use]
    pub fn refs_dir(&self) -> PathBuf {
        self.control_dir().join("refs")
    }

    /// `pins/` directory.
    #[must_use]
    pub fn pins_dir(&self) -> PathBuf {
        self.control_dir().join("pins")
    }

    // -----------------------------------------------------------------------
    // Worktree config store
    // -----------------------------------------------------------------------

    /// Load a worktree's config.
    ///
    /// # Errors
    /// `E_WORKTREE_NOT_FOUND` if absent; `E_JSON_INVALID` if malformed.
    pub fn load_worktree(&self, name: &WorktreeName) -> Result<WorktreeConfig> {
        let path = self.worktree_config_path(name);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JvsError::WorktreeNotFound {
                    name: name.as_str().to_owned(),
                });
            }
            Err(e) => return Err(JvsError::Io(e)),
        };
        serde_json::from_slice(&raw).map_err(|source| JvsError::Json { path, source })
    }

    /// Durably store a worktree's config.
    ///
    /// # Errors
    /// Any I/O failure.
    pub fn store_worktree(&self, cfg: &WorktreeConfig) -> Result<()> {
        let dir = self.worktree_meta_dir(&cfg.name);
        std::fs::create_dir_all(&dir)?;
        let bytes = serde_json::to_vec_pretty(cfg)
            .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
        fsutil::atomic_write(&self.worktree_config_path(&cfg.name), &bytes)
    }

    /// Whether a worktree exists (config present).
    #[must_use]
    pub fn worktree_exists(&self, name: &WorktreeName) -> bool {
        self.worktree_config_path(name).is_file()
    }

    /// All worktree configs, sorted by name. Directories without a parseable
    /// config are skipped.
    ///
    /// # Errors
    /// Any I/O failure while scanning.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeConfig>> {
        let dir = self.control_dir().join("worktrees");
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Ok(name) = WorktreeName::new(&name) else {
                continue;
            };
            if let Ok(cfg) = self.load_worktree(&name) {
                out.push(cfg);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Which worktree's payload root contains `path`; `main` when the path
    /// is inside the repository but outside every payload root.
    #[must_use]
    pub fn resolve_worktree_from_path(&self, path: &Path) -> WorktreeName {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if let Ok(rest) = path.strip_prefix(self.root.join("worktrees")) {
            if let Some(first) = rest.components().next() {
                if let Some(s) = first.as_os_str().to_str() {
                    if let Ok(name) = WorktreeName::new(s) {
                        if self.worktree_exists(&name) {
                            return name;
                        }
                    }
                }
            }
        }
        WorktreeName::main()
    }

    // -----------------------------------------------------------------------
    // Descriptor store
    // -----------------------------------------------------------------------

    /// Load a snapshot descriptor (without verifying its checksum).
    ///
    /// # Errors
    /// `E_SNAPSHOT_NOT_FOUND` if absent; `E_DESCRIPTOR_CORRUPT` if
    /// unparseable.
    pub fn load_descriptor(&self, id: &SnapshotId) -> Result<Descriptor> {
        let path = self.descriptor_path(id);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JvsError::SnapshotNotFound {
                    reference: id.as_str().to_owned(),
                });
            }
            Err(e) => return Err(JvsError::Io(e)),
        };
        serde_json::from_slice(&raw).map_err(|e| JvsError::DescriptorCorrupt {
            snapshot_id: id.as_str().to_owned(),
            detail: format!("unparseable descriptor: {e}"),
        })
    }

    /// Durably store a descriptor as canonical JSON.
    ///
    /// # Errors
    /// Any I/O failure.
    pub fn store_descriptor(&self, descriptor: &Descriptor) -> Result<()> {
        let bytes = crate::integrity::canonical_json_bytes(descriptor)
            .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
        fsutil::atomic_write(&self.descriptor_path(&descriptor.snapshot_id), &bytes)
    }

    /// Ids of all snapshots with a descriptor on disk, sorted ascending.
    ///
    /// # Errors
    /// Any I/O failure while scanning.
    pub fn snapshot_ids(&self) -> Result<Vec<SnapshotId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(self.descriptors_dir())? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if let Ok(id) = SnapshotId::new(stem) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Whether a snapshot is fully published: descriptor, payload directory,
    /// and READY marker all present.
    #[must_use]
    pub fn is_published(&self, id: &SnapshotId) -> bool {
        self.descriptor_path(id).is_file()
            && self.snapshot_dir(id).is_dir()
            && self.ready_path(id).is_file()
    }

    /// Load a snapshot's READY marker.
    ///
    /// # Errors
    /// `E_PARTIAL_SNAPSHOT` if absent or unparseable.
    pub fn load_ready(&self, id: &SnapshotId) -> Result<ReadyMarker> {
        let path = self.ready_path(id);
        let raw = std::fs::read(&path).map_err(|_| JvsError::PartialSnapshot {
            snapshot_id: id.as_str().to_owned(),
            detail: "READY marker is missing".to_owned(),
        })?;
        serde_json::from_slice(&raw).map_err(|e| JvsError::PartialSnapshot {
            snapshot_id: id.as_str().to_owned(),
            detail: format!("READY marker is unparseable: {e}"),
        })
    }

    /// Durably store a READY marker.
    ///
    /// # Errors
    /// Any I/O failure.
    pub fn store_ready(&self, marker: &ReadyMarker) -> Result<()> {
        let bytes = crate::integrity::canonical_json_bytes(marker)
            .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
        fsutil::atomic_write(&self.ready_path(&marker.snapshot_id), &bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
