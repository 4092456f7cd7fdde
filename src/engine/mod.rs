//! Clone engines and engine selection.
//!
//! Three interchangeable adapters stage payload trees:
//!
//! * **copy** — recursive deep copy; always available; O(n) in bytes.
//! * **reflink-copy** — directory mirror plus per-file copy-on-write reflink;
//!   O(n) in file count. A file that cannot reflink falls back to a byte
//!   copy and marks the result degraded.
//! * **juicefs-clone** — the filesystem's native directory clone, O(1)
//!   overall. Failure is an error, never a silent fallback.
//!
//! Selection probes juicefs-clone → reflink-copy → copy and picks the first
//! that succeeds without degradation. A forced engine that can only run
//! degraded fails validation loudly.

pub mod copy;
pub mod fsclone;
pub mod reflink;

use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{JvsError, Result};

use copy::CopyEngine;
use fsclone::FsCloneEngine;
use reflink::ReflinkEngine;

// ---------------------------------------------------------------------------
// EngineKind
// ---------------------------------------------------------------------------

/// The clone strategy recorded in descriptors and selectable by operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Recursive deep copy (universal fallback).
    Copy,
    /// Per-file copy-on-write reflink.
    ReflinkCopy,
    /// Native filesystem directory clone.
    JuicefsClone,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copy => f.write_str("copy"),
            Self::ReflinkCopy => f.write_str("reflink-copy"),
            Self::JuicefsClone => f.write_str("juicefs-clone"),
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "copy" => Ok(Self::Copy),
            "reflink-copy" => Ok(Self::ReflinkCopy),
            "juicefs-clone" => Ok(Self::JuicefsClone),
            other => Err(format!(
                "unknown engine '{other}' (expected copy, reflink-copy, or juicefs-clone)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// CloneOutcome
// ---------------------------------------------------------------------------

/// Result of one clone: whether any file degraded to a weaker strategy,
/// and why. Degradation reports are first-class — callers surface them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CloneOutcome {
    pub degraded: bool,
    pub degradations: Vec<String>,
}

impl CloneOutcome {
    /// A clean, non-degraded outcome.
    #[must_use]
    pub const fn clean() -> Self {
        Self {
            degraded: false,
            degradations: Vec::new(),
        }
    }

    /// Record one degradation reason.
    pub fn degrade(&mut self, reason: String) {
        self.degraded = true;
        self.degradations.push(reason);
    }
}

// ---------------------------------------------------------------------------
// CloneEngine trait + AnyEngine
// ---------------------------------------------------------------------------

/// A clone strategy. `src` must be an existing directory; `dst` must not
/// exist yet.
pub trait CloneEngine {
    /// Which strategy this engine implements.
    fn kind(&self) -> EngineKind;

    /// Clone the tree at `src` to `dst`.
    ///
    /// # Errors
    /// Any I/O failure, or an engine-specific failure (e.g. the external
    /// clone binary exiting non-zero).
    fn clone_tree(&self, src: &Path, dst: &Path) -> Result<CloneOutcome>;
}

/// A concrete engine selected at runtime. An enum (rather than
/// `Box<dyn CloneEngine>`) keeps dispatch static and the error type simple.
#[derive(Clone, Copy, Debug)]
pub enum AnyEngine {
    Copy(CopyEngine),
    Reflink(ReflinkEngine),
    FsClone(FsCloneEngine),
}

impl AnyEngine {
    /// Construct the engine for a resolved kind.
    #[must_use]
    pub const fn from_kind(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Copy => Self::Copy(CopyEngine),
            EngineKind::ReflinkCopy => Self::Reflink(ReflinkEngine),
            EngineKind::JuicefsClone => Self::FsClone(FsCloneEngine),
        }
    }
}

impl CloneEngine for AnyEngine {
    fn kind(&self) -> EngineKind {
        match self {
            Self::Copy(e) => e.kind(),
            Self::Reflink(e) => e.kind(),
            Self::FsClone(e) => e.kind(),
        }
    }

    fn clone_tree(&self, src: &Path, dst: &Path) -> Result<CloneOutcome> {
        match self {
            Self::Copy(e) => e.clone_tree(src, dst),
            Self::Reflink(e) => e.clone_tree(src, dst),
            Self::FsClone(e) => e.clone_tree(src, dst),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability probing
// ---------------------------------------------------------------------------

/// Detected clone capabilities for the current host + filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// A throwaway file reflinked successfully.
    pub reflink: bool,
    /// The native clone binary cloned a pilot directory successfully.
    pub fs_clone: bool,
}

/// Environment variable overriding the native clone binary name.
pub const FS_CLONE_BIN_ENV: &str = "JVS_JUICEFS_BIN";

/// The native clone binary to invoke.
#[must_use]
pub fn fs_clone_bin() -> String {
    std::env::var(FS_CLONE_BIN_ENV).unwrap_or_else(|_| "juicefs".to_owned())
}

fn command_available(cmd: &str) -> bool {
    Command::new("sh")
        .args(["-c", &format!("command -v {cmd} >/dev/null 2>&1")])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Attempt one throwaway reflink and report whether it succeeded.
#[must_use]
pub fn probe_reflink() -> bool {
    if !command_available("cp") {
        return false;
    }
    let Ok(dir) = tempfile::tempdir() else {
        return false;
    };
    let src = dir.path().join("probe-src");
    let dst = dir.path().join("probe-dst");
    if std::fs::write(&src, b"reflink-probe").is_err() {
        return false;
    }
    reflink::reflink_file(&src, &dst).is_ok()
}

/// Clone a pilot directory with the native clone binary and observe success
/// without fallback.
#[must_use]
pub fn probe_fs_clone() -> bool {
    let Ok(dir) = tempfile::tempdir() else {
        return false;
    };
    let src = dir.path().join("pilot");
    let dst = dir.path().join("pilot-clone");
    if std::fs::create_dir(&src).is_err() || std::fs::write(src.join("probe"), b"ok").is_err() {
        return false;
    }
    FsCloneEngine.clone_tree(&src, &dst).is_ok() && dst.join("probe").exists()
}

/// Probe once per process and cache the result.
pub fn capabilities() -> Capabilities {
    static CAPS: OnceLock<Capabilities> = OnceLock::new();
    *CAPS.get_or_init(|| Capabilities {
        reflink: probe_reflink(),
        fs_clone: probe_fs_clone(),
    })
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Resolve the engine to use.
///
/// With no preference, probe order is juicefs-clone → reflink-copy → copy;
/// the first capability that holds wins. A forced engine whose capability
/// probe fails is rejected — forcing a degraded engine must fail loudly.
///
/// # Errors
/// `E_CONSISTENCY_UNAVAILABLE` when `forced` names an engine that cannot run
/// without degradation on this host.
pub fn select_engine(forced: Option<EngineKind>, caps: Capabilities) -> Result<AnyEngine> {
    match forced {
        None => {
            let kind = if caps.fs_clone {
                EngineKind::JuicefsClone
            } else if caps.reflink {
                EngineKind::ReflinkCopy
            } else {
                EngineKind::Copy
            };
            Ok(AnyEngine::from_kind(kind))
        }
        Some(EngineKind::Copy) => Ok(AnyEngine::from_kind(EngineKind::Copy)),
        Some(EngineKind::ReflinkCopy) => {
            if caps.reflink {
                Ok(AnyEngine::from_kind(EngineKind::ReflinkCopy))
            } else {
                Err(JvsError::ConsistencyUnavailable {
                    engine: EngineKind::ReflinkCopy.to_string(),
                    reasons: vec![
                        "reflink probe failed: the filesystem does not support copy-on-write clones"
                            .to_owned(),
                    ],
                })
            }
        }
        Some(EngineKind::JuicefsClone) => {
            if caps.fs_clone {
                Ok(AnyEngine::from_kind(EngineKind::JuicefsClone))
            } else {
                Err(JvsError::ConsistencyUnavailable {
                    engine: EngineKind::JuicefsClone.to_string(),
                    reasons: vec![format!(
                        "pilot clone via '{}' failed or the binary is missing",
                        fs_clone_bin()
                    )],
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
