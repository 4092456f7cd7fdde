//! Reflink (copy-on-write) engine.
//!
//! Mirrors the directory tree with `mkdir`, then reflinks each regular file
//! via the platform `cp --reflink=always` (the `FICLONE`-equivalent adapter).
//! On Btrfs, XFS, and JuiceFS-backed mounts each file clone is O(1).
//!
//! # Fallback behaviour
//!
//! A file that fails to reflink is byte-copied instead and the outcome is
//! marked degraded with a per-file reason. The clone still completes — the
//! caller decides whether a degraded result is acceptable.

use std::path::Path;
use std::process::{Command, Stdio};

use super::{CloneEngine, CloneOutcome, EngineKind};
use crate::error::Result;
use crate::fsutil;

/// Per-file copy-on-write engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReflinkEngine;

/// Reflink a single regular file, refusing any fallback.
///
/// # Errors
/// An `std::io::Error` carrying `cp`'s stderr when the clone fails.
pub fn reflink_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    let output = Command::new("cp")
        .arg("--reflink=always")
        .arg(src)
        .arg(dst)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        Err(std::io::Error::other(if stderr.is_empty() {
            format!("cp --reflink=always exited with {}", output.status)
        } else {
            stderr
        }))
    }
}

impl ReflinkEngine {
    fn clone_entries(src: &Path, dst: &Path, rel: &Path, outcome: &mut CloneOutcome) -> Result<()> {
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            let meta = std::fs::symlink_metadata(entry.path())?;
            let from = entry.path();
            let to = dst.join(entry.file_name());
            let rel_child = rel.join(entry.file_name());
            if meta.is_dir() {
                std::fs::create_dir(&to)?;
                std::fs::set_permissions(&to, meta.permissions())?;
                Self::clone_entries(&from, &to, &rel_child, outcome)?;
            } else if meta.is_file() {
                if let Err(e) = reflink_file(&from, &to) {
                    outcome.degrade(format!(
                        "reflink failed for '{}' ({e}); fell back to byte copy",
                        rel_child.display()
                    ));
                    let _ = std::fs::remove_file(&to);
                    fsutil::copy_file_preserving(&from, &to, &meta)?;
                }
            } else {
                return Err(fsutil::non_regular(&from));
            }
        }
        Ok(())
    }
}

impl CloneEngine for ReflinkEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::ReflinkCopy
    }

    fn clone_tree(&self, src: &Path, dst: &Path) -> Result<CloneOutcome> {
        std::fs::create_dir_all(dst)?;
        let mut outcome = CloneOutcome::clean();
        Self::clone_entries(src, dst, Path::new(""), &mut outcome)?;
        Ok(outcome)
    }
}
