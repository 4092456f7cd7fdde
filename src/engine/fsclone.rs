//! Native filesystem directory clone engine.
//!
//! Invokes the distributed filesystem's own clone (`juicefs clone` or an
//! equivalent named via `JVS_JUICEFS_BIN`), which clones a whole directory
//! in O(1) metadata operations. There is no fallback here: a missing binary
//! or a non-zero exit is an error, and the caller's engine selection is
//! responsible for choosing a different strategy up front.

use std::path::Path;
use std::process::{Command, Stdio};

use super::{CloneEngine, CloneOutcome, EngineKind, fs_clone_bin};
use crate::error::{JvsError, Result};

/// The native-clone engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsCloneEngine;

/// Run `<bin> clone <src> <dst>` and map failure to a descriptive error.
fn clone_with_bin(bin: &str, src: &Path, dst: &Path) -> Result<CloneOutcome> {
    let output = Command::new(bin)
        .arg("clone")
        .arg(src)
        .arg(dst)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| {
            JvsError::Io(std::io::Error::other(format!(
                "failed to run '{bin} clone': {e}"
            )))
        })?;

    if output.status.success() {
        Ok(CloneOutcome::clean())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        Err(JvsError::Io(std::io::Error::other(format!(
            "'{bin} clone {} {}' failed (exit {}): {stderr}",
            src.display(),
            dst.display(),
            output
                .status
                .code()
                .map_or_else(|| "signal".to_owned(), |c| c.to_string()),
        ))))
    }
}

impl CloneEngine for FsCloneEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::JuicefsClone
    }

    fn clone_tree(&self, src: &Path, dst: &Path) -> Result<CloneOutcome> {
        clone_with_bin(&fs_clone_bin(), src, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_binary_is_a_loud_error() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();

        let result = clone_with_bin("jvs-no-such-binary", &src, &dir.path().join("dst"));
        assert!(result.is_err(), "missing clone binary must not fall back");
    }

    #[test]
    fn failing_clone_reports_command_detail() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();

        // `false` ignores its arguments and exits 1 — a stand-in for a clone
        // binary rejecting the operation.
        let err = clone_with_bin("false", &src, &dir.path().join("dst")).unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("clone"), "{msg}");
    }
}
