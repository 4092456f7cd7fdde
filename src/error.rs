//! Unified error type for JVS engine operations.
//!
//! Every failure that crosses the library boundary is a [`JvsError`] tagged
//! with a stable machine-readable code (see [`JvsError::code`]). Messages are
//! designed to be operator-friendly: each variant includes a clear
//! description of what went wrong and actionable guidance on how to fix it.

use std::fmt;
use std::path::PathBuf;

use crate::model::types::ValidationError;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// How bad a failure is, for JSON output and doctor reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => f.write_str("critical"),
            Self::Error => f.write_str("error"),
            Self::Warning => f.write_str("warning"),
            Self::Info => f.write_str("info"),
        }
    }
}

// ---------------------------------------------------------------------------
// JvsError
// ---------------------------------------------------------------------------

/// Unified error type for JVS operations.
///
/// Each variant is self-contained: an operator receiving this error should be
/// able to understand what happened and what to do next without additional
/// context.
#[derive(Debug)]
pub enum JvsError {
    /// A worktree, tag, or file name failed validation.
    NameInvalid {
        /// The value that was rejected.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    /// A path resolved outside the repository root.
    PathEscape {
        /// The offending path.
        path: PathBuf,
    },

    /// The worktree lock is held by someone else.
    LockConflict {
        /// The contended worktree.
        worktree: String,
        /// Whether the conflicting lease has already expired (steal hint).
        expired: bool,
        /// Expiry instant of the conflicting lease (RFC 3339).
        expires_at: String,
    },

    /// The caller does not hold the lock it claims to hold.
    LockNotHeld {
        /// The worktree in question.
        worktree: String,
    },

    /// The caller's lease expired before the operation completed.
    LockExpired {
        /// The worktree in question.
        worktree: String,
    },

    /// The caller's fencing token no longer matches the live lock record.
    FencingMismatch {
        /// The worktree in question.
        worktree: String,
        /// The token the caller presented.
        presented: i64,
        /// The token in the live record.
        current: i64,
    },

    /// The wall clock disagrees with on-disk lock state beyond the bound.
    ClockSkewExceeded {
        /// Observed disagreement in milliseconds.
        skew_ms: u64,
        /// Configured bound in milliseconds.
        bound_ms: u64,
    },

    /// A descriptor failed its checksum or could not be parsed.
    DescriptorCorrupt {
        /// The snapshot whose descriptor is bad.
        snapshot_id: String,
        /// What exactly is wrong.
        detail: String,
    },

    /// A snapshot payload no longer matches its recorded root hash.
    PayloadHashMismatch {
        /// The snapshot whose payload is bad.
        snapshot_id: String,
        /// Hash recorded in the descriptor.
        expected: String,
        /// Hash recomputed from disk.
        actual: String,
    },

    /// A parent-pointer walk found a cycle or a dangling ancestor.
    LineageBroken {
        /// The snapshot where the walk failed.
        snapshot_id: String,
        /// What exactly is wrong.
        detail: String,
    },

    /// A snapshot directory exists without its READY marker or descriptor.
    PartialSnapshot {
        /// The incomplete snapshot.
        snapshot_id: String,
        /// What is missing.
        detail: String,
    },

    /// A GC plan no longer matches the repository state.
    GcPlanMismatch {
        /// The stale plan.
        plan_id: String,
        /// Which candidates became protected (or disappeared).
        detail: String,
    },

    /// The repository's format version is newer than this build supports.
    FormatUnsupported {
        /// The version found on disk.
        found: String,
        /// The highest version this build understands.
        supported: u32,
    },

    /// The audit log's hash chain does not verify.
    AuditChainBroken {
        /// 0-based line number of the first bad record.
        line: usize,
        /// What exactly is wrong.
        detail: String,
    },

    /// New snapshots are forbidden while the worktree head lags latest.
    SnapshotDetached {
        /// The detached worktree.
        worktree: String,
        /// Current head snapshot.
        head: String,
        /// Latest snapshot in the lineage.
        latest: String,
    },

    /// A destructive operation was invoked without its explicit
    /// confirmation flag or reason.
    ForceRequired {
        /// The operation that needs confirmation.
        operation: String,
        /// What is missing.
        detail: String,
    },

    /// Signature verification was requested but no key is configured.
    SigningKeyMissing,

    /// A forced engine cannot run without degradation.
    ConsistencyUnavailable {
        /// The engine that was forced.
        engine: String,
        /// Why it would degrade.
        reasons: Vec<String>,
    },

    /// The requested snapshot does not exist.
    SnapshotNotFound {
        /// The reference that failed to resolve.
        reference: String,
    },

    /// The requested worktree does not exist.
    WorktreeNotFound {
        /// The worktree name.
        name: String,
    },

    /// A worktree with this name already exists.
    WorktreeExists {
        /// The worktree name.
        name: String,
    },

    /// No JVS repository was found walking up from the start directory.
    RepoNotFound {
        /// Where the search started.
        start: PathBuf,
    },

    /// `.jvs/config.toml` could not be parsed.
    Config {
        /// The configuration file.
        path: PathBuf,
        /// The parse error.
        detail: String,
    },

    /// An on-disk JSON document could not be parsed.
    Json {
        /// The file that failed to parse.
        path: PathBuf,
        /// The parse error.
        source: serde_json::Error,
    },

    /// An I/O error occurred.
    Io(std::io::Error),
}

impl JvsError {
    /// The stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NameInvalid { .. } => "E_NAME_INVALID",
            Self::PathEscape { .. } => "E_PATH_ESCAPE",
            Self::LockConflict { .. } => "E_LOCK_CONFLICT",
            Self::LockNotHeld { .. } => "E_LOCK_NOT_HELD",
            Self::LockExpired { .. } => "E_LOCK_EXPIRED",
            Self::FencingMismatch { .. } => "E_FENCING_MISMATCH",
            Self::ClockSkewExceeded { .. } => "E_CLOCK_SKEW_EXCEEDED",
            Self::DescriptorCorrupt { .. } => "E_DESCRIPTOR_CORRUPT",
            Self::PayloadHashMismatch { .. } => "E_PAYLOAD_HASH_MISMATCH",
            Self::LineageBroken { .. } => "E_LINEAGE_BROKEN",
            Self::PartialSnapshot { .. } => "E_PARTIAL_SNAPSHOT",
            Self::GcPlanMismatch { .. } => "E_GC_PLAN_MISMATCH",
            Self::FormatUnsupported { .. } => "E_FORMAT_UNSUPPORTED",
            Self::AuditChainBroken { .. } => "E_AUDIT_CHAIN_BROKEN",
            Self::SnapshotDetached { .. } => "E_SNAPSHOT_DETACHED",
            Self::ForceRequired { .. } => "E_FORCE_REQUIRED",
            Self::SigningKeyMissing => "E_SIGNING_KEY_MISSING",
            Self::ConsistencyUnavailable { .. } => "E_CONSISTENCY_UNAVAILABLE",
            Self::SnapshotNotFound { .. } => "E_SNAPSHOT_NOT_FOUND",
            Self::WorktreeNotFound { .. } => "E_WORKTREE_NOT_FOUND",
            Self::WorktreeExists { .. } => "E_WORKTREE_EXISTS",
            Self::RepoNotFound { .. } => "E_REPO_NOT_FOUND",
            Self::Config { .. } => "E_CONFIG_INVALID",
            Self::Json { .. } => "E_JSON_INVALID",
            Self::Io(_) => "E_IO",
        }
    }

    /// Severity classification for JSON output.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::DescriptorCorrupt { .. }
            | Self::PayloadHashMismatch { .. }
            | Self::LineageBroken { .. }
            | Self::PartialSnapshot { .. }
            | Self::AuditChainBroken { .. }
            | Self::FormatUnsupported { .. } => Severity::Critical,
            _ => Severity::Error,
        }
    }

    /// The path most relevant to this error, if any.
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::PathEscape { path } | Self::Json { path, .. } | Self::Config { path, .. } => {
                Some(path)
            }
            Self::RepoNotFound { start } => Some(start),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Display — operator-friendly error messages
// ---------------------------------------------------------------------------

impl fmt::Display for JvsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameInvalid { value, reason } => {
                write!(f, "invalid name '{value}': {reason}")
            }
            Self::PathEscape { path } => {
                write!(
                    f,
                    "path '{}' escapes the repository root.\n  To fix: use a path inside the repository.",
                    path.display()
                )
            }
            Self::LockConflict {
                worktree,
                expired,
                expires_at,
            } => {
                if *expired {
                    write!(
                        f,
                        "lock on worktree '{worktree}' is held but expired (at {expires_at}).\n  To fix: take it over explicitly:\n    jvs lock steal"
                    )
                } else {
                    write!(
                        f,
                        "lock on worktree '{worktree}' is held by another session until {expires_at}.\n  To fix: wait for the lease to expire, or coordinate with the holder."
                    )
                }
            }
            Self::LockNotHeld { worktree } => {
                write!(
                    f,
                    "no lock held on worktree '{worktree}' for this session.\n  To fix: acquire it first:\n    jvs lock acquire"
                )
            }
            Self::LockExpired { worktree } => {
                write!(
                    f,
                    "the lease on worktree '{worktree}' expired before the operation completed.\n  To fix: re-acquire and retry:\n    jvs lock acquire"
                )
            }
            Self::FencingMismatch {
                worktree,
                presented,
                current,
            } => {
                write!(
                    f,
                    "fencing token {presented} is stale for worktree '{worktree}' (current token is {current}); the lock was stolen.\n  To fix: re-acquire the lock and retry the operation."
                )
            }
            Self::ClockSkewExceeded { skew_ms, bound_ms } => {
                write!(
                    f,
                    "clock skew of {skew_ms} ms exceeds the configured bound of {bound_ms} ms.\n  To fix: check NTP synchronization on all hosts sharing this repository."
                )
            }
            Self::DescriptorCorrupt {
                snapshot_id,
                detail,
            } => {
                write!(
                    f,
                    "descriptor for snapshot {snapshot_id} is corrupt: {detail}\n  To fix: run `jvs doctor` and inspect the descriptor file."
                )
            }
            Self::PayloadHashMismatch {
                snapshot_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "payload of snapshot {snapshot_id} does not match its recorded hash\n  expected: {expected}\n  actual:   {actual}\n  The published payload was mutated after publication."
                )
            }
            Self::LineageBroken {
                snapshot_id,
                detail,
            } => {
                write!(f, "lineage broken at snapshot {snapshot_id}: {detail}")
            }
            Self::PartialSnapshot {
                snapshot_id,
                detail,
            } => {
                write!(
                    f,
                    "snapshot {snapshot_id} is incomplete: {detail}\n  To fix: reap it with `jvs doctor --repair-runtime`."
                )
            }
            Self::GcPlanMismatch { plan_id, detail } => {
                write!(
                    f,
                    "gc plan {plan_id} is stale: {detail}\n  To fix: create a fresh plan:\n    jvs gc plan"
                )
            }
            Self::FormatUnsupported { found, supported } => {
                write!(
                    f,
                    "repository format version '{found}' is not supported (this build understands up to {supported}).\n  To fix: upgrade jvs."
                )
            }
            Self::AuditChainBroken { line, detail } => {
                write!(
                    f,
                    "audit log hash chain broken at line {line}: {detail}\n  To fix: investigate, then rebuild the chain with `jvs doctor` repair action audit_repair."
                )
            }
            Self::SnapshotDetached {
                worktree,
                head,
                latest,
            } => {
                write!(
                    f,
                    "worktree '{worktree}' is detached (head {head}, latest {latest}); new snapshots are forbidden.\n  To fix: return to the latest snapshot first:\n    jvs restore HEAD --force --reason \"leave detached state\""
                )
            }
            Self::ForceRequired { operation, detail } => {
                write!(
                    f,
                    "{operation} is destructive and was not confirmed: {detail}"
                )
            }
            Self::SigningKeyMissing => {
                write!(
                    f,
                    "signature verification requested but no signing key is configured."
                )
            }
            Self::ConsistencyUnavailable { engine, reasons } => {
                write!(f, "engine '{engine}' cannot run without degradation:")?;
                for r in reasons {
                    write!(f, "\n  - {r}")?;
                }
                write!(
                    f,
                    "\n  To fix: pick another engine or drop the --engine override."
                )
            }
            Self::SnapshotNotFound { reference } => {
                write!(
                    f,
                    "snapshot '{reference}' not found.\n  To fix: list snapshots:\n    jvs history"
                )
            }
            Self::WorktreeNotFound { name } => {
                write!(
                    f,
                    "worktree '{name}' not found.\n  To fix: list worktrees:\n    jvs worktree list"
                )
            }
            Self::WorktreeExists { name } => {
                write!(
                    f,
                    "worktree '{name}' already exists.\n  To fix: pick a different name, or remove it first:\n    jvs worktree remove {name}"
                )
            }
            Self::RepoNotFound { start } => {
                write!(
                    f,
                    "no JVS repository found walking up from '{}'.\n  To fix: run inside a repository, or create one:\n    jvs init <name>",
                    start.display()
                )
            }
            Self::Config { path, detail } => {
                write!(
                    f,
                    "configuration error in '{}': {detail}\n  To fix: edit the config file and correct the issue.",
                    path.display()
                )
            }
            Self::Json { path, source } => {
                write!(f, "malformed JSON in '{}': {source}", path.display())
            }
            Self::Io(err) => {
                write!(
                    f,
                    "I/O error: {err}\n  To fix: check file permissions and disk space."
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// std::error::Error
// ---------------------------------------------------------------------------

impl std::error::Error for JvsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<std::io::Error> for JvsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ValidationError> for JvsError {
    fn from(err: ValidationError) -> Self {
        Self::NameInvalid {
            value: err.value,
            reason: err.reason,
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, JvsError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
