//! Foundation identifier types.
//!
//! Snapshot identifiers and worktree names are validated newtypes: invalid
//! values cannot be constructed, so downstream code never re-checks format.

use std::fmt;
use std::str::FromStr;

use rand::Rng as _;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Which identifier kind failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    SnapshotId,
    WorktreeName,
}

/// A rejected identifier, with the value and the reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ErrorKind,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            ErrorKind::SnapshotId => "snapshot id",
            ErrorKind::WorktreeName => "worktree name",
        };
        write!(f, "invalid {what} '{}': {}", self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// SnapshotId
// ---------------------------------------------------------------------------

/// A validated snapshot identifier: `<13-digit unix millis>-<8 hex>`.
///
/// Lexicographic order approximates creation order because the timestamp is
/// zero-padded to a fixed width. The first 8 characters are the advertised
/// short id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Width of the millisecond timestamp prefix.
    pub const MILLIS_DIGITS: usize = 13;
    /// Width of the random hex suffix.
    pub const SUFFIX_DIGITS: usize = 8;
    /// Number of leading characters advertised as the short id.
    pub const SHORT_LEN: usize = 8;

    /// Parse and validate a snapshot id.
    ///
    /// # Errors
    /// Returns an error describing the first malformed component.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Allocate a fresh id for the given creation instant.
    #[must_use]
    pub fn generate(now_ms: u64) -> Self {
        let mut rng = rand::rng();
        let suffix: u32 = rng.random();
        Self(format!(
            "{now_ms:0width$}-{suffix:08x}",
            width = Self::MILLIS_DIGITS
        ))
    }

    /// The full identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The advertised short form (first [`Self::SHORT_LEN`] characters).
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..Self::SHORT_LEN]
    }

    /// The creation instant encoded in the id, in unix milliseconds.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0[..Self::MILLIS_DIGITS].parse().unwrap_or(0)
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let fail = |reason: String| ValidationError {
            kind: ErrorKind::SnapshotId,
            value: s.to_owned(),
            reason,
        };
        let expected_len = Self::MILLIS_DIGITS + 1 + Self::SUFFIX_DIGITS;
        if s.len() != expected_len {
            return Err(fail(format!(
                "expected {expected_len} characters, got {}",
                s.len()
            )));
        }
        let (millis, rest) = s.split_at(Self::MILLIS_DIGITS);
        if !millis.chars().all(|c| c.is_ascii_digit()) {
            return Err(fail(format!(
                "first {} characters must be decimal digits",
                Self::MILLIS_DIGITS
            )));
        }
        let Some(suffix) = rest.strip_prefix('-') else {
            return Err(fail("missing '-' separator".to_owned()));
        };
        if !suffix
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(fail("suffix must be lowercase hex".to_owned()));
        }
        Ok(())
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// WorktreeName
// ---------------------------------------------------------------------------

/// A validated worktree name.
///
/// Names must be nonempty, at most 64 characters, free of path separators,
/// `..`, control characters, and leading dots. `main` is valid and reserved
/// for the primary worktree.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorktreeName(String);

impl WorktreeName {
    /// The maximum length of a worktree name.
    pub const MAX_LEN: usize = 64;
    /// The reserved name of the primary worktree.
    pub const MAIN: &'static str = "main";

    /// Parse and validate a worktree name.
    ///
    /// # Errors
    /// Returns an error describing why the name was rejected.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// The name for the primary worktree.
    #[must_use]
    pub fn main() -> Self {
        Self(Self::MAIN.to_owned())
    }

    /// Whether this is the primary worktree.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.0 == Self::MAIN
    }

    /// The name as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let fail = |reason: &str| ValidationError {
            kind: ErrorKind::WorktreeName,
            value: s.to_owned(),
            reason: reason.to_owned(),
        };
        if s.is_empty() {
            return Err(fail("name must not be empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(fail("name must be at most 64 characters"));
        }
        if s == "." || s == ".." {
            return Err(fail("'.' and '..' are reserved"));
        }
        if s.starts_with('.') {
            return Err(fail("name must not start with '.'"));
        }
        if s.contains(['/', '\\']) {
            return Err(fail("name must not contain path separators"));
        }
        if s.chars().any(char::is_control) {
            return Err(fail("name must not contain control characters"));
        }
        if s.starts_with(char::is_whitespace) || s.ends_with(char::is_whitespace) {
            return Err(fail("name must not start or end with whitespace"));
        }
        Ok(())
    }
}

impl fmt::Display for WorktreeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorktreeName {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorktreeName {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<WorktreeName> for String {
    fn from(name: WorktreeName) -> Self {
        name.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- SnapshotId --

    #[test]
    fn snapshot_id_valid() {
        let id = SnapshotId::new("1785542400000-09af31bc").unwrap();
        assert_eq!(id.timestamp_ms(), 1_785_542_400_000);
        assert_eq!(id.short(), "17855424");
    }

    #[test]
    fn snapshot_id_generate_shape() {
        let id = SnapshotId::generate(1_785_542_400_000);
        assert_eq!(id.as_str().len(), 22);
        assert_eq!(id.timestamp_ms(), 1_785_542_400_000);
        // Re-parse round-trips.
        assert_eq!(SnapshotId::new(id.as_str()).unwrap(), id);
    }

    #[test]
    fn snapshot_id_rejects_malformed() {
        assert!(SnapshotId::new("").is_err());
        assert!(SnapshotId::new("1785542400000").is_err());
        assert!(SnapshotId::new("1785542400000_09af31bc").is_err());
        assert!(SnapshotId::new("178554240000x-09af31bc").is_err());
        assert!(SnapshotId::new("1785542400000-09AF31BC").is_err());
        assert!(SnapshotId::new("1785542400000-09af31bcf").is_err());
    }

    #[test]
    fn snapshot_id_orders_by_time() {
        let older = SnapshotId::new("1785542400000-ffffffff").unwrap();
        let newer = SnapshotId::new("1785542400001-00000000").unwrap();
        assert!(older < newer);
    }

    #[test]
    fn snapshot_id_serde_round_trip() {
        let id = SnapshotId::generate(1_785_542_400_000);
        let json = serde_json::to_string(&id).unwrap();
        let back: SnapshotId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn snapshot_id_serde_rejects_invalid() {
        assert!(serde_json::from_str::<SnapshotId>("\"nope\"").is_err());
    }

    // -- WorktreeName --

    #[test]
    fn worktree_name_valid() {
        for ok in ["main", "feat", "agent-1", "Feature_X", "a b"] {
            assert!(WorktreeName::new(ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn worktree_name_main_is_reserved() {
        assert!(WorktreeName::main().is_main());
        assert!(!WorktreeName::new("feat").unwrap().is_main());
    }

    #[test]
    fn worktree_name_rejects_invalid() {
        for bad in [
            "", ".", "..", ".hidden", "a/b", "a\\b", "x\u{7}y", " lead", "trail ",
        ] {
            assert!(WorktreeName::new(bad).is_err(), "{bad:?}");
        }
        assert!(WorktreeName::new(&"x".repeat(65)).is_err());
    }

    #[test]
    fn worktree_name_rejects_control_plane_prefix() {
        // `.jvs` starts with '.', so the control plane can never collide
        // with a worktree payload directory.
        assert!(WorktreeName::new(".jvs").is_err());
    }
}
