//! Named refs and GC pins.
//!
//! A ref (`.jvs/refs/<name>.json`) is a human-named pointer to a snapshot,
//! usable anywhere a snapshot reference is accepted. A pin
//! (`.jvs/pins/<id>.json`) is an explicit GC shield for one snapshot,
//! optionally expiring. Both protect their targets from collection.

use serde::{Deserialize, Serialize};

use crate::error::{JvsError, Result};
use crate::fsutil;
use crate::model::types::SnapshotId;
use crate::repo::Repository;
use crate::timeutil;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A named pointer to a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefRecord {
    pub name: String,
    pub snapshot_id: SnapshotId,
    pub created_at: String,
}

/// An explicit GC protection record for one snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    pub snapshot_id: SnapshotId,
    pub created_at: String,
    /// RFC 3339 UTC; `None` pins forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    /// Why the snapshot is pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PinRecord {
    /// Whether this pin still protects its snapshot at `now_ms`.
    #[must_use]
    pub fn is_active(&self, now_ms: u64) -> bool {
        self.expires_at.as_deref().is_none_or(|exp| {
            timeutil::parse_rfc3339(exp).is_ok_and(|exp_ms| exp_ms > now_ms)
        })
    }
}

fn validate_ref_name(name: &str) -> Result<()> {
    let fail = |reason: &str| JvsError::NameInvalid {
        value: name.to_owned(),
        reason: reason.to_owned(),
    };
    if name.is_empty() {
        return Err(fail("ref name must not be empty"));
    }
    if name.len() > 64 {
        return Err(fail("ref name must be at most 64 characters"));
    }
    if name.starts_with('.') || name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return Err(fail(
            "ref name must not start with '.' or contain path separators or control characters",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Refs
// ---------------------------------------------------------------------------

/// Create or move a ref to point at a published snapshot.
///
/// # Errors
/// `E_NAME_INVALID` for a bad name, `E_SNAPSHOT_NOT_FOUND` when the target
/// is not published.
pub fn create_ref(repo: &Repository, name: &str, id: &SnapshotId) -> Result<RefRecord> {
    validate_ref_name(name)?;
    if !repo.is_published(id) {
        return Err(JvsError::SnapshotNotFound {
            reference: id.as_str().to_owned(),
        });
    }
    let record = RefRecord {
        name: name.to_owned(),
        snapshot_id: id.clone(),
        created_at: timeutil::format_rfc3339_ms(timeutil::now_ms()),
    };
    let bytes = serde_json::to_vec_pretty(&record)
        .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
    fsutil::atomic_write(&repo.refs_dir().join(format!("{name}.json")), &bytes)?;
    Ok(record)
}

/// Look up one ref.
///
/// # Errors
/// I/O failures; a malformed record reads as absent.
pub fn read_ref(repo: &Repository, name: &str) -> Result<Option<RefRecord>> {
    let path = repo.refs_dir().join(format!("{name}.json"));
    match std::fs::read(&path) {
        Ok(raw) => Ok(serde_json::from_slice(&raw).ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(JvsError::Io(e)),
    }
}

/// All refs, sorted by name.
///
/// # Errors
/// I/O failures while scanning.
pub fn list_refs(repo: &Repository) -> Result<Vec<RefRecord>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(repo.refs_dir())? {
        let entry = entry?;
        if let Ok(raw) = std::fs::read(entry.path()) {
            if let Ok(record) = serde_json::from_slice::<RefRecord>(&raw) {
                out.push(record);
            }
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Delete a ref. Deleting a missing ref is a no-op success.
///
/// # Errors
/// I/O failures other than absence.
pub fn delete_ref(repo: &Repository, name: &str) -> Result<()> {
    validate_ref_name(name)?;
    match std::fs::remove_file(repo.refs_dir().join(format!("{name}.json"))) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(JvsError::Io(e)),
    }
}

// ---------------------------------------------------------------------------
// Pins
// ---------------------------------------------------------------------------

/// Pin a published snapshot against GC.
///
/// # Errors
/// `E_SNAPSHOT_NOT_FOUND` when the target is not published.
pub fn add_pin(
    repo: &Repository,
    id: &SnapshotId,
    reason: Option<&str>,
    ttl_secs: Option<u64>,
) -> Result<PinRecord> {
    if !repo.is_published(id) {
        return Err(JvsError::SnapshotNotFound {
            reference: id.as_str().to_owned(),
        });
    }
    let now = timeutil::now_ms();
    let record = PinRecord {
        snapshot_id: id.clone(),
        created_at: timeutil::format_rfc3339_ms(now),
        expires_at: ttl_secs.map(|ttl| timeutil::format_rfc3339_ms(now + ttl * 1000)),
        reason: reason.map(str::to_owned),
    };
    let bytes = serde_json::to_vec_pretty(&record)
        .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
    fsutil::atomic_write(
        &repo.pins_dir().join(format!("{}.json", id.as_str())),
        &bytes,
    )?;
    Ok(record)
}

/// Remove a pin. Removing a missing pin is a no-op success.
///
/// # Errors
/// I/O failures other than absence.
pub fn remove_pin(repo: &Repository, id: &SnapshotId) -> Result<()> {
    match std::fs::remove_file(repo.pins_dir().join(format!("{}.json", id.as_str()))) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(JvsError::Io(e)),
    }
}

/// All pins, sorted by snapshot id.
///
/// # Errors
/// I/O failures while scanning.
pub fn list_pins(repo: &Repository) -> Result<Vec<PinRecord>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(repo.pins_dir())? {
        let entry = entry?;
        if let Ok(raw) = std::fs::read(entry.path()) {
            if let Ok(record) = serde_json::from_slice::<PinRecord>(&raw) {
                out.push(record);
            }
        }
    }
    out.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
