//! Snapshot verification: descriptor checksum and payload root hash.
//!
//! A failed check demotes the descriptor's `integrity_state` to `corrupt`
//! (the one mutable field); a full payload verification promotes it to
//! `verified`. A missing descriptor or READY marker is critical — there is
//! no state left to demote.

use serde::Serialize;

use crate::error::{JvsError, Result};
use crate::integrity;
use crate::model::descriptor::{IntegrityState, READY_FILE};
use crate::model::types::SnapshotId;
use crate::repo::Repository;

/// Per-snapshot verification verdict, shaped for JSON output.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyOutcome {
    pub snapshot_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<IntegrityState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Verify one snapshot.
///
/// Always recomputes the descriptor checksum; recomputes the payload root
/// hash when `with_payload` is set (excluding the READY marker, which is
/// written after hashing). On success with payload verification the state
/// is promoted to `verified` and persisted.
///
/// # Errors
/// `E_SNAPSHOT_NOT_FOUND`, `E_PARTIAL_SNAPSHOT`, `E_DESCRIPTOR_CORRUPT`,
/// `E_PAYLOAD_HASH_MISMATCH`, or I/O failures.
pub fn verify_snapshot(
    repo: &Repository,
    id: &SnapshotId,
    with_payload: bool,
) -> Result<IntegrityState> {
    let mut descriptor = repo.load_descriptor(id)?;

    if !repo.snapshot_dir(id).is_dir() {
        return Err(JvsError::PartialSnapshot {
            snapshot_id: id.as_str().to_owned(),
            detail: "payload directory is missing".to_owned(),
        });
    }
    if !repo.ready_path(id).is_file() {
        return Err(JvsError::PartialSnapshot {
            snapshot_id: id.as_str().to_owned(),
            detail: "READY marker is missing".to_owned(),
        });
    }

    if let Err(e) = descriptor.verify_checksum() {
        demote(repo, &mut descriptor);
        return Err(e);
    }

    if with_payload {
        let actual =
            integrity::payload_root_hash_excluding(&repo.snapshot_dir(id), &[READY_FILE])?;
        if actual != descriptor.payload_root_hash {
            let expected = descriptor.payload_root_hash.clone();
            demote(repo, &mut descriptor);
            return Err(JvsError::PayloadHashMismatch {
                snapshot_id: id.as_str().to_owned(),
                expected,
                actual,
            });
        }
        if descriptor.integrity_state != IntegrityState::Verified {
            descriptor.integrity_state = IntegrityState::Verified;
            repo.store_descriptor(&descriptor)?;
        }
    }

    Ok(descriptor.integrity_state)
}

/// Persist the `corrupt` verdict, best-effort.
fn demote(repo: &Repository, descriptor: &mut crate::model::descriptor::Descriptor) {
    descriptor.integrity_state = IntegrityState::Corrupt;
    if let Err(e) = repo.store_descriptor(descriptor) {
        tracing::warn!(
            snapshot = descriptor.snapshot_id.as_str(),
            error = %e,
            "failed to persist corrupt verdict"
        );
    }
}

/// Verify every snapshot with a descriptor on disk.
///
/// Never aborts on the first failure — each snapshot gets its own verdict.
///
/// # Errors
/// I/O failures while enumerating descriptors only.
pub fn verify_all(repo: &Repository, with_payload: bool) -> Result<Vec<VerifyOutcome>> {
    let mut out = Vec::new();
    for id in repo.snapshot_ids()? {
        let outcome = match verify_snapshot(repo, &id, with_payload) {
            Ok(state) => VerifyOutcome {
                snapshot_id: id.as_str().to_owned(),
                ok: true,
                state: Some(state),
                code: None,
                message: None,
            },
            Err(e) => VerifyOutcome {
                snapshot_id: id.as_str().to_owned(),
                ok: false,
                state: None,
                code: Some(e.code()),
                message: Some(e.to_string()),
            },
        };
        out.push(outcome);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
