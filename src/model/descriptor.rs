//! Snapshot descriptors and the READY publication marker.
//!
//! A descriptor is the per-snapshot metadata document at
//! `.jvs/descriptors/<id>.json`. After publication every field except
//! `integrity_state` is immutable; the checksum covers exactly that immutable
//! region, so the mutable verification verdict can change without breaking
//! identity.

use serde::{Deserialize, Serialize};

use crate::engine::EngineKind;
use crate::error::{JvsError, Result};
use crate::integrity;
use crate::model::types::{SnapshotId, WorktreeName};

/// Fields excluded from the descriptor checksum preimage: the checksum
/// itself, and the one mutable field.
const CHECKSUM_EXCLUDED: &[&str] = &["descriptor_checksum", "integrity_state"];

// ---------------------------------------------------------------------------
// IntegrityState
// ---------------------------------------------------------------------------

/// Verification verdict for a published snapshot. The only mutable
/// descriptor field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityState {
    /// Payload hash re-verified against disk.
    Verified,
    /// Published but not re-checked since.
    #[default]
    Unverified,
    /// A mutation was detected; the snapshot must not be trusted.
    Corrupt,
}

impl std::fmt::Display for IntegrityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verified => f.write_str("verified"),
            Self::Unverified => f.write_str("unverified"),
            Self::Corrupt => f.write_str("corrupt"),
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Snapshot metadata, serialized as canonical JSON on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// The snapshot this descriptor describes.
    pub snapshot_id: SnapshotId,
    /// The worktree that created it.
    pub worktree_name: WorktreeName,
    /// Previous snapshot in this worktree's lineage, or `None` for a root.
    pub parent_id: Option<SnapshotId>,
    /// Creation instant, RFC 3339 UTC. Always matches the id's millisecond
    /// prefix.
    pub created_at: String,
    /// Optional free-text note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Optional tags (exact-match search keys, also GC retention hooks).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// The clone engine that staged the payload.
    pub engine: EngineKind,
    /// Merkle-style hash over the published payload tree.
    pub payload_root_hash: String,
    /// SHA-256 over the canonical JSON of all fields except this one and
    /// `integrity_state`.
    pub descriptor_checksum: String,
    /// Mutable verification verdict; excluded from the checksum.
    pub integrity_state: IntegrityState,
}

impl Descriptor {
    /// Compute the checksum over the immutable region of this descriptor.
    ///
    /// # Errors
    /// Returns `E_DESCRIPTOR_CORRUPT` if serialization fails (malformed
    /// in-memory state).
    pub fn compute_checksum(&self) -> Result<String> {
        integrity::checksum_excluding(self, CHECKSUM_EXCLUDED).map_err(|e| {
            JvsError::DescriptorCorrupt {
                snapshot_id: self.snapshot_id.as_str().to_owned(),
                detail: format!("checksum serialization failed: {e}"),
            }
        })
    }

    /// Fill in `descriptor_checksum` from the current field values.
    ///
    /// # Errors
    /// See [`Self::compute_checksum`].
    pub fn seal(&mut self) -> Result<()> {
        self.descriptor_checksum = self.compute_checksum()?;
        Ok(())
    }

    /// Re-derive the checksum and compare against the stored value.
    ///
    /// # Errors
    /// `E_DESCRIPTOR_CORRUPT` on mismatch.
    pub fn verify_checksum(&self) -> Result<()> {
        let expected = self.compute_checksum()?;
        if expected == self.descriptor_checksum {
            Ok(())
        } else {
            Err(JvsError::DescriptorCorrupt {
                snapshot_id: self.snapshot_id.as_str().to_owned(),
                detail: format!(
                    "checksum mismatch (stored {}, recomputed {})",
                    self.descriptor_checksum, expected
                ),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// ReadyMarker
// ---------------------------------------------------------------------------

/// Publication marker written inside the snapshot directory as the final
/// publish step. A payload directory without one is incomplete and gets
/// reaped by doctor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMarker {
    pub snapshot_id: SnapshotId,
    pub created_at: String,
    pub engine: EngineKind,
    pub payload_root_hash: String,
}

/// File name of the publication marker inside a snapshot directory.
pub const READY_FILE: &str = ".READY";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
