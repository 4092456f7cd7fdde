//! Append-only, hash-chained audit log (`.jvs/audit/audit.jsonl`).
//!
//! One JSON object per line. Each record carries the previous record's hash,
//! making the log tamper-evident: editing or dropping any line breaks the
//! chain from that point on. Appends are serialized by an in-process mutex;
//! there is no cross-process lock — the single-writer CLI model tolerates
//! this, and doctor's chain check detects interleaving after the fact.
//!
//! Audit failures never abort the enclosing operation: [`record`] logs a
//! warning and returns.

use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JvsError, Result};
use crate::fsutil;
use crate::integrity;
use crate::repo::Repository;
use crate::timeutil;

/// `prev_hash` of the first record in a log.
pub const GENESIS: &str = "";

/// Event type of the marker record `audit_repair` emits in place of lost
/// records.
pub const GAP_EVENT: &str = "audit_gap";

static APPEND_GUARD: Mutex<()> = Mutex::new(());

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

/// One audit log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// `record_hash` of the previous line, or empty for the first record.
    pub prev_hash: String,
    /// SHA-256 over the canonical JSON of this record with `record_hash`
    /// removed.
    pub record_hash: String,
    /// RFC 3339 UTC.
    pub timestamp: String,
    /// What happened (e.g. `snapshot_create`).
    pub event_type: String,
    /// The worktree involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    /// The snapshot involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Event-specific details.
    pub payload: Value,
}

impl AuditRecord {
    /// Compute this record's hash over everything except `record_hash`.
    ///
    /// # Errors
    /// Serialization failure only.
    pub fn compute_hash(&self) -> Result<String> {
        integrity::checksum_excluding(self, &["record_hash"])
            .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))
    }
}

// ---------------------------------------------------------------------------
// Append
// ---------------------------------------------------------------------------

/// Append one event to the audit log, linking it to the current tail.
///
/// # Errors
/// Any I/O failure. Most callers want [`record`], which downgrades failures
/// to a warning.
pub fn append(
    repo: &Repository,
    event_type: &str,
    worktree: Option<&str>,
    snapshot_id: Option<&str>,
    payload: Value,
) -> Result<()> {
    let _guard = APPEND_GUARD.lock().map_err(|_| {
        JvsError::Io(std::io::Error::other("audit append mutex poisoned"))
    })?;

    let path = repo.audit_path();
    let prev_hash = last_record_hash(&path)?;

    let mut rec = AuditRecord {
        prev_hash,
        record_hash: String::new(),
        timestamp: timeutil::format_rfc3339_ms(timeutil::now_ms()),
        event_type: event_type.to_owned(),
        worktree: worktree.map(str::to_owned),
        snapshot_id: snapshot_id.map(str::to_owned),
        payload,
    };
    rec.record_hash = rec.compute_hash()?;

    let line = serde_json::to_string(&rec)
        .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
    fsutil::append_line(&path, &line)
}

/// Append one event, downgrading failure to a `tracing` warning.
///
/// The audit log is an observability surface; losing one record must never
/// abort a snapshot or restore that already did its durable work.
pub fn record(
    repo: &Repository,
    event_type: &str,
    worktree: Option<&str>,
    snapshot_id: Option<&str>,
    payload: Value,
) {
    if let Err(e) = append(repo, event_type, worktree, snapshot_id, payload) {
        tracing::warn!(event_type, error = %e, "audit append failed; continuing");
    }
}

/// The `record_hash` of the last line, or [`GENESIS`] for an empty log.
fn last_record_hash(path: &Path) -> Result<String> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(GENESIS.to_owned()),
        Err(e) => return Err(JvsError::Io(e)),
    };
    let Some(last) = raw.lines().rev().find(|l| !l.trim().is_empty()) else {
        return Ok(GENESIS.to_owned());
    };
    let rec: AuditRecord = serde_json::from_str(last).map_err(|e| JvsError::AuditChainBroken {
        line: raw.lines().count().saturating_sub(1),
        detail: format!("tail record is unparseable: {e}"),
    })?;
    Ok(rec.record_hash)
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

/// Walk the whole chain, checking both hash links and record hashes.
///
/// Returns the number of verified records (0 for a missing or empty log).
///
/// # Errors
/// `E_AUDIT_CHAIN_BROKEN` at the first bad line.
pub fn verify_chain(repo: &Repository) -> Result<usize> {
    let raw = match std::fs::read_to_string(repo.audit_path()) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(JvsError::Io(e)),
    };

    let mut prev = GENESIS.to_owned();
    let mut count = 0;
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord =
            serde_json::from_str(line).map_err(|e| JvsError::AuditChainBroken {
                line: line_no,
                detail: format!("unparseable record: {e}"),
            })?;
        if rec.prev_hash != prev {
            return Err(JvsError::AuditChainBroken {
                line: line_no,
                detail: format!(
                    "prev_hash does not link (expected {prev:?}, found {:?})",
                    rec.prev_hash
                ),
            });
        }
        let expected = rec.compute_hash()?;
        if expected != rec.record_hash {
            return Err(JvsError::AuditChainBroken {
                line: line_no,
                detail: "record_hash does not match record content".to_owned(),
            });
        }
        prev = rec.record_hash;
        count += 1;
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Repair
// ---------------------------------------------------------------------------

/// Rebuild the hash chain over the records present on disk.
///
/// Record content is preserved; `prev_hash`/`record_hash` are recomputed in
/// order. An unparseable line is replaced by a gap marker recording what was
/// lost. Returns the number of records written. Idempotent: repairing a
/// valid log rewrites it byte-identically.
///
/// # Errors
/// Any I/O failure.
pub fn repair_chain(repo: &Repository) -> Result<usize> {
    let path = repo.audit_path();
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(JvsError::Io(e)),
    };

    let mut prev = GENESIS.to_owned();
    let mut lines = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut rec: AuditRecord = match serde_json::from_str(line) {
            Ok(rec) => rec,
            Err(e) => AuditRecord {
                prev_hash: String::new(),
                record_hash: String::new(),
                timestamp: timeutil::format_rfc3339_ms(timeutil::now_ms()),
                event_type: GAP_EVENT.to_owned(),
                worktree: None,
                snapshot_id: None,
                payload: serde_json::json!({
                    "line": line_no,
                    "reason": format!("unparseable record replaced: {e}"),
                }),
            },
        };
        rec.prev_hash = prev;
        rec.record_hash = rec.compute_hash()?;
        prev = rec.record_hash.clone();
        let line = serde_json::to_string(&rec)
            .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
        lines.push(line);
    }

    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fsutil::atomic_write(&path, content.as_bytes())?;
    Ok(lines.len())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    #[test]
    fn empty_log_verifies_as_zero() {
        let (_dir, repo) = repo();
        assert_eq!(verify_chain(&repo).unwrap(), 0);
    }

    #[test]
    fn appended_records_chain() {
        let (_dir, repo) = repo();
        append(&repo, "init", None, None, serde_json::json!({})).unwrap();
        append(
            &repo,
            "snapshot_create",
            Some("main"),
            Some("1785542400000-09af31bc"),
            serde_json::json!({"note": "first"}),
        )
        .unwrap();
        append(&repo, "gc_run", None, None, serde_json::json!({"deleted": 0})).unwrap();

        assert_eq!(verify_chain(&repo).unwrap(), 3);
    }

    #[test]
    fn first_record_has_genesis_prev() {
        let (_dir, repo) = repo();
        append(&repo, "init", None, None, serde_json::json!({})).unwrap();
        let raw = std::fs::read_to_string(repo.audit_path()).unwrap();
        let rec: AuditRecord = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(rec.prev_hash, GENESIS);
    }

    #[test]
    fn edited_record_breaks_chain() {
        let (_dir, repo) = repo();
        append(&repo, "init", None, None, serde_json::json!({})).unwrap();
        append(&repo, "gc_run", None, None, serde_json::json!({})).unwrap();

        let raw = std::fs::read_to_string(repo.audit_path()).unwrap();
        let tampered = raw.replacen("gc_run", "gc_ran", 1);
        std::fs::write(repo.audit_path(), tampered).unwrap();

        let err = verify_chain(&repo).unwrap_err();
        assert_eq!(err.code(), "E_AUDIT_CHAIN_BROKEN");
    }

    #[test]
    fn dropped_record_breaks_chain() {
        let (_dir, repo) = repo();
        for i in 0..3 {
            append(&repo, "init", None, None, serde_json::json!({ "i": i })).unwrap();
        }
        let raw = std::fs::read_to_string(repo.audit_path()).unwrap();
        let without_middle: Vec<&str> = raw
            .lines()
            .enumerate()
            .filter_map(|(i, l)| (i != 1).then_some(l))
            .collect();
        std::fs::write(repo.audit_path(), format!("{}\n", without_middle.join("\n"))).unwrap();

        assert!(verify_chain(&repo).is_err());
    }

    #[test]
    fn repair_restores_verifiability() {
        let (_dir, repo) = repo();
        append(&repo, "init", None, None, serde_json::json!({})).unwrap();
        append(&repo, "gc_run", None, None, serde_json::json!({})).unwrap();

        // Corrupt the middle of the file: tamper one record and insert junk.
        let raw = std::fs::read_to_string(repo.audit_path()).unwrap();
        let mut lines: Vec<String> = raw.lines().map(str::to_owned).collect();
        lines[0] = lines[0].replacen("init", "innit", 1);
        lines.insert(1, "this is not json".to_owned());
        std::fs::write(repo.audit_path(), format!("{}\n", lines.join("\n"))).unwrap();
        assert!(verify_chain(&repo).is_err());

        let written = repair_chain(&repo).unwrap();
        assert_eq!(written, 3);
        assert_eq!(verify_chain(&repo).unwrap(), 3);

        // The junk line became a gap marker.
        let raw = std::fs::read_to_string(repo.audit_path()).unwrap();
        assert!(raw.contains(GAP_EVENT));
    }

    #[test]
    fn repair_is_idempotent() {
        let (_dir, repo) = repo();
        append(&repo, "init", None, None, serde_json::json!({})).unwrap();
        append(&repo, "gc_run", None, None, serde_json::json!({})).unwrap();

        repair_chain(&repo).unwrap();
        let first = std::fs::read_to_string(repo.audit_path()).unwrap();
        repair_chain(&repo).unwrap();
        let second = std::fs::read_to_string(repo.audit_path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn record_never_panics_on_failure() {
        let (_dir, repo) = repo();
        // Make the audit directory unusable by replacing it with a file.
        std::fs::remove_dir_all(repo.audit_path().parent().unwrap()).unwrap();
        std::fs::write(repo.audit_path().parent().unwrap(), "blocker").unwrap();
        // Must not panic or error out.
        record(&repo, "init", None, None, serde_json::json!({}));
    }
}
