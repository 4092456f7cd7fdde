//! Per-worktree lease lock with fencing tokens.
//!
//! One writer per worktree, enforced by a lock file created with
//! exclusive-create semantics (`O_CREAT|O_EXCL`): whoever creates
//! `lock.json` owns the lease until `expires_at`. An expired lease is never
//! silently reclaimed — takeover requires an explicit `steal`, which bumps
//! the fencing token so every operation the old holder still has in flight
//! fails its fencing check before touching durable state.
//!
//! The `.session` sidecar carries `{session_id, holder_nonce}` so one
//! operator's consecutive CLI invocations continue the same hold. The
//! `.fencing` counter persists the last issued token across lease gaps,
//! keeping the token monotone for the lifetime of the worktree.
//!
//! The substrate must provide `O_EXCL` semantics for this to be correct —
//! an explicit requirement on distributed filesystems.

use std::fs::OpenOptions;
use std::io::Write as _;

use serde::{Deserialize, Serialize};

use crate::config::LockConfig;
use crate::error::{JvsError, Result};
use crate::fsutil;
use crate::model::types::WorktreeName;
use crate::repo::Repository;
use crate::timeutil;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The durable lease record at `.jvs/worktrees/<name>/lock.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// The locked worktree.
    pub worktree_name: WorktreeName,
    /// Random value identifying the holder; required for renew/release.
    pub holder_nonce: String,
    /// Random value stable across renewals of one hold.
    pub session_id: String,
    /// RFC 3339 UTC.
    pub acquired_at: String,
    /// RFC 3339 UTC.
    pub expires_at: String,
    /// Monotone non-decreasing; bumped by every successful steal.
    pub fencing_token: i64,
    /// Free-text reason for the hold.
    pub purpose: String,
}

impl LockRecord {
    /// Whether the lease has expired at `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        timeutil::parse_rfc3339(&self.expires_at).is_ok_and(|exp| exp <= now_ms)
    }
}

/// The `.session` sidecar giving CLI continuity across invocations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFile {
    pub session_id: String,
    pub holder_nonce: String,
}

/// Lock state as reported by `status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockStatus {
    /// No lock record on disk.
    Free,
    /// A live lease.
    Held(LockRecord),
    /// A lease past its expiry, awaiting release or steal.
    Expired(LockRecord),
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Lease operations for one repository.
pub struct LockManager<'a> {
    repo: &'a Repository,
    lease_ms: u64,
    skew_bound_ms: u64,
}

impl<'a> LockManager<'a> {
    /// Build a manager from the repository's lock configuration.
    #[must_use]
    pub const fn new(repo: &'a Repository, cfg: &LockConfig) -> Self {
        Self {
            repo,
            lease_ms: cfg.lease_secs * 1000,
            skew_bound_ms: cfg.clock_skew_ms,
        }
    }

    // -----------------------------------------------------------------------
    // Acquire
    // -----------------------------------------------------------------------

    /// Acquire the lock for `name`.
    ///
    /// Success means this call exclusively created the lock file. A held
    /// lock — even one that has expired — is a conflict; takeover of an
    /// expired lease goes through [`Self::steal`] only.
    ///
    /// # Errors
    /// `E_LOCK_CONFLICT` (with a steal hint when the holder expired),
    /// `E_CLOCK_SKEW_EXCEEDED`, or I/O failures.
    pub fn acquire(&self, name: &WorktreeName, purpose: &str) -> Result<LockRecord> {
        self.require_worktree(name)?;
        let now = timeutil::now_ms();
        let record = self.fresh_record(name, purpose, now, self.next_token(name)?);

        let path = self.repo.lock_path(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let bytes = serde_json::to_vec_pretty(&record)
                    .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
                file.write_all(&bytes)?;
                file.sync_all()?;
                fsutil::sync_parent(&path);
                self.write_session(&record)?;
                self.store_token(name, record.fencing_token)?;
                Ok(record)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = self.read_record(name)?;
                self.check_skew(&existing, now)?;
                Err(JvsError::LockConflict {
                    worktree: name.as_str().to_owned(),
                    expired: existing.is_expired(now),
                    expires_at: existing.expires_at,
                })
            }
            Err(e) => Err(JvsError::Io(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Renew
    // -----------------------------------------------------------------------

    /// Extend the caller's lease.
    ///
    /// # Errors
    /// `E_LOCK_NOT_HELD` if no lock exists or the nonce does not match,
    /// `E_LOCK_EXPIRED` if the lease already lapsed.
    pub fn renew(&self, name: &WorktreeName, holder_nonce: &str) -> Result<LockRecord> {
        let now = timeutil::now_ms();
        let mut record = self.read_record(name)?;
        self.check_skew(&record, now)?;
        if record.holder_nonce != holder_nonce {
            return Err(JvsError::LockNotHeld {
                worktree: name.as_str().to_owned(),
            });
        }
        if record.is_expired(now) {
            return Err(JvsError::LockExpired {
                worktree: name.as_str().to_owned(),
            });
        }
        record.expires_at = timeutil::format_rfc3339_ms(now + self.lease_ms);
        self.write_record(&record)?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Steal
    // -----------------------------------------------------------------------

    /// Take over an expired lease, bumping the fencing token.
    ///
    /// # Errors
    /// `E_LOCK_NOT_HELD` if no lock exists (acquire instead),
    /// `E_LOCK_CONFLICT` if the current lease is still live.
    pub fn steal(&self, name: &WorktreeName, purpose: &str) -> Result<LockRecord> {
        let now = timeutil::now_ms();
        let existing = self.read_record(name)?;
        self.check_skew(&existing, now)?;
        if !existing.is_expired(now) {
            return Err(JvsError::LockConflict {
                worktree: name.as_str().to_owned(),
                expired: false,
                expires_at: existing.expires_at,
            });
        }

        let record = self.fresh_record(name, purpose, now, existing.fencing_token + 1);
        self.write_record(&record)?;
        self.write_session(&record)?;
        self.store_token(name, record.fencing_token)?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Drop the caller's lease. Releasing a missing lock is a no-op success.
    ///
    /// # Errors
    /// `E_LOCK_NOT_HELD` when the lock belongs to a different holder.
    pub fn release(&self, name: &WorktreeName, holder_nonce: &str) -> Result<()> {
        let record = match self.read_record(name) {
            Ok(record) => record,
            Err(JvsError::LockNotHeld { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if record.holder_nonce != holder_nonce {
            return Err(JvsError::LockNotHeld {
                worktree: name.as_str().to_owned(),
            });
        }
        std::fs::remove_file(self.repo.lock_path(name))?;
        let _ = std::fs::remove_file(self.repo.session_path(name));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Status & fencing
    // -----------------------------------------------------------------------

    /// Current lock state for `name`.
    ///
    /// # Errors
    /// I/O failures and unparseable records only.
    pub fn status(&self, name: &WorktreeName) -> Result<LockStatus> {
        match self.read_record(name) {
            Ok(record) => {
                if record.is_expired(timeutil::now_ms()) {
                    Ok(LockStatus::Expired(record))
                } else {
                    Ok(LockStatus::Held(record))
                }
            }
            Err(JvsError::LockNotHeld { .. }) => Ok(LockStatus::Free),
            Err(e) => Err(e),
        }
    }

    /// Check the caller's fencing token against the live record.
    ///
    /// Every operation that mutates durable state calls this immediately
    /// before its first destructive rename or unlink.
    ///
    /// # Errors
    /// `E_FENCING_MISMATCH` when the token is stale, `E_LOCK_NOT_HELD` when
    /// no lock exists, `E_LOCK_EXPIRED` when the lease lapsed mid-operation.
    pub fn validate_fencing(&self, name: &WorktreeName, token: i64) -> Result<()> {
        let now = timeutil::now_ms();
        let record = self.read_record(name)?;
        self.check_skew(&record, now)?;
        if record.fencing_token != token {
            return Err(JvsError::FencingMismatch {
                worktree: name.as_str().to_owned(),
                presented: token,
                current: record.fencing_token,
            });
        }
        if record.is_expired(now) {
            return Err(JvsError::LockExpired {
                worktree: name.as_str().to_owned(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session continuity
    // -----------------------------------------------------------------------

    /// The live lease belonging to this machine's session sidecar, if any.
    ///
    /// # Errors
    /// I/O failures and unparseable records only.
    pub fn current_lease(&self, name: &WorktreeName) -> Result<Option<LockRecord>> {
        let Some(session) = self.load_session(name) else {
            return Ok(None);
        };
        match self.read_record(name) {
            Ok(record)
                if record.holder_nonce == session.holder_nonce
                    && !record.is_expired(timeutil::now_ms()) =>
            {
                Ok(Some(record))
            }
            Ok(_) => Ok(None),
            Err(JvsError::LockNotHeld { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resume the session's lease (renewing it) or acquire a fresh one.
    ///
    /// Returns the live record plus whether this call acquired it (and so
    /// should release it when the operation finishes).
    ///
    /// # Errors
    /// As [`Self::acquire`] / [`Self::renew`].
    pub fn hold(&self, name: &WorktreeName, purpose: &str) -> Result<(LockRecord, bool)> {
        if let Some(lease) = self.current_lease(name)? {
            let renewed = self.renew(name, &lease.holder_nonce)?;
            return Ok((renewed, false));
        }
        Ok((self.acquire(name, purpose)?, true))
    }

    /// Read the session sidecar, if present and parseable.
    #[must_use]
    pub fn load_session(&self, name: &WorktreeName) -> Option<SessionFile> {
        let raw = std::fs::read(self.repo.session_path(name)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn require_worktree(&self, name: &WorktreeName) -> Result<()> {
        if self.repo.worktree_exists(name) {
            Ok(())
        } else {
            Err(JvsError::WorktreeNotFound {
                name: name.as_str().to_owned(),
            })
        }
    }

    fn fresh_record(
        &self,
        name: &WorktreeName,
        purpose: &str,
        now: u64,
        token: i64,
    ) -> LockRecord {
        LockRecord {
            worktree_name: name.clone(),
            holder_nonce: fsutil::rand_hex(16),
            session_id: fsutil::rand_hex(16),
            acquired_at: timeutil::format_rfc3339_ms(now),
            expires_at: timeutil::format_rfc3339_ms(now + self.lease_ms),
            fencing_token: token,
            purpose: purpose.to_owned(),
        }
    }

    /// A backward clock step makes the record's `acquired_at` sit in the
    /// caller's future; beyond the bound that is an error, not silent expiry.
    fn check_skew(&self, record: &LockRecord, now_ms: u64) -> Result<()> {
        if let Ok(acquired) = timeutil::parse_rfc3339(&record.acquired_at) {
            let skew = acquired.saturating_sub(now_ms);
            if skew > self.skew_bound_ms {
                return Err(JvsError::ClockSkewExceeded {
                    skew_ms: skew,
                    bound_ms: self.skew_bound_ms,
                });
            }
        }
        Ok(())
    }

    fn read_record(&self, name: &WorktreeName) -> Result<LockRecord> {
        let path = self.repo.lock_path(name);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JvsError::LockNotHeld {
                    worktree: name.as_str().to_owned(),
                });
            }
            Err(e) => return Err(JvsError::Io(e)),
        };
        serde_json::from_slice(&raw).map_err(|source| JvsError::Json { path, source })
    }

    fn write_record(&self, record: &LockRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
        fsutil::atomic_write(&self.repo.lock_path(&record.worktree_name), &bytes)
    }

    fn write_session(&self, record: &LockRecord) -> Result<()> {
        let session = SessionFile {
            session_id: record.session_id.clone(),
            holder_nonce: record.holder_nonce.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&session)
            .map_err(|e| JvsError::Io(std::io::Error::other(e.to_string())))?;
        fsutil::atomic_write(&self.repo.session_path(&record.worktree_name), &bytes)
    }

    /// The next token a fresh acquire should issue: the last issued token
    /// (so the sequence never decreases across lease gaps), or 1.
    fn next_token(&self, name: &WorktreeName) -> Result<i64> {
        let path = self.repo.fencing_path(name);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(raw.trim().parse().unwrap_or(1)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(1),
            Err(e) => Err(JvsError::Io(e)),
        }
    }

    fn store_token(&self, name: &WorktreeName, token: i64) -> Result<()> {
        fsutil::atomic_write(
            &self.repo.fencing_path(name),
            format!("{token}\n").as_bytes(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    fn manager(repo: &Repository) -> LockManager<'_> {
        LockManager::new(repo, &LockConfig::default())
    }

    /// A manager whose leases expire immediately.
    fn instant_expiry(repo: &Repository) -> LockManager<'_> {
        LockManager::new(
            repo,
            &LockConfig {
                lease_secs: 0,
                clock_skew_ms: 30_000,
            },
        )
    }

    #[test]
    fn acquire_then_status_held() {
        let (_dir, repo) = setup();
        let locks = manager(&repo);
        let main = WorktreeName::main();

        let record = locks.acquire(&main, "testing").unwrap();
        assert_eq!(record.fencing_token, 1);
        assert!(matches!(locks.status(&main).unwrap(), LockStatus::Held(_)));
    }

    #[test]
    fn acquire_on_held_lock_conflicts() {
        let (_dir, repo) = setup();
        let locks = manager(&repo);
        let main = WorktreeName::main();

        locks.acquire(&main, "first").unwrap();
        let err = locks.acquire(&main, "second").unwrap_err();
        match err {
            JvsError::LockConflict { expired, .. } => assert!(!expired),
            other => panic!("expected LockConflict, got {other:?}"),
        }
    }

    #[test]
    fn acquire_on_expired_lock_hints_steal() {
        let (_dir, repo) = setup();
        let main = WorktreeName::main();
        instant_expiry(&repo).acquire(&main, "short").unwrap();

        let err = manager(&repo).acquire(&main, "next").unwrap_err();
        match err {
            JvsError::LockConflict { expired, .. } => assert!(expired),
            other => panic!("expected LockConflict, got {other:?}"),
        }
    }

    #[test]
    fn steal_requires_expired_lease() {
        let (_dir, repo) = setup();
        let locks = manager(&repo);
        let main = WorktreeName::main();

        locks.acquire(&main, "live").unwrap();
        let err = locks.steal(&main, "impatient").unwrap_err();
        assert_eq!(err.code(), "E_LOCK_CONFLICT");
    }

    #[test]
    fn steal_increments_fencing_token() {
        let (_dir, repo) = setup();
        let main = WorktreeName::main();
        let old = instant_expiry(&repo).acquire(&main, "victim").unwrap();

        let locks = manager(&repo);
        let new = locks.steal(&main, "takeover").unwrap();
        assert_eq!(new.fencing_token, old.fencing_token + 1);
        assert_ne!(new.holder_nonce, old.holder_nonce);
        assert_ne!(new.session_id, old.session_id);

        // The old token is now fenced off.
        let err = locks.validate_fencing(&main, old.fencing_token).unwrap_err();
        assert_eq!(err.code(), "E_FENCING_MISMATCH");
        locks.validate_fencing(&main, new.fencing_token).unwrap();
    }

    #[test]
    fn token_is_monotone_across_release_and_reacquire() {
        let (_dir, repo) = setup();
        let main = WorktreeName::main();

        let first = instant_expiry(&repo).acquire(&main, "one").unwrap();
        let stolen = manager(&repo).steal(&main, "two").unwrap();
        assert_eq!(stolen.fencing_token, first.fencing_token + 1);

        manager(&repo).release(&main, &stolen.holder_nonce).unwrap();
        let again = manager(&repo).acquire(&main, "three").unwrap();
        assert!(
            again.fencing_token >= stolen.fencing_token,
            "token decreased: {} < {}",
            again.fencing_token,
            stolen.fencing_token
        );
    }

    #[test]
    fn renew_extends_only_for_holder() {
        let (_dir, repo) = setup();
        let locks = manager(&repo);
        let main = WorktreeName::main();

        let record = locks.acquire(&main, "holder").unwrap();
        let renewed = locks.renew(&main, &record.holder_nonce).unwrap();
        assert!(renewed.expires_at >= record.expires_at);
        assert_eq!(renewed.fencing_token, record.fencing_token);

        let err = locks.renew(&main, "wrong-nonce").unwrap_err();
        assert_eq!(err.code(), "E_LOCK_NOT_HELD");
    }

    #[test]
    fn renew_expired_lease_fails() {
        let (_dir, repo) = setup();
        let main = WorktreeName::main();
        let record = instant_expiry(&repo).acquire(&main, "gone").unwrap();

        let err = manager(&repo)
            .renew(&main, &record.holder_nonce)
            .unwrap_err();
        assert_eq!(err.code(), "E_LOCK_EXPIRED");
    }

    #[test]
    fn release_is_idempotent_and_nonce_checked() {
        let (_dir, repo) = setup();
        let locks = manager(&repo);
        let main = WorktreeName::main();

        // Missing lock: no-op success.
        locks.release(&main, "whatever").unwrap();

        let record = locks.acquire(&main, "holder").unwrap();
        let err = locks.release(&main, "intruder").unwrap_err();
        assert_eq!(err.code(), "E_LOCK_NOT_HELD");

        locks.release(&main, &record.holder_nonce).unwrap();
        assert_eq!(locks.status(&main).unwrap(), LockStatus::Free);
        // Session sidecar went with it.
        assert!(locks.load_session(&main).is_none());
    }

    #[test]
    fn validate_fencing_without_lock_fails() {
        let (_dir, repo) = setup();
        let err = manager(&repo)
            .validate_fencing(&WorktreeName::main(), 1)
            .unwrap_err();
        assert_eq!(err.code(), "E_LOCK_NOT_HELD");
    }

    #[test]
    fn clock_skew_is_detected() {
        let (_dir, repo) = setup();
        let locks = manager(&repo);
        let main = WorktreeName::main();

        let mut record = locks.acquire(&main, "skewed").unwrap();
        // Forge a record acquired one hour in the future.
        record.acquired_at = timeutil::format_rfc3339_ms(timeutil::now_ms() + 3_600_000);
        let bytes = serde_json::to_vec_pretty(&record).unwrap();
        std::fs::write(repo.lock_path(&main), bytes).unwrap();

        let err = locks.validate_fencing(&main, record.fencing_token).unwrap_err();
        assert_eq!(err.code(), "E_CLOCK_SKEW_EXCEEDED");
    }

    #[test]
    fn session_continuity_resumes_hold() {
        let (_dir, repo) = setup();
        let locks = manager(&repo);
        let main = WorktreeName::main();

        let (first, acquired) = locks.hold(&main, "op one").unwrap();
        assert!(acquired);
        // Second hold resumes via the sidecar instead of conflicting.
        let (second, acquired) = locks.hold(&main, "op two").unwrap();
        assert!(!acquired);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.fencing_token, first.fencing_token);
    }

    #[test]
    fn lock_on_missing_worktree_fails() {
        let (_dir, repo) = setup();
        let err = manager(&repo)
            .acquire(&WorktreeName::new("ghost").unwrap(), "nope")
            .unwrap_err();
        assert_eq!(err.code(), "E_WORKTREE_NOT_FOUND");
    }
}
