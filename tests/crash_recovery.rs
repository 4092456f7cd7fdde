//! Crash recovery: every partial state a crashed pipeline can leave behind
//! is recognized by doctor and reaped idempotently, without ever touching a
//! published snapshot.

mod common;

use common::{dir_entries, init_repo, main_wt, snapshot, write_payload};
use jvs::doctor::{self, RepairAction};
use jvs::model::types::{SnapshotId, WorktreeName};

#[test]
fn crash_before_publication_leaves_reapable_staging() {
    let (_dir, repo, config) = init_repo();
    let main = main_wt();
    write_payload(&repo, &main, "data.txt", "v1");
    let published = snapshot(&repo, &config, &main, "ok");

    // Simulate a crash mid-stage: staging dir + intent, no descriptor.
    let dead = SnapshotId::generate(jvs::timeutil::now_ms());
    std::fs::create_dir_all(repo.staging_dir(&dead)).unwrap();
    std::fs::write(repo.staging_dir(&dead).join("partial.txt"), "partial").unwrap();
    jvs::snapshot::write_intent(&repo, "snapshot_create", &dead, &main).unwrap();

    let report = doctor::check(&repo, &config, false).unwrap();
    assert!(report.findings.iter().any(|f| f.check == "tmp_artifact"));
    assert!(report.findings.iter().any(|f| f.check == "orphan_intent"));

    doctor::repair(&repo, &config, RepairAction::CleanTmp).unwrap();
    doctor::repair(&repo, &config, RepairAction::CleanIntents).unwrap();

    assert!(!repo.staging_dir(&dead).exists());
    assert!(dir_entries(&repo.intents_dir()).is_empty());
    assert!(repo.is_published(&published.snapshot_id));
}

#[test]
fn crash_between_rename_and_ready_is_reaped() {
    let (_dir, repo, config) = init_repo();
    let main = main_wt();
    write_payload(&repo, &main, "data.txt", "v1");
    let s = snapshot(&repo, &config, &main, "s");

    // Strip the READY marker: equivalent to crashing between the payload
    // rename and the marker write.
    std::fs::remove_file(repo.ready_path(&s.snapshot_id)).unwrap();

    let report = doctor::check(&repo, &config, false).unwrap();
    assert!(!report.is_healthy());

    doctor::repair(&repo, &config, RepairAction::CleanTmp).unwrap();
    assert!(!repo.snapshot_dir(&s.snapshot_id).exists());
    assert!(!repo.descriptor_path(&s.snapshot_id).exists());

    // The worktree head now dangles; advance_head recovers it.
    doctor::repair(&repo, &config, RepairAction::AdvanceHead).unwrap();
    let wt = repo.load_worktree(&main).unwrap();
    assert_eq!(wt.head_snapshot_id, None, "no snapshots remain");

    // The repository is healthy again end to end.
    let report = doctor::check(&repo, &config, true).unwrap();
    assert!(report.is_healthy(), "{:?}", report.findings);
}

#[test]
fn crashed_gc_leaves_orphan_payload_that_doctor_reaps() {
    let (_dir, repo, config) = init_repo();
    let main = main_wt();
    write_payload(&repo, &main, "data.txt", "v1");
    let keep = snapshot(&repo, &config, &main, "keep");

    // Orphan payload: a snapshot directory with READY but no descriptor,
    // exactly what a GC crash between descriptor and payload deletion
    // leaves behind.
    write_payload(&repo, &main, "data.txt", "v2");
    let orphan = snapshot(&repo, &config, &main, "orphan");
    std::fs::remove_file(repo.descriptor_path(&orphan.snapshot_id)).unwrap();

    let report = doctor::check(&repo, &config, false).unwrap();
    assert!(report.findings.iter().any(|f| f.check == "orphan_payload"));

    doctor::repair(&repo, &config, RepairAction::CleanTmp).unwrap();
    assert!(!repo.snapshot_dir(&orphan.snapshot_id).exists());
    assert!(repo.is_published(&keep.snapshot_id));

    // Head now dangles on the orphan; runtime repairs settle everything.
    for action in doctor::RUNTIME_REPAIRS {
        doctor::repair(&repo, &config, *action).unwrap();
    }
    let wt = repo.load_worktree(&main).unwrap();
    assert_eq!(wt.head_snapshot_id, Some(keep.snapshot_id));
}

#[test]
fn parked_restore_payload_is_reaped() {
    let (_dir, repo, config) = init_repo();
    let main = main_wt();
    write_payload(&repo, &main, "data.txt", "v1");
    snapshot(&repo, &config, &main, "s");

    // A crash mid-restore leaves the parked original next to the payload.
    let parked = repo.root().join("main.old-deadbeef");
    std::fs::create_dir_all(&parked).unwrap();
    std::fs::write(parked.join("data.txt"), "old world").unwrap();

    let report = doctor::check(&repo, &config, false).unwrap();
    assert!(report.findings.iter().any(|f| f.check == "tmp_artifact"));

    doctor::repair(&repo, &config, RepairAction::CleanTmp).unwrap();
    assert!(!parked.exists());
    // The live payload is untouched.
    assert_eq!(common::read_payload(&repo, &main, "data.txt"), "v1");
}

#[test]
fn repairs_are_idempotent() {
    let (_dir, repo, config) = init_repo();
    let main = main_wt();
    write_payload(&repo, &main, "data.txt", "v1");
    snapshot(&repo, &config, &main, "s");
    std::fs::create_dir_all(repo.staging_dir(&SnapshotId::generate(7))).unwrap();

    for action in doctor::RUNTIME_REPAIRS {
        doctor::repair(&repo, &config, *action).unwrap();
    }
    // Second pass changes nothing.
    for action in doctor::RUNTIME_REPAIRS {
        let outcome = doctor::repair(&repo, &config, *action).unwrap();
        assert!(outcome.changes.is_empty(), "{outcome:?}");
    }
}

#[test]
fn fork_staging_crash_is_reaped() {
    let (_dir, repo, config) = init_repo();
    let main = main_wt();
    write_payload(&repo, &main, "data.txt", "v1");
    snapshot(&repo, &config, &main, "s");

    // A crashed fork leaves a staged payload under worktrees/ but no config.
    let staged = repo.root().join("worktrees").join("feat.tmp-0badf00d");
    std::fs::create_dir_all(&staged).unwrap();

    doctor::repair(&repo, &config, RepairAction::CleanTmp).unwrap();
    assert!(!staged.exists());
    // No worktree was half-created.
    assert!(!repo.worktree_exists(&WorktreeName::new("feat").unwrap()));
}
