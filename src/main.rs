//! `jvs` — snapshot-first workspace versioning CLI.
//!
//! Discovers the enclosing repository from the working directory, resolves
//! the caller's worktree by path, and drives the engine pipelines. Exit code
//! 0 on success, non-zero on failure; errors print a stable machine code
//! plus guidance, or a JSON object when the command asked for `--json`.

use anyhow::Result;
use clap::{Parser, Subcommand};

use jvs::config::JvsConfig;
use jvs::diff::diff_snapshots;
use jvs::doctor::{self, RepairAction};
use jvs::engine::EngineKind;
use jvs::error::JvsError;
use jvs::format::{OutputFormat, paint, status_prefix};
use jvs::gc;
use jvs::lock::{LockManager, LockStatus};
use jvs::model::types::WorktreeName;
use jvs::refs;
use jvs::repo::Repository;
use jvs::snapshot::create::{CreateOptions, create};
use jvs::snapshot::find::{self, SnapshotQuery, resolve_reference};
use jvs::snapshot::verify::{verify_all, verify_snapshot};
use jvs::timeutil;
use jvs::worktree;

/// Snapshot-first workspace versioning
///
/// jvs tracks one or more worktrees (plain directory trees) inside a
/// repository and versions them with whole-tree snapshots. Snapshots are
/// immutable, content-hashed, and crash-atomic; restore rewinds a worktree
/// in place, fork spins a new worktree out of any snapshot, and gc collects
/// what nothing references.
#[derive(Parser)]
#[command(name = "jvs")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'jvs <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a repository at ./<name> with a main worktree
    Init {
        /// Directory name for the new repository
        name: String,
    },

    /// Create a snapshot of the caller's worktree
    Snapshot {
        /// Free-text note stored in the descriptor
        note: Option<String>,
        /// Tag the snapshot (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Accepted for compatibility; payload compression is handled by the
        /// filesystem, only the range is validated
        #[arg(long)]
        compress: Option<u8>,
        /// Force a clone engine (copy, reflink-copy, juicefs-clone)
        #[arg(long)]
        engine: Option<EngineKind>,
    },

    /// List snapshots, newest first
    History {
        /// Only snapshots carrying this exact tag
        #[arg(long)]
        tag: Option<String>,
        /// Keep at most this many results
        #[arg(long)]
        limit: Option<usize>,
        /// Only snapshots whose note contains this substring
        #[arg(long)]
        search: Option<String>,
        /// Only snapshots at or after this RFC 3339 instant
        #[arg(long)]
        since: Option<String>,
        /// Only snapshots at or before this RFC 3339 instant
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Restore the caller's worktree to a snapshot, in place
    Restore {
        /// Snapshot id, tag, ref, or HEAD
        reference: String,
        /// Confirm overwriting the worktree payload
        #[arg(long)]
        force: bool,
        /// Why this restore is happening (recorded in the audit log)
        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Manage worktrees
    #[command(subcommand)]
    Worktree(WorktreeCommands),

    /// Verify snapshot integrity
    Verify {
        /// Snapshot id (or tag/ref) to verify; omit with --all
        reference: Option<String>,
        /// Verify every snapshot, payload hashes included
        #[arg(long)]
        all: bool,
        /// Also check Ed25519 signatures (requires a configured signing key)
        #[arg(long)]
        signed: bool,
        #[arg(long)]
        json: bool,
    },

    /// Two-phase garbage collection
    #[command(subcommand)]
    Gc(GcCommands),

    /// Check repository health and run repairs
    Doctor {
        /// Also re-verify every snapshot's payload hash
        #[arg(long)]
        strict: bool,
        /// Reap runtime state: tmp artifacts, intents, expired locks, heads
        #[arg(long)]
        repair_runtime: bool,
        /// Run one specific repair action
        #[arg(long, value_enum)]
        repair: Option<RepairAction>,
    },

    /// Manage the caller's worktree lease
    #[command(subcommand)]
    Lock(LockCommands),

    /// Named snapshot pointers
    #[command(subcommand)]
    Ref(RefCommands),

    /// GC protection pins
    #[command(subcommand)]
    Pin(PinCommands),

    /// Repository metadata
    Info {
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,

    /// File-level diff between two snapshots
    Diff {
        /// Base snapshot (id, tag, ref, or HEAD)
        a: String,
        /// Target snapshot (id, tag, ref, or HEAD)
        b: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum WorktreeCommands {
    /// Fork a new worktree from a snapshot (default: current HEAD)
    Fork {
        /// `[source] <name>` — source defaults to HEAD
        #[arg(required = true, num_args = 1..=2)]
        args: Vec<String>,
    },
    /// List worktrees
    List {
        #[arg(long)]
        json: bool,
    },
    /// Rename a worktree
    Rename { old: String, new: String },
    /// Remove a worktree (its snapshots become GC candidates)
    Remove { name: String },
    /// Print a worktree's payload path
    Path { name: Option<String> },
}

#[derive(Subcommand)]
enum GcCommands {
    /// Compute and persist a deletion plan
    Plan {
        #[arg(long)]
        json: bool,
    },
    /// Execute a previously created plan
    Run {
        #[arg(long)]
        plan_id: String,
    },
}

#[derive(Subcommand)]
enum LockCommands {
    /// Acquire the lease on the caller's worktree
    Acquire {
        /// Why the lease is held
        #[arg(long, default_value = "interactive session")]
        purpose: String,
    },
    /// Release the caller's lease
    Release,
    /// Extend the caller's lease
    Renew,
    /// Show the lock state
    Status,
    /// Take over an expired lease (bumps the fencing token)
    Steal {
        #[arg(long, default_value = "steal")]
        purpose: String,
    },
}

#[derive(Subcommand)]
enum RefCommands {
    /// Point a named ref at a snapshot
    Create { name: String, reference: String },
    /// List refs
    List,
    /// Delete a ref
    Delete { name: String },
}

#[derive(Subcommand)]
enum PinCommands {
    /// Pin a snapshot against GC
    Add {
        reference: String,
        #[arg(long)]
        reason: Option<String>,
        /// Let the pin expire after this many seconds
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Remove a pin
    Remove { reference: String },
    /// List pins
    List,
}

fn main() {
    jvs::telemetry::init();
    let cli = Cli::parse();
    let json = wants_json(&cli.command);

    if let Err(err) = run(cli.command) {
        render_error(&err, json);
        std::process::exit(1);
    }
}

const fn wants_json(command: &Commands) -> bool {
    match command {
        Commands::History { json, .. }
        | Commands::Verify { json, .. }
        | Commands::Info { json }
        | Commands::Diff { json, .. }
        | Commands::Gc(GcCommands::Plan { json })
        | Commands::Worktree(WorktreeCommands::List { json }) => *json,
        _ => false,
    }
}

fn render_error(err: &anyhow::Error, json: bool) {
    if let Some(jvs_err) = err.downcast_ref::<JvsError>() {
        if json {
            let obj = serde_json::json!({
                "code": jvs_err.code(),
                "message": jvs_err.to_string(),
                "path": jvs_err.path().map(|p| p.display().to_string()),
                "severity": jvs_err.severity(),
            });
            eprintln!("{obj}");
        } else {
            eprintln!("error[{}]: {jvs_err}", jvs_err.code());
        }
    } else if json {
        let obj = serde_json::json!({
            "code": "E_UNKNOWN",
            "message": err.to_string(),
            "severity": "error",
        });
        eprintln!("{obj}");
    } else {
        eprintln!("error: {err:#}");
    }
}

/// Open the repository enclosing the working directory, plus its config and
/// the worktree the caller is standing in.
fn open_context() -> Result<(Repository, JvsConfig, WorktreeName)> {
    let cwd = std::env::current_dir()?;
    let repo = Repository::discover(&cwd)?;
    let config = JvsConfig::load(&repo.control_dir())?;
    let worktree = repo.resolve_worktree_from_path(&cwd);
    Ok((repo, config, worktree))
}

#[allow(clippy::too_many_lines)]
fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Init { name } => {
            let root = std::env::current_dir()?.join(&name);
            let repo = Repository::init(&root)?;
            jvs::audit::record(&repo, "init", Some("main"), None, serde_json::json!({}));
            println!("Initialized JVS repository at {}", root.display());
            println!("Main worktree payload: {}", repo.payload_root(&WorktreeName::main()).display());
            Ok(())
        }

        Commands::Snapshot {
            note,
            tags,
            compress,
            engine,
        } => {
            if let Some(level) = compress {
                anyhow::ensure!(level <= 9, "--compress must be between 0 and 9, got {level}");
            }
            let (repo, config, wt) = open_context()?;
            let created = create(
                &repo,
                &config,
                &wt,
                &CreateOptions { note, tags, engine },
            )?;
            let d = &created.descriptor;
            println!(
                "Created snapshot {} ({}) in worktree '{}'",
                d.snapshot_id.short(),
                d.snapshot_id,
                wt
            );
            if created.clone_outcome.degraded {
                for reason in &created.clone_outcome.degradations {
                    eprintln!("warning: degraded clone: {reason}");
                }
            }
            Ok(())
        }

        Commands::History {
            tag,
            limit,
            search,
            since,
            until,
            json,
        } => {
            let (repo, _config, _wt) = open_context()?;
            let query = SnapshotQuery {
                tag,
                limit,
                note_contains: search,
                since_ms: parse_instant(since.as_deref())?,
                until_ms: parse_instant(until.as_deref())?,
                ..SnapshotQuery::default()
            };
            let descriptors = find::find(&repo, &query)?;
            let format = OutputFormat::resolve(json);
            if json {
                println!("{}", format.serialize(&descriptors)?);
            } else if descriptors.is_empty() {
                println!("No snapshots.");
            } else {
                for d in &descriptors {
                    let tags = if d.tags.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", d.tags.join(", "))
                    };
                    println!(
                        "{}  {}  {}  {}{}",
                        paint(format, "33", d.snapshot_id.short()),
                        d.created_at,
                        d.worktree_name,
                        d.note.as_deref().unwrap_or("-"),
                        tags,
                    );
                }
            }
            Ok(())
        }

        Commands::Restore {
            reference,
            force,
            reason,
        } => {
            let (repo, config, wt) = open_context()?;
            let restored =
                worktree::restore::inplace_restore(&repo, &config, &wt, &reference, force, &reason)?;
            println!(
                "Restored worktree '{}' to snapshot {}",
                wt,
                restored.snapshot_id.short()
            );
            if restored.detached {
                println!(
                    "Worktree is now detached (head behind latest); run `jvs restore HEAD --force --reason ...` to reattach."
                );
            }
            Ok(())
        }

        Commands::Worktree(cmd) => run_worktree(cmd),

        Commands::Verify {
            reference,
            all,
            signed,
            json,
        } => {
            let (repo, _config, wt) = open_context()?;
            if signed {
                // Signing primitives are external; without a configured key
                // there is nothing to check against.
                return Err(JvsError::SigningKeyMissing.into());
            }
            let format = OutputFormat::resolve(json);
            if all {
                let outcomes = verify_all(&repo, true)?;
                let failed = outcomes.iter().filter(|o| !o.ok).count();
                if json {
                    println!("{}", format.serialize(&outcomes)?);
                } else {
                    for o in &outcomes {
                        match (&o.state, &o.message) {
                            (Some(state), _) => println!("[OK]   {}  {state}", o.snapshot_id),
                            (None, Some(message)) => {
                                println!("[FAIL] {}  {message}", o.snapshot_id);
                            }
                            (None, None) => println!("[FAIL] {}", o.snapshot_id),
                        }
                    }
                }
                anyhow::ensure!(failed == 0, "{failed} snapshot(s) failed verification");
            } else {
                let reference = reference
                    .ok_or_else(|| anyhow::anyhow!("pass a snapshot reference or --all"))?;
                let id = resolve_reference(&repo, &wt, &reference)?;
                let state = verify_snapshot(&repo, &id, true)?;
                if json {
                    println!(
                        "{}",
                        format.serialize(&serde_json::json!({
                            "snapshot_id": id.as_str(),
                            "ok": true,
                            "state": state,
                        }))?
                    );
                } else {
                    println!("[OK] {}  {state}", id);
                }
            }
            Ok(())
        }

        Commands::Gc(GcCommands::Plan { json }) => {
            let (repo, config, _wt) = open_context()?;
            let plan = gc::plan(&repo, &config)?;
            let format = OutputFormat::resolve(json);
            if json {
                println!("{}", format.serialize(&plan)?);
            } else {
                println!(
                    "Plan {}: {} candidate(s), {} protected snapshot(s).",
                    plan.plan_id,
                    plan.candidates.len(),
                    plan.protected_count(),
                );
                for id in &plan.candidates {
                    println!("  would delete {id}");
                }
                if !plan.candidates.is_empty() {
                    println!("To apply: jvs gc run --plan-id {}", plan.plan_id);
                }
            }
            Ok(())
        }

        Commands::Gc(GcCommands::Run { plan_id }) => {
            let (repo, config, wt) = open_context()?;
            let report = gc::run(&repo, &config, &wt, &plan_id)?;
            println!(
                "GC complete: deleted {} snapshot(s), skipped {}.",
                report.deleted.len(),
                report.skipped.len()
            );
            Ok(())
        }

        Commands::Doctor {
            strict,
            repair_runtime,
            repair,
        } => run_doctor(strict, repair_runtime, repair),

        Commands::Lock(cmd) => run_lock(cmd),
        Commands::Ref(cmd) => run_ref(cmd),
        Commands::Pin(cmd) => run_pin(cmd),

        Commands::Info { json } => {
            let (repo, _config, wt) = open_context()?;
            let worktrees = repo.list_worktrees()?;
            let snapshots = repo.snapshot_ids()?;
            if json {
                let format = OutputFormat::resolve(true);
                println!(
                    "{}",
                    format.serialize(&serde_json::json!({
                        "repo_id": repo.repo_id()?,
                        "format_version": repo.format_version()?,
                        "root": repo.root().display().to_string(),
                        "current_worktree": wt.as_str(),
                        "worktree_count": worktrees.len(),
                        "snapshot_count": snapshots.len(),
                    }))?
                );
            } else {
                println!("Repository:      {}", repo.root().display());
                println!("Repo id:         {}", repo.repo_id()?);
                println!("Format version:  {}", repo.format_version()?);
                println!("Current worktree: {wt}");
                println!("Worktrees:       {}", worktrees.len());
                println!("Snapshots:       {}", snapshots.len());
            }
            Ok(())
        }

        Commands::Config => {
            let (repo, config, _wt) = open_context()?;
            println!("# effective configuration ({})", repo.control_dir().join("config.toml").display());
            println!("[engine]");
            println!("default = \"{}\"", config.engine.default);
            println!();
            println!("[lock]");
            println!("lease_secs = {}", config.lock.lease_secs);
            println!("clock_skew_ms = {}", config.lock.clock_skew_ms);
            println!();
            println!("[gc]");
            println!("retain_tags = {:?}", config.gc.retain_tags);
            Ok(())
        }

        Commands::Diff { a, b, json } => {
            let (repo, _config, wt) = open_context()?;
            let id_a = resolve_reference(&repo, &wt, &a)?;
            let id_b = resolve_reference(&repo, &wt, &b)?;
            let report = diff_snapshots(&repo, &id_a, &id_b)?;
            if json {
                println!("{}", OutputFormat::resolve(true).serialize(&report)?);
            } else if report.is_empty() {
                println!("No differences.");
            } else {
                for path in &report.added {
                    println!("A {path}");
                }
                for path in &report.removed {
                    println!("D {path}");
                }
                for path in &report.changed {
                    println!("M {path}");
                }
            }
            Ok(())
        }
    }
}

fn run_worktree(cmd: WorktreeCommands) -> Result<()> {
    match cmd {
        WorktreeCommands::Fork { args } => {
            let (repo, config, current) = open_context()?;
            let (source, name) = match args.as_slice() {
                [name] => (find::HEAD_REF.to_owned(), name.clone()),
                [source, name] => (source.clone(), name.clone()),
                _ => unreachable!("clap enforces 1..=2 args"),
            };
            let name = WorktreeName::new(&name).map_err(JvsError::from)?;
            let cfg = worktree::fork::fork(&repo, &config, &source, &current, &name)?;
            println!(
                "Forked worktree '{}' from snapshot {}",
                name,
                cfg.base_snapshot_id
                    .as_ref()
                    .map_or("-", |id| id.short())
            );
            println!("Payload: {}", repo.payload_root(&name).display());
            Ok(())
        }
        WorktreeCommands::List { json } => {
            let (repo, config, _current) = open_context()?;
            let worktrees = worktree::list(&repo)?;
            if json {
                println!("{}", OutputFormat::resolve(true).serialize(&worktrees)?);
            } else {
                let locks = LockManager::new(&repo, &config.lock);
                for wt in &worktrees {
                    let state = if wt.is_detached() { "detached" } else { "ok" };
                    let lock = match locks.status(&wt.name)? {
                        LockStatus::Free => "",
                        LockStatus::Held(_) => "  (locked)",
                        LockStatus::Expired(_) => "  (expired lock)",
                    };
                    println!(
                        "{}  head={}  {state}{lock}",
                        wt.name,
                        wt.head_snapshot_id.as_ref().map_or("-", |id| id.short()),
                    );
                }
            }
            Ok(())
        }
        WorktreeCommands::Rename { old, new } => {
            let (repo, config, _current) = open_context()?;
            let old = WorktreeName::new(&old).map_err(JvsError::from)?;
            let new = WorktreeName::new(&new).map_err(JvsError::from)?;
            worktree::rename(&repo, &config, &old, &new)?;
            println!("Renamed worktree '{old}' to '{new}'");
            Ok(())
        }
        WorktreeCommands::Remove { name } => {
            let (repo, config, _current) = open_context()?;
            let name = WorktreeName::new(&name).map_err(JvsError::from)?;
            worktree::remove(&repo, &config, &name)?;
            println!("Removed worktree '{name}'; its snapshots are now GC candidates.");
            Ok(())
        }
        WorktreeCommands::Path { name } => {
            let (repo, _config, current) = open_context()?;
            let name = match name {
                Some(raw) => WorktreeName::new(&raw).map_err(JvsError::from)?,
                None => current,
            };
            println!("{}", worktree::path(&repo, &name)?.display());
            Ok(())
        }
    }
}

fn run_doctor(strict: bool, repair_runtime: bool, repair: Option<RepairAction>) -> Result<()> {
    let (repo, config, _wt) = open_context()?;

    if let Some(action) = repair {
        let outcome = doctor::repair(&repo, &config, action)?;
        print_repair(&outcome);
        return Ok(());
    }
    if repair_runtime {
        for action in doctor::RUNTIME_REPAIRS {
            let outcome = doctor::repair(&repo, &config, *action)?;
            print_repair(&outcome);
        }
    }

    let report = doctor::check(&repo, &config, strict)?;
    if report.findings.is_empty() {
        println!("All checks passed.");
        return Ok(());
    }
    for finding in &report.findings {
        match &finding.path {
            Some(path) => println!(
                "{} {}: {} ({})",
                status_prefix(finding.severity),
                finding.check,
                finding.message,
                path.display()
            ),
            None => println!(
                "{} {}: {}",
                status_prefix(finding.severity),
                finding.check,
                finding.message
            ),
        }
    }
    anyhow::ensure!(report.is_healthy(), "doctor found problems; see above");
    Ok(())
}

fn print_repair(outcome: &jvs::doctor::RepairOutcome) {
    if outcome.changes.is_empty() {
        println!("{}: nothing to do", outcome.action);
    } else {
        println!("{}:", outcome.action);
        for change in &outcome.changes {
            println!("  {change}");
        }
    }
}

fn run_lock(cmd: LockCommands) -> Result<()> {
    let (repo, config, wt) = open_context()?;
    let locks = LockManager::new(&repo, &config.lock);
    match cmd {
        LockCommands::Acquire { purpose } => {
            let record = locks.acquire(&wt, &purpose)?;
            println!(
                "Acquired lock on '{}' until {} (fencing token {})",
                wt, record.expires_at, record.fencing_token
            );
            Ok(())
        }
        LockCommands::Release => {
            let nonce = locks
                .load_session(&wt)
                .map(|s| s.holder_nonce)
                .ok_or(JvsError::LockNotHeld {
                    worktree: wt.as_str().to_owned(),
                })?;
            locks.release(&wt, &nonce)?;
            println!("Released lock on '{wt}'");
            Ok(())
        }
        LockCommands::Renew => {
            let nonce = locks
                .load_session(&wt)
                .map(|s| s.holder_nonce)
                .ok_or(JvsError::LockNotHeld {
                    worktree: wt.as_str().to_owned(),
                })?;
            let record = locks.renew(&wt, &nonce)?;
            println!("Renewed lock on '{}' until {}", wt, record.expires_at);
            Ok(())
        }
        LockCommands::Status => {
            match locks.status(&wt)? {
                LockStatus::Free => println!("Lock on '{wt}': free"),
                LockStatus::Held(record) => println!(
                    "Lock on '{}': held (session {}, token {}, expires {})",
                    wt, record.session_id, record.fencing_token, record.expires_at
                ),
                LockStatus::Expired(record) => println!(
                    "Lock on '{}': expired (session {}, token {}, expired {})",
                    wt, record.session_id, record.fencing_token, record.expires_at
                ),
            }
            Ok(())
        }
        LockCommands::Steal { purpose } => {
            let record = locks.steal(&wt, &purpose)?;
            jvs::audit::record(
                &repo,
                "lock_steal",
                Some(wt.as_str()),
                None,
                serde_json::json!({ "fencing_token": record.fencing_token }),
            );
            println!(
                "Stole lock on '{}' (fencing token now {})",
                wt, record.fencing_token
            );
            Ok(())
        }
    }
}

fn run_ref(cmd: RefCommands) -> Result<()> {
    let (repo, _config, wt) = open_context()?;
    match cmd {
        RefCommands::Create { name, reference } => {
            let id = resolve_reference(&repo, &wt, &reference)?;
            refs::create_ref(&repo, &name, &id)?;
            println!("Ref '{}' -> {}", name, id.short());
            Ok(())
        }
        RefCommands::List => {
            for record in refs::list_refs(&repo)? {
                println!("{}  {}", record.name, record.snapshot_id);
            }
            Ok(())
        }
        RefCommands::Delete { name } => {
            refs::delete_ref(&repo, &name)?;
            println!("Deleted ref '{name}'");
            Ok(())
        }
    }
}

fn run_pin(cmd: PinCommands) -> Result<()> {
    let (repo, _config, wt) = open_context()?;
    match cmd {
        PinCommands::Add {
            reference,
            reason,
            ttl_secs,
        } => {
            let id = resolve_reference(&repo, &wt, &reference)?;
            refs::add_pin(&repo, &id, reason.as_deref(), ttl_secs)?;
            println!("Pinned {}", id.short());
            Ok(())
        }
        PinCommands::Remove { reference } => {
            let id = resolve_reference(&repo, &wt, &reference)?;
            refs::remove_pin(&repo, &id)?;
            println!("Unpinned {}", id.short());
            Ok(())
        }
        PinCommands::List => {
            let now = timeutil::now_ms();
            for pin in refs::list_pins(&repo)? {
                let state = if pin.is_active(now) { "active" } else { "expired" };
                println!(
                    "{}  {state}  {}",
                    pin.snapshot_id,
                    pin.reason.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
    }
}

fn parse_instant(raw: Option<&str>) -> Result<Option<u64>> {
    raw.map(|s| {
        timeutil::parse_rfc3339(s).map_err(|e| anyhow::anyhow!("invalid timestamp '{s}': {e}"))
    })
    .transpose()
}
