//! # cumulus
//!
//! A content-addressed, multi-backend cloud backup and synchronization
//! engine. A watched directory is continuously mirrored to one or more
//! object-store replicas; every change produces an immutable snapshot of
//! the directory tree referencing content-addressed blobs. Peers editing
//! the same repository through different replicas are converged by
//! three-way merge over the snapshot DAG.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌─────────────┐
//!                      │  CLI (clap)  │
//!                      └──────┬──────┘
//!                             │
//!          ┌──────────┬───────┴────────┬──────────┐
//!          ▼          ▼                ▼          ▼
//!     ┌────────┐ ┌─────────┐     ┌─────────┐ ┌────────┐
//!     │ Watcher│ │  Sync   │     │   GC    │ │ ls/xtr │
//!     └───┬────┘ └────┬────┘     └────┬────┘ └───┬────┘
//!         ▼           ▼               ▼          │
//!     ┌────────┐ ┌─────────┐     ┌─────────┐    │
//!     │Mutator │ │  Merge  │     │   DAG   │◀───┘
//!     └───┬────┘ └────┬────┘     └────┬────┘
//!         └───────────┴───────┬───────┘
//!                             ▼
//!               ┌───────────────────────────┐
//!               │  Cache  +  Backends (ss/, │
//!               │  t/, blobs)  + Decorator  │
//!               └───────────────────────────┘
//! ```

mod backend;
mod cache;
mod config;
mod dag;
mod decorator;
mod engine;
mod error;
mod gc;
mod hasher;
mod hierarchy;
mod merge;
mod mutator;
mod pointer;
mod record;
mod sync;
mod watcher;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use engine::Engine;
use error::Result;
use hasher::ObjectId;
use log::warn;
use record::{DirEntry, Snapshot, Tag, ROOT_DIR};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

/// cumulus — mirror a directory into versioned, content-addressed cloud
/// storage
#[derive(Parser, Debug)]
#[command(
    name = "cumulus",
    version,
    about = "A content-addressed, multi-backend cloud backup and synchronization engine",
    long_about = "cumulus watches a directory and mirrors every change into \
                  content-addressed snapshots replicated across the configured \
                  storage backends. Divergent histories from concurrent peers \
                  are reconciled by three-way merge; conflicts surface as \
                  renamed sibling files, never data loss."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = config::DEFAULT_CONFIG)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all versions of a path across backends
    Ls {
        /// Path to query, rooted at the watched directory (e.g. /docs/a.txt)
        path: String,
    },

    /// Extract a snapshot (or a path inside it) into the current directory
    Xtr {
        /// Backend to extract from
        cloud: String,
        /// Snapshot id to extract
        version: String,
        /// Path to extract, `/` for the whole tree
        path: String,
    },

    /// Manage named snapshot pointers
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Collapse snapshot history and reclaim unreachable storage
    Fsck {
        /// Keep only the current snapshot instead of the landmark set
        #[arg(short, long)]
        one: bool,
    },

    /// Begin watching and synchronizing
    Start,
}

#[derive(Subcommand, Debug)]
enum TagAction {
    /// Tag the current snapshot under a name
    Add { tag: String, path: String },
    /// Remove an existing tag
    Delete { tag: String },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version requests are not errors.
            if e.use_stderr() {
                let _ = e.print();
                std::process::exit(error::EXIT_BAD_CLI);
            }
            let _ = e.print();
            return;
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { "warn" },
    ))
    .init();

    if let Err(e) = run(cli) {
        eprintln!("{} {e}", colored::Colorize::red("error:"));
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = config::Config::load(&cli.config)?;
    match cli.command {
        Command::Ls { path } => cmd_ls(config, &path),
        Command::Xtr {
            cloud,
            version,
            path,
        } => cmd_xtr(config, &cloud, &version, &path),
        Command::Tag { action } => cmd_tag(config, action),
        Command::Fsck { one } => cmd_fsck(config, one),
        Command::Start => cmd_start(config),
    }
}

// ─── Command Implementations ────────────────────────────────────────────────

fn cmd_ls(config: config::Config, path: &str) -> Result<()> {
    let engine = Engine::open(config)?;

    // (entry, snapshot timestamp, snapshot id, cloud id)
    let mut versions: Vec<(DirEntry, DateTime<Utc>, ObjectId, String)> = Vec::new();
    for backend in &engine.backends {
        for (ss_id, timestamp) in backend.list_snapshots()? {
            let snapshot = match backend.get_snapshot(&ss_id) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("skipping snapshot {ss_id} on {}: {e}", backend.id());
                    continue;
                }
            };
            if path == ROOT_DIR {
                versions.push((
                    snapshot.root_entry(),
                    timestamp,
                    ss_id,
                    backend.id().to_string(),
                ));
            } else {
                let hier = engine.load_hierarchy(&snapshot.root_entry())?;
                let entries = hierarchy::find_entry(&hier, &snapshot.root, path);
                if entries.len() > 1 {
                    let entry = entries.into_iter().next_back();
                    if let Some(entry) = entry {
                        versions.push((entry, timestamp, ss_id, backend.id().to_string()));
                    }
                }
            }
        }
    }

    if versions.is_empty() {
        eprintln!("No versions of {path} found.");
        return Ok(());
    }

    versions.sort_by(|a, b| b.1.cmp(&a.1));
    for (entry, timestamp, ss_id, cloud) in versions {
        println!(
            "{}\t{}\t{}\t{}@{}",
            if entry.is_dir() { 'd' } else { 'f' },
            timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.fsize,
            ss_id,
            cloud,
        );
    }
    Ok(())
}

fn cmd_xtr(config: config::Config, cloud: &str, version: &str, path: &str) -> Result<()> {
    let decorator = Arc::new(decorator::Decorator::new(
        config.compress,
        config.zstd_level,
        if config.encrypt {
            config.password.as_deref()
        } else {
            None
        },
    ));
    config.ensure_dirs()?;
    let cache = cache::CacheStore::open(&config, Arc::clone(&decorator))?;
    let backends = vec![backend::open_backend(cloud, &config, decorator)?];

    let ss_id: ObjectId = version.parse().map_err(|_| {
        error::BackendError::NotFound {
            backend: cloud.to_string(),
            namespace: "snapshot",
            id: version.to_string(),
        }
    })?;
    let snapshot = backends[0].get_snapshot(&ss_id)?;
    let hier = hierarchy::load(&snapshot.root_entry(), &cache, &backends)?;

    let entries = hierarchy::find_entry(&hier, &snapshot.root, path);
    if path != ROOT_DIR && entries.len() == 1 {
        return Err(error::CumulusError::FileNotFound(path.to_string()));
    }
    let Some(target) = entries.into_iter().next_back() else {
        return Err(error::CumulusError::FileNotFound(path.to_string()));
    };

    // Depth-first extraction into the working directory.
    let mut extracted = 0u64;
    let mut stack: Vec<(DirEntry, PathBuf)> = vec![(target, PathBuf::from("."))];
    while let Some((entry, into)) = stack.pop() {
        if entry.is_dir() {
            // Extracting the root itself lands directly in the cwd.
            let dest = if entry.fname == ROOT_DIR {
                into
            } else {
                let dest = into.join(&entry.fname);
                match std::fs::create_dir(&dest) {
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        return Err(error::CumulusError::TargetExists(dest));
                    }
                    Err(e) => return Err(e.into()),
                    Ok(()) => {}
                }
                dest
            };
            if let Some(dir) = hier.get(&entry.obj_id) {
                for child in dir.entries() {
                    stack.push((child.clone(), dest.clone()));
                }
            }
        } else {
            let dest = into.join(&entry.fname);
            backends[0].retrieve_to_file(&entry.obj_id, &dest)?;
            extracted += 1;
        }
    }

    eprintln!(
        "  {} Extracted {extracted} file(s) from {}@{cloud}",
        colored::Colorize::green("✓"),
        ss_id.short(12),
    );
    Ok(())
}

fn cmd_tag(config: config::Config, action: TagAction) -> Result<()> {
    let engine = Engine::open(config)?;
    match action {
        TagAction::Add { tag, path } => {
            let root = engine.current_root()?.ok_or_else(|| {
                error::CumulusError::FileNotFound("no snapshot recorded yet".to_string())
            })?;
            let record = Tag::new(root, path);
            // Per-cloud tag failures are tolerated; the tag lands where it
            // can.
            for backend in &engine.backends {
                if let Err(e) = backend.tag(&tag, &record) {
                    warn!("tagging on {} failed: {e}", backend.id());
                }
            }
            eprintln!(
                "  {} Tagged {} as {tag}",
                colored::Colorize::green("✓"),
                root.short(12),
            );
        }
        TagAction::Delete { tag } => {
            for backend in &engine.backends {
                if let Err(e) = backend.untag(&tag) {
                    warn!("untagging on {} failed: {e}", backend.id());
                }
            }
            eprintln!("  {} Removed tag {tag}", colored::Colorize::green("✓"));
        }
    }
    Ok(())
}

fn cmd_fsck(config: config::Config, one: bool) -> Result<()> {
    let engine = Engine::open(config)?;
    let policy = if one {
        gc::Policy::KeepOne
    } else {
        gc::Policy::KeepLandmark
    };
    gc::Collector::new(&engine, policy).run()?;
    eprintln!(
        "  {} Garbage collection complete ({} backend(s))",
        colored::Colorize::green("✓"),
        engine.backends.len(),
    );
    Ok(())
}

fn cmd_start(config: config::Config) -> Result<()> {
    print_header("Start");
    let excludes = config.exclude_patterns()?;
    let engine = Arc::new(Engine::open(config)?);

    eprintln!("  Watched:  {}", engine.config.src_dir.display());
    eprintln!(
        "  Backends: {}",
        engine
            .backends
            .iter()
            .map(|b| b.id())
            .collect::<Vec<_>>()
            .join(", "),
    );
    eprintln!();

    // Upload the current state of the tree as the starting snapshot.
    let root_id = engine.upload_tree(&excludes)?;
    let parents: Vec<ObjectId> = engine.current_root()?.into_iter().collect();
    let snapshot = Snapshot::new(root_id, parents);
    let ss_id = engine.append_snapshot_everywhere(&snapshot)?;
    engine.pointer.set_root_snapshot(&ss_id)?;
    *engine.lock_hierarchy() = engine.load_hierarchy(&snapshot.root_entry())?;

    // Converge with every replica before watching.
    for backend in &engine.backends {
        sync::sync(&engine, backend.as_ref())?;
    }
    if engine.config.interval > 0 {
        let _timer = sync::spawn_timer(Arc::clone(&engine), engine.config.interval);
    }

    let (tx, rx) = mpsc::channel();
    let _watcher = watcher::watch(&engine.config.src_dir, tx)?;
    eprintln!(
        "  {} Watching for changes (Ctrl+C to stop)",
        colored::Colorize::cyan("👁"),
    );

    let mut mutator = mutator::Mutator::new(&engine, excludes);
    for event in rx {
        mutator.handle(event);
    }
    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn print_header(action: &str) {
    eprintln!();
    eprintln!(
        "  {} cumulus v{} — {action}",
        colored::Colorize::bold("⚡"),
        env!("CARGO_PKG_VERSION"),
    );
    eprintln!();
}
