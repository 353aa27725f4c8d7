//! Command dispatch and the on-disk space layout.
//!
//! ```text
//! <data_dir>/
//! ├── space.json    space key, local peer id, last snapshot hash
//! ├── feeds.db      SQLite feed store
//! └── snapshots/    one file per snapshot hash
//! ```

/// Clap argument definitions
mod args;

/// `create`, `set`, `unset`, `delete`, `show` commands
mod object;

/// `snapshot` subcommands
mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};

use echo_core::config::EchoConfig;
use echo_core::error::{EchoError, Result};
use echo_core::feed::SqliteFeedStore;
use echo_core::keys::{PeerId, SpaceKey};
use echo_core::pipeline::{ModelRegistry, Pipeline, ProcessReport};
use echo_core::snapshot::{SnapshotMonitor, SnapshotStore, snapshot_if_due};
use echo_core::storage::NativeDirectory;
use echo_core::timeframe::Timeframe;

pub use args::Cli;
use args::Commands;

const SPACE_FILE: &str = "space.json";
const FEEDS_FILE: &str = "feeds.db";
const SNAPSHOTS_DIR: &str = "snapshots";
const DEFAULT_DATA_DIR: &str = ".echo";

/// Helper to run async operations in sync context
fn block_on<F: std::future::Future>(f: F) -> F::Output {
    futures_lite::future::block_on(f)
}

/// Identity of the space kept in `space.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpaceInfo {
    space_key: SpaceKey,
    peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_snapshot: Option<String>,
}

impl SpaceInfo {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// An opened space: feeds replayed, snapshot monitor armed.
struct Session {
    data_dir: PathBuf,
    info: SpaceInfo,
    pipeline: Pipeline,
    snapshots: SnapshotStore,
    monitor: SnapshotMonitor,
}

impl Session {
    /// Open the space in `data_dir`, starting from its last snapshot if any.
    fn open(data_dir: &Path, config: &EchoConfig) -> Result<Self> {
        let info_path = data_dir.join(SPACE_FILE);
        if !info_path.exists() {
            return Err(EchoError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no space in {} (run `echo init` first)", data_dir.display()),
            )));
        }
        let info = SpaceInfo::load(&info_path)?;

        let feed = Arc::new(SqliteFeedStore::open(data_dir.join(FEEDS_FILE))?);
        let directory = Arc::new(NativeDirectory::open(data_dir.join(SNAPSHOTS_DIR))?);
        let snapshots = SnapshotStore::new(directory);
        let mut pipeline = Pipeline::new(
            info.space_key.clone(),
            feed,
            Arc::new(ModelRegistry::with_defaults()),
            config,
        );

        let mut epoch = Timeframe::new();
        if let Some(hash) = &info.last_snapshot {
            match block_on(snapshots.load(hash))? {
                Some(snapshot) => {
                    epoch = snapshot.timeframe.clone();
                    pipeline.restore(snapshot)?;
                }
                None => log::warn!("Snapshot {} is missing, replaying feeds from the start", hash),
            }
        }

        let report = pipeline.process()?;
        log_report(&report);

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            info,
            pipeline,
            snapshots,
            monitor: SnapshotMonitor::with_epoch(config.snapshot_message_limit, epoch),
        })
    }

    fn peer_id(&self) -> PeerId {
        self.info.peer_id.clone()
    }

    fn save_info(&self) -> Result<()> {
        self.info.save(&self.data_dir.join(SPACE_FILE))
    }

    /// Record `hash` as the snapshot to start from next time.
    fn set_last_snapshot(&mut self, hash: String) -> Result<()> {
        self.info.last_snapshot = Some(hash);
        self.save_info()
    }

    /// Snapshot the space if enough messages arrived since the last one.
    fn checkpoint(&mut self) -> Result<()> {
        let due = block_on(snapshot_if_due(&self.monitor, &self.pipeline, &self.snapshots))?;
        if let Some(hash) = due {
            log::info!("Stored automatic snapshot {}", hash);
            self.set_last_snapshot(hash)?;
        }
        Ok(())
    }
}

fn log_report(report: &ProcessReport) {
    log::debug!(
        "Processed feeds: {} applied, {} duplicates, {} buffered",
        report.applied,
        report.duplicates,
        report.buffered
    );
    for err in &report.errors {
        log::warn!("{}", err);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

/// Main entry point for the CLI
pub fn run_cli() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match EchoConfig::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Failed to load {}: {}", cli.config.display(), e);
            std::process::exit(1);
        }
    };
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| config.data_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

    let result = match cli.command {
        Commands::Init { force } => handle_init(&data_dir, force),
        command => Session::open(&data_dir, &config).and_then(|mut session| run(&mut session, command)),
    };

    if let Err(e) = result {
        eprintln!("✗ {}", e);
        std::process::exit(1);
    }
}

fn run(session: &mut Session, command: Commands) -> Result<()> {
    match command {
        Commands::Init { .. } => Err(EchoError::Invariant(
            "init cannot run against an open space".to_string(),
        )),

        Commands::Create {
            model_type,
            source,
            target,
        } => object::handle_create(session, &model_type, source, target),

        Commands::Set { id, key, value } => object::handle_set(session, &id, &key, &value),

        Commands::Unset { id, key } => object::handle_unset(session, &id, &key),

        Commands::Delete { id } => object::handle_delete(session, &id),

        Commands::Show { id, all } => object::handle_show(session, id.as_deref(), all),

        Commands::Frontier => handle_frontier(session),

        Commands::Snapshot { command } => snapshot::handle_snapshot_command(session, command),
    }
}

/// Handle the init command
fn handle_init(data_dir: &Path, force: bool) -> Result<()> {
    let info_path = data_dir.join(SPACE_FILE);
    if info_path.exists() {
        if !force {
            return Err(EchoError::Invariant(format!(
                "{} already holds a space (use --force to replace it)",
                data_dir.display()
            )));
        }
        let feeds = data_dir.join(FEEDS_FILE);
        if feeds.exists() {
            std::fs::remove_file(feeds)?;
        }
        let snapshots = data_dir.join(SNAPSHOTS_DIR);
        if snapshots.exists() {
            std::fs::remove_dir_all(snapshots)?;
        }
    }

    std::fs::create_dir_all(data_dir)?;
    let info = SpaceInfo {
        space_key: SpaceKey::random(),
        peer_id: PeerId::random(),
        last_snapshot: None,
    };
    info.save(&info_path)?;

    println!("✓ Initialized space {}", info.space_key);
    println!("  Peer:      {}", info.peer_id);
    println!("  Directory: {}", data_dir.display());
    Ok(())
}

/// Handle the frontier command
fn handle_frontier(session: &Session) -> Result<()> {
    let processed = session.pipeline.timeframe();
    let end = session.pipeline.end_timeframe()?;
    let epoch = session.monitor.epoch();

    println!("Processed: {}", processed);
    println!("Available: {}", end);
    println!("Messages:  {}", processed.total_messages());
    println!(
        "Since last snapshot: {} (limit {})",
        processed.new_messages(&epoch),
        session.monitor.limit()
    );
    if let Some(hash) = &session.info.last_snapshot {
        println!("Last snapshot: {}", hash);
    }
    if session.pipeline.is_stalled() {
        println!("⚠ Pipeline is stalled waiting for causal dependencies");
    }
    Ok(())
}
