//! Snapshot commands.

use echo_core::error::{EchoError, Result};
use echo_core::snapshot::SpaceSnapshot;

use super::args::SnapshotCommands;
use super::{Session, block_on, log_report};

pub(super) fn handle_snapshot_command(session: &mut Session, command: SnapshotCommands) -> Result<()> {
    match command {
        SnapshotCommands::Save => handle_save(session),
        SnapshotCommands::Show { hash } => handle_show(session, &hash),
        SnapshotCommands::Restore { hash } => handle_restore(session, &hash),
        SnapshotCommands::List => handle_list(session),
    }
}

fn load(session: &Session, hash: &str) -> Result<SpaceSnapshot> {
    block_on(session.snapshots.load(hash))?
        .ok_or_else(|| EchoError::UnresolvedReference(format!("snapshot {} not found", hash)))
}

fn handle_save(session: &mut Session) -> Result<()> {
    let snapshot = session.pipeline.snapshot();
    let hash = block_on(session.snapshots.store(&snapshot))?;
    session.set_last_snapshot(hash.clone())?;

    println!("✓ Stored snapshot at {}", snapshot.timeframe);
    println!("{}", hash);
    Ok(())
}

fn handle_show(session: &Session, hash: &str) -> Result<()> {
    let snapshot = load(session, hash)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn handle_restore(session: &mut Session, hash: &str) -> Result<()> {
    let snapshot = load(session, hash)?;
    let timeframe = snapshot.timeframe.clone();
    session.pipeline.restore(snapshot)?;
    let report = session.pipeline.process()?;
    log_report(&report);
    session.set_last_snapshot(hash.to_string())?;

    println!("✓ Restored snapshot taken at {}", timeframe);
    println!(
        "  Replayed {} newer records, now at {}",
        report.applied,
        session.pipeline.timeframe()
    );
    println!("  Objects: {}", session.pipeline.items().len());
    Ok(())
}

fn handle_list(session: &Session) -> Result<()> {
    let keys = block_on(session.snapshots.list())?;
    if keys.is_empty() {
        println!("No snapshots stored.");
        return Ok(());
    }
    for key in keys {
        let marker = if session.info.last_snapshot.as_deref() == Some(key.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{} {}", marker, key);
    }
    Ok(())
}
