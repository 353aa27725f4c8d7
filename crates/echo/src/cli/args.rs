//! Command-line argument structures and enums

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "echo")]
#[command(version)]
#[command(about = "Inspect and edit a replicated ECHO space", long_about = None)]
pub struct Cli {
    /// Directory holding the space (default: data_dir from the config, then ./.echo)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file
    #[arg(short, long, global = true, default_value = "echo.toml")]
    pub config: PathBuf,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new space with a fresh local peer
    Init {
        /// Replace an existing space in the data directory
        #[arg(long)]
        force: bool,
    },

    /// Create an object
    Create {
        /// Model type of the object
        #[arg(short = 't', long = "type", default_value = "echo.model/key-value")]
        model_type: String,

        /// Source object, making this a relation
        #[arg(long, requires = "target")]
        source: Option<String>,

        /// Target object, making this a relation
        #[arg(long, requires = "source")]
        target: Option<String>,
    },

    /// Set a field on an object
    Set {
        /// Object id
        id: String,

        /// Field name
        key: String,

        /// New value, parsed as JSON (plain text is stored as a string)
        value: String,
    },

    /// Remove a field from an object
    Unset {
        /// Object id
        id: String,

        /// Field name
        key: String,
    },

    /// Tombstone an object
    Delete {
        /// Object id
        id: String,
    },

    /// Print objects as JSON
    Show {
        /// Object id (default: every live object)
        id: Option<String>,

        /// Include deleted objects
        #[arg(short, long)]
        all: bool,
    },

    /// Print the processed and available timeframes
    Frontier,

    /// Manage snapshots
    #[command(alias = "snap")]
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Snapshot the current state and print its hash
    Save,

    /// Print a stored snapshot
    Show {
        /// Snapshot hash
        hash: String,
    },

    /// Restore a snapshot, then replay newer records
    Restore {
        /// Snapshot hash
        hash: String,
    },

    /// List stored snapshots
    List,
}
