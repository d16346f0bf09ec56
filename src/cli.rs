//! certflow command line, built on clap.
//!
//! Defines [`Cli`] with its [`Command`] subcommands (demo, status, list,
//! stats, drain, expire) and the global flags (--config, --data-dir,
//! --verbose, --json-logs).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use certflow::config::CONFIG_FILE;
use certflow::state_machine::State;

/// certflow: certification lifecycle engine.
#[derive(Debug, Parser)]
#[command(name = "certflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Directory holding application records; overrides the configuration.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one application through the whole lifecycle with simulated
    /// collaborators and print its audit trail.
    Demo {
        /// Reject the documents once before approving them.
        #[arg(long)]
        revision: bool,

        /// Require an on-site visit after the remote assessment.
        #[arg(long)]
        on_site: bool,
    },

    /// Show an application's state and history.
    Status {
        id: Uuid,
    },

    /// List applications, oldest first.
    List {
        /// Only applications in this state (e.g. document_review).
        #[arg(long)]
        state: Option<State>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Counts per state and completion figures.
    Stats,

    /// Deliver pending outbox entries.
    Drain {
        /// Keep polling until interrupted.
        #[arg(long)]
        follow: bool,
    },

    /// Expire applications idle past their state's timeout.
    Expire,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Demo { .. } => "demo",
            Command::Status { .. } => "status",
            Command::List { .. } => "list",
            Command::Stats => "stats",
            Command::Drain { .. } => "drain",
            Command::Expire => "expire",
        }
    }
}
