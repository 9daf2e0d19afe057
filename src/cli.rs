//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Inspect and administer the novelsync task queue.
///
/// The queue file is shared with the running application; every command
/// operates on the same durable state the scheduler drains.
#[derive(Parser, Debug)]
#[command(name = "novelsync")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Path to the task queue database
    #[arg(long, default_value = "novelsync.db")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Queue administration commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show task counts by state
    Status,
    /// List tasks, optionally filtered by state
    List {
        /// Only show tasks in this state (queued, running, retrying,
        /// succeeded, failed, cancelled)
        #[arg(long)]
        state: Option<String>,
    },
    /// Reset tasks left running by a crashed process back to queued
    Recover,
    /// Cancel a queued or retrying task by id
    Cancel {
        /// The task id to cancel
        id: i64,
    },
    /// Remove all terminal tasks (succeeded, failed, cancelled)
    Prune,
}
