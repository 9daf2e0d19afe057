//! CLI entry point for the novelsync queue administration tool.

use anyhow::{Result, bail};
use clap::Parser;
use novelsync_core::{Database, RetryPolicy, TaskQueue, TaskState};
use tracing::{debug, info};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let db = Database::new(&args.db).await?;
    let queue = TaskQueue::new(db, RetryPolicy::default());

    match args.command {
        Command::Status => {
            let states = [
                TaskState::Queued,
                TaskState::Running,
                TaskState::Retrying,
                TaskState::Succeeded,
                TaskState::Failed,
                TaskState::Cancelled,
            ];
            for state in states {
                let count = queue.count_by_state(state).await?;
                println!("{state:>10}: {count}");
            }
        }
        Command::List { state } => {
            let tasks = match state {
                Some(raw) => {
                    let state: TaskState = raw
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!("{e}"))?;
                    queue.list_by_state(state).await?
                }
                None => queue.list_all().await?,
            };
            if tasks.is_empty() {
                info!("no matching tasks");
            }
            for task in tasks {
                let chapter = task.chapter_id.as_deref().unwrap_or("-");
                let error = task.last_error.as_deref().unwrap_or("");
                println!(
                    "{:>6}  {:<20}  {:<12}  {}/{}  attempt {}  {}",
                    task.id,
                    task.kind(),
                    task.state(),
                    task.novel_id,
                    chapter,
                    task.attempt,
                    error
                );
            }
        }
        Command::Recover => {
            let reset = queue.recover_running().await?;
            info!(reset, "running tasks returned to queue");
            println!("recovered {reset} task(s)");
        }
        Command::Cancel { id } => {
            if queue.cancel(id).await? {
                println!("task {id} cancelled");
            } else {
                bail!(
                    "task {id} is running or already terminal; only queued or retrying tasks can be cancelled here"
                );
            }
        }
        Command::Prune => {
            let removed = queue.prune_terminal().await?;
            info!(removed, "terminal tasks pruned");
            println!("pruned {removed} task(s)");
        }
    }

    Ok(())
}
