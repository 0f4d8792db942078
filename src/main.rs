use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use feedprobe::config::Config;
use feedprobe::feed::HttpOracle;
use feedprobe::ingest;
use feedprobe::scheduler::{format_duration, ProgressUpdate, Scheduler, SchedulerOptions};
use feedprobe::storage::{Database, DatabaseError, DiscardReason};

/// Get the config directory path (~/.config/feedprobe/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("feedprobe");
    Ok(config_dir)
}

/// Create the config directory with user-only permissions if it is missing.
fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if config_dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(config_dir, perms) {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "feedprobe",
    about = "Discover the RSS/Atom feeds behind large pools of harvested URLs"
)]
struct Args {
    /// Config file (default: ~/.config/feedprobe/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Work database (overrides `database_path`)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add candidate URLs from a file (url[TAB score[TAB submitted_at]] per line)
    Import {
        file: PathBuf,

        /// Tag recorded with every imported candidate
        #[arg(long)]
        source: Option<String>,
    },

    /// Probe every pending candidate
    Run {
        /// Number of concurrent workers (overrides `workers`)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Show candidate and feed counts
    Status {
        #[arg(long)]
        json: bool,
    },

    /// List discovered feeds
    Feeds {
        #[arg(long)]
        json: bool,
    },

    /// Return discarded candidates with REASON to the pending pool
    Requeue {
        #[arg(long, value_parser = parse_reason)]
        reason: DiscardReason,
    },
}

fn parse_reason(s: &str) -> Result<DiscardReason, String> {
    s.parse().map_err(|e| {
        let known: Vec<&str> = DiscardReason::ALL.iter().map(|r| r.as_str()).collect();
        format!("{e} (expected one of: {})", known.join(", "))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = match args.db.clone().or_else(|| config.database_path.clone()) {
        Some(path) => path,
        None => {
            ensure_config_dir(&config_dir)?;
            config_dir.join("feedprobe.db")
        }
    };
    let db = open_database(&db_path).await?;

    match args.command {
        Command::Import { file, source } => import(&db, &file, source.as_deref()).await,
        Command::Run { workers } => {
            if let Some(workers) = workers {
                anyhow::ensure!(workers > 0, "--workers must be at least 1");
                config.workers = workers;
            }
            run(db, &config).await
        }
        Command::Status { json } => status(&db, json).await,
        Command::Feeds { json } => feeds(&db, json).await,
        Command::Requeue { reason } => {
            let count = db
                .requeue(reason)
                .await
                .context("Failed to requeue candidates")?;
            println!("Requeued {count} candidates discarded as {reason}");
            Ok(())
        }
    }
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another feedprobe process appears to hold {}. Please stop it and try again.",
                path.display()
            );
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

async fn import(db: &Database, file: &Path, source: Option<&str>) -> Result<()> {
    let candidates = ingest::read_candidates(file, source)
        .with_context(|| format!("Failed to import {}", file.display()))?;
    let report = db
        .insert_candidates(&candidates)
        .await
        .context("Failed to store candidates")?;
    println!(
        "Imported {} candidates ({} already present)",
        report.inserted, report.duplicates
    );
    Ok(())
}

async fn run(db: Database, config: &Config) -> Result<()> {
    let oracle = HttpOracle::from_config(config).context("Failed to build HTTP client")?;
    let mut scheduler = Scheduler::new(db, Arc::new(oracle), SchedulerOptions::from_config(config));

    let printer = if config.progress {
        let (tx, mut rx) = mpsc::channel::<ProgressUpdate>(64);
        scheduler = scheduler.with_progress(tx);
        Some(tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                println!("{update}");
            }
        }))
    } else {
        None
    };

    let result = scheduler.run().await;
    if let Some(printer) = printer {
        if let Err(e) = printer.await {
            tracing::warn!(error = %e, "Progress printer task failed");
        }
    }

    let summary = result.context("Run aborted")?;
    println!(
        "Done: {}/{} processed in {} ({} requests): {} feeds found, {} matched known feeds, {} discarded",
        summary.processed,
        summary.total,
        format_duration(summary.elapsed),
        summary.requests,
        summary.registered,
        summary.matched,
        summary.discarded
    );
    Ok(())
}

async fn status(db: &Database, json: bool) -> Result<()> {
    let stats = db.stats().await.context("Failed to read status")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Candidates: {}", stats.candidates);
    println!("  pending:   {}", stats.pending);
    println!("  matched:   {}", stats.matched);
    let discarded: i64 = stats.discarded.iter().map(|(_, n)| n).sum();
    println!("  discarded: {discarded}");
    for (reason, count) in &stats.discarded {
        println!("    {reason}: {count}");
    }
    println!("Feeds: {}", stats.feeds);
    Ok(())
}

async fn feeds(db: &Database, json: bool) -> Result<()> {
    let feeds = db.feeds().await.context("Failed to list feeds")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&feeds)?);
        return Ok(());
    }

    for feed in &feeds {
        println!(
            "{:>5}  {:>7}  {}  {}",
            feed.submission_count,
            feed.total_score,
            feed.root_url,
            feed.feed_url
        );
    }
    if feeds.is_empty() {
        println!("No feeds discovered yet");
    }
    Ok(())
}
