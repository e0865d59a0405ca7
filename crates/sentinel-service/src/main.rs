use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sentinel_core::exclusions::ExclusionKind;
use sentinel_core::paths::DataLayout;
use sentinel_core::store::ChangeStatus;
use sentinel_service::enforcement::accept::AcceptOutcome;
use sentinel_service::enforcement::restore::RestoreOutcome;
use sentinel_service::engine::Engine;
use sentinel_service::integrity::comparator::ChangeRecord;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Darklock Sentinel file integrity monitor", long_about = None)]
struct Cli {
    /// Directory for the database, baseline and backups
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a directory and record it as the known-good baseline
    Baseline {
        #[arg(required_unless_present = "clear")]
        dir: Option<PathBuf>,
        /// Discard the current baseline instead of creating one
        #[arg(long, conflicts_with = "dir")]
        clear: bool,
    },
    /// Compare the monitored directory against the baseline
    Check {
        dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Watch the monitored directory until Ctrl-C
    Watch { dir: Option<PathBuf> },
    /// Accept the current state of a file into the baseline
    Allow { path: PathBuf },
    /// Restore a file from its latest backup
    Restore { path: PathBuf },
    /// List the stored versions of a file
    History { path: PathBuf },
    /// List, acknowledge or clear alerts
    Alerts {
        #[arg(long)]
        unread: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        mark_read: bool,
        #[arg(long)]
        clear: bool,
    },
    /// Manage exclusion rules
    Exclude {
        #[command(subcommand)]
        action: ExcludeCommand,
    },
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ExcludeCommand {
    Add {
        pattern: String,
        /// directory, file or extension
        #[arg(long, default_value = "directory")]
        kind: ExclusionKind,
    },
    Remove {
        pattern: String,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show,
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let layout = DataLayout::resolve(cli.data_dir.as_deref())?;
    let engine = Engine::open(layout)?;

    match cli.command {
        Commands::Baseline { clear: true, .. } => {
            if engine.clear_baseline()? {
                println!("baseline cleared");
            } else {
                println!("no baseline to clear");
            }
            Ok(())
        }
        Commands::Baseline { dir, .. } => match dir {
            Some(dir) => baseline_command(&engine, dir).await,
            None => bail!("a directory is required"),
        },
        Commands::Check { dir, json } => check_command(&engine, dir, json).await,
        Commands::Watch { dir } => watch_command(&engine, dir).await,
        Commands::Allow { path } => {
            match engine.allow_change(&path)? {
                AcceptOutcome::Updated { key, digest, .. } => {
                    println!("accepted {key} ({digest})")
                }
                AcceptOutcome::Removed { key } => println!("removed {key} from baseline"),
            }
            Ok(())
        }
        Commands::Restore { path } => {
            match engine.restore_latest(&path)? {
                RestoreOutcome::Restored { backup } => {
                    println!("restored {} from {}", path.display(), backup.display())
                }
                RestoreOutcome::AlreadyRestoring => {
                    println!("{} is already being restored", path.display())
                }
            }
            Ok(())
        }
        Commands::History { path } => {
            let history = engine.backup_history(&path)?;
            if history.is_empty() {
                println!("no backups recorded for {}", path.display());
            }
            for record in &history {
                println!(
                    "{}  {}",
                    record.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
                    record.backup_path.display()
                );
            }
            Ok(())
        }
        Commands::Alerts {
            unread,
            limit,
            mark_read,
            clear,
        } => alerts_command(&engine, unread, limit, mark_read, clear),
        Commands::Exclude { action } => exclude_command(&engine, action),
        Commands::Config { action } => config_command(&engine, action),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn show_progress(label: &str, pct: u8) {
    eprint!("\r{label}... {pct:>3}%");
    let _ = std::io::stderr().flush();
    if pct == 100 {
        eprintln!();
    }
}

async fn baseline_command(engine: &Engine, dir: PathBuf) -> Result<()> {
    let created = engine
        .create_baseline(&dir, |pct| show_progress("scanning", pct))
        .await?;
    println!(
        "baseline: {} files under {}",
        created.entries,
        created.root.display()
    );

    let mut progress = created.backup.progress();
    let wait = created.backup.wait();
    tokio::pin!(wait);
    let summary = loop {
        tokio::select! {
            res = &mut wait => break res?,
            changed = progress.changed() => {
                if changed.is_err() {
                    break (&mut wait).await?;
                }
                let pct = *progress.borrow_and_update();
                show_progress("backing up", pct);
            }
        }
    };
    println!(
        "backups: {} copied, {} skipped",
        summary.copied, summary.skipped
    );
    Ok(())
}

async fn check_command(engine: &Engine, dir: Option<PathBuf>, json: bool) -> Result<()> {
    let mut report = engine
        .check(dir.as_deref(), move |pct| {
            if !json {
                show_progress("scanning", pct)
            }
        })
        .await?;
    report
        .changes
        .sort_by(|a, b| (a.kind, &a.path).cmp(&(b.kind, &b.path)));

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if report.changes.is_empty() {
        println!(
            "{} files intact under {}",
            report.scanned,
            report.root.display()
        );
        return Ok(());
    }
    for change in &report.changes {
        println!("{:<9} {}  ({})", change.kind, change.path, change.detail);
    }
    println!("{} change(s) detected", report.changes.len());
    Ok(())
}

async fn watch_command(engine: &Engine, dir: Option<PathBuf>) -> Result<()> {
    let root = engine.start_protection(
        dir.as_deref(),
        Arc::new(|file_name: &str, status: ChangeStatus| {
            println!(
                "[{}] {:<8} {}",
                chrono::Local::now().format("%H:%M:%S"),
                status,
                file_name
            );
        }),
        Some(Arc::new(|records: Vec<ChangeRecord>| {
            if !records.is_empty() {
                println!("audit: {} file(s) differ from the baseline", records.len());
            }
        })),
    )?;
    println!("protecting {} (Ctrl-C to stop)", root.display());

    signal::ctrl_c().await.context("wait for Ctrl-C")?;
    info!("stopping protection");
    engine.stop_protection().await;
    Ok(())
}

fn alerts_command(
    engine: &Engine,
    unread: bool,
    limit: usize,
    mark_read: bool,
    clear: bool,
) -> Result<()> {
    if clear {
        println!("cleared {} alert(s)", engine.clear_alerts()?);
        return Ok(());
    }
    let alerts = engine.alerts(limit, unread)?;
    for alert in &alerts {
        println!(
            "{} {} {:<8} {:<32} {}",
            if alert.is_read { " " } else { "*" },
            alert.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
            alert.status,
            alert.file_name,
            alert.actor
        );
    }
    if alerts.is_empty() {
        println!("no alerts");
    }
    if mark_read {
        println!("marked {} alert(s) read", engine.mark_all_read()?);
    }
    Ok(())
}

fn exclude_command(engine: &Engine, action: ExcludeCommand) -> Result<()> {
    match action {
        ExcludeCommand::Add { pattern, kind } => {
            engine.add_exclusion(&pattern, kind)?;
            println!("excluding {kind} {pattern}");
        }
        ExcludeCommand::Remove { pattern } => {
            if engine.remove_exclusion(&pattern)? {
                println!("removed {pattern}");
            } else {
                println!("no exclusion named {pattern}");
            }
        }
        ExcludeCommand::List => {
            for rule in engine.list_exclusions()? {
                println!("{:<10} {}", rule.kind, rule.pattern);
            }
        }
    }
    Ok(())
}

fn config_command(engine: &Engine, action: ConfigCommand) -> Result<()> {
    let settings = match action {
        ConfigCommand::Show => engine.settings(),
        ConfigCommand::Set { key, value } => engine.set_setting(&key, &value)?,
    };
    println!("{}", serde_json::to_string_pretty(&settings)?);
    println!("data dir: {}", engine.layout().root().display());
    Ok(())
}
