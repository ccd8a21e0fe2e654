use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use coursevault::config::Config;
use coursevault::reconcile::{
    Confirm, JobOptions, JobReport, ReconcileError, Reconciler, RestoreOutcome,
};
use coursevault::vault::search::{CreateOutcome, SearchIndex};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Reconciles document blobs, the catalog and the search index.
#[derive(Parser, Debug)]
#[command(name = "coursevault", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Owner id for new records (defaults to the configured default owner)
    #[arg(long)]
    owner: Option<i64>,

    /// Scan and report only; write nothing
    #[arg(long)]
    dry_run: bool,

    /// Stop after this many items
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Catalog a legacy tree in place
    Import {
        #[arg(long, value_name = "DIR")]
        source: PathBuf,
        /// Treat subject/filename/category matches as already imported
        #[arg(long)]
        skip_duplicates: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Copy a legacy tree into canonical storage
    Migrate {
        #[arg(long, value_name = "DIR")]
        source: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Migrate files the structured scan skipped (odd or non-UTF-8 names)
    MigrateRemaining {
        #[arg(long, value_name = "DIR")]
        source: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Catalog blobs in canonical storage that have no record
    SyncStorage {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Rebuild the catalog and index from canonical storage
    Rebuild {
        /// Wipe file records and favorites and recreate the index first
        #[arg(long)]
        clear_all: bool,
        /// Do not ask before destructive steps
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Restore catalog records from the search index
    SyncFromIndex {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Rewrite index documents from the catalog
    Reindex {
        /// Extract text from blobs again instead of reusing indexed content
        #[arg(long)]
        reextract: bool,
        /// Drop and recreate the index first
        #[arg(long)]
        recreate: bool,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Restore from the index if the catalog is empty
    AutoRestore,
    /// Search index administration
    Index {
        #[command(subcommand)]
        action: IndexCommand,
    },
    /// Full-text search over the index
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// One JSON document per line
        #[arg(long)]
        json: bool,
    },
    /// Owner administration
    Owner {
        #[command(subcommand)]
        action: OwnerCommand,
    },
}

impl Command {
    fn is_dry_run(&self) -> bool {
        match self {
            Command::Import { common, .. }
            | Command::Migrate { common, .. }
            | Command::MigrateRemaining { common, .. }
            | Command::SyncStorage { common }
            | Command::Rebuild { common, .. }
            | Command::SyncFromIndex { common }
            | Command::Reindex { common, .. } => common.dry_run,
            _ => false,
        }
    }
}

#[derive(Subcommand, Debug)]
enum IndexCommand {
    Create,
    Delete {
        #[arg(long)]
        force: bool,
    },
    Stats,
    Ping,
}

#[derive(Subcommand, Debug)]
enum OwnerCommand {
    /// Create the owner if it does not exist and print its id
    Ensure {
        username: String,
        #[arg(long)]
        staff: bool,
    },
}

/// Asks on the terminal. Declines when stdin is not interactive.
struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        if !console::Term::stderr().is_term() {
            warn!("not a terminal, declining: {prompt}");
            return Ok(false);
        }
        let answer = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        Ok(answer)
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "coursevault=debug" } else { "coursevault=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    let reconciler = if cli.command.is_dry_run() {
        Reconciler::from_config_read_only(&config)
            .context("A dry run needs an existing catalog; run without --dry-run first")?
    } else {
        Reconciler::from_config(&config)?
    };

    let token = reconciler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current item");
            token.cancel();
        }
    });

    run(cli.command, &config, &reconciler).await
}

async fn run(command: Command, config: &Config, reconciler: &Reconciler) -> Result<()> {
    let gate = TerminalConfirm;
    match command {
        Command::Import { source, skip_duplicates, common } => {
            let mut opts = job_options(reconciler, config, &common)?;
            opts.source = Some(source);
            opts.skip_duplicates = skip_duplicates;
            print_report(&reconciler.import(&opts).await?);
        }
        Command::Migrate { source, common } => {
            let mut opts = job_options(reconciler, config, &common)?;
            opts.source = Some(source);
            print_report(&reconciler.migrate(&opts).await?);
        }
        Command::MigrateRemaining { source, common } => {
            let mut opts = job_options(reconciler, config, &common)?;
            opts.source = Some(source);
            print_report(&reconciler.migrate_remaining(&opts).await?);
        }
        Command::SyncStorage { common } => {
            let opts = job_options(reconciler, config, &common)?;
            print_report(&reconciler.sync_storage(&opts).await?);
        }
        Command::Rebuild { clear_all, force, common } => {
            let mut opts = job_options(reconciler, config, &common)?;
            opts.clear_all = clear_all;
            opts.force = force;
            print_report(&reconciler.rebuild(&opts, &gate).await?);
        }
        Command::SyncFromIndex { common } => {
            let opts = job_options(reconciler, config, &common)?;
            print_report(&reconciler.sync_from_index(&opts).await?);
        }
        Command::Reindex { reextract, recreate, force, common } => {
            let mut opts = job_options(reconciler, config, &common)?;
            opts.reextract = reextract;
            opts.recreate = recreate;
            opts.force = force;
            print_report(&reconciler.reindex(&opts, &gate).await?);
        }
        Command::AutoRestore => match reconciler.auto_restore(&config.owner.default_username).await? {
            RestoreOutcome::NotNeeded { records } => {
                println!("{} catalog has {records} records", style("nothing to do:").green());
            }
            RestoreOutcome::IndexUnavailable(reason) => {
                println!("{} {reason}", style("cannot restore:").yellow());
            }
            RestoreOutcome::Restored(report) => print_report(&report),
        },
        Command::Index { action } => index_command(action, reconciler.index(), &gate)?,
        Command::Search { query, limit, json } => {
            let hits = reconciler.index().search(&query, limit)?;
            for hit in &hits {
                if json {
                    println!("{}", serde_json::to_string(&hit.document)?);
                } else {
                    println!(
                        "{:>6}  {}  {}",
                        hit.document.id,
                        style(&hit.document.original_filename).bold(),
                        style(format!("{} / {}", hit.document.subject, hit.document.category)).dim()
                    );
                }
            }
            if !json {
                println!("{} hits", hits.len());
            }
        }
        Command::Owner { action: OwnerCommand::Ensure { username, staff } } => {
            let owner = reconciler.catalog().ensure_owner(&username, staff)?;
            println!("{} {} (id {})", style("owner").green(), owner.username, owner.id);
        }
    }
    Ok(())
}

/// Options shared by every job. Without `--owner` the configured default
/// owner is used, and it must already exist.
fn job_options(reconciler: &Reconciler, config: &Config, common: &CommonArgs) -> Result<JobOptions> {
    let owner_id = match common.owner {
        Some(id) => id,
        None => {
            let username = &config.owner.default_username;
            reconciler
                .catalog()
                .find_owner_by_username(username)?
                .ok_or_else(|| ReconcileError::UnknownOwnerName(username.clone()))?
                .id
        }
    };
    Ok(JobOptions {
        owner_id: Some(owner_id),
        dry_run: common.dry_run,
        limit: common.limit,
        ..JobOptions::default()
    })
}

fn index_command(action: IndexCommand, index: &dyn SearchIndex, gate: &dyn Confirm) -> Result<()> {
    match action {
        IndexCommand::Create => match index.create_index()? {
            CreateOutcome::Created => println!("{}", style("index created").green()),
            CreateOutcome::AlreadyExists => println!("index already exists"),
        },
        IndexCommand::Delete { force } => {
            if !force && !gate.confirm("Delete the search index?")? {
                return Err(ReconcileError::NotConfirmed("index deletion".into()).into());
            }
            if index.delete_index()? {
                println!("{}", style("index deleted").green());
            } else {
                println!("index did not exist");
            }
        }
        IndexCommand::Stats => {
            let stats = index.stats()?;
            println!("documents: {}", stats.documents);
            println!("size:      {} bytes", stats.size_bytes);
        }
        IndexCommand::Ping => {
            index.ping()?;
            let exists = index.index_exists()?;
            println!(
                "{} (index {})",
                style("reachable").green(),
                if exists { "present" } else { "missing" }
            );
        }
    }
    Ok(())
}

fn print_report(report: &JobReport) {
    let status = if report.failed > 0 {
        style("completed with failures").yellow()
    } else {
        style("completed").green()
    };
    println!("{} {}", style(report.job).bold(), status);
    print!("{}", report.render());
}
