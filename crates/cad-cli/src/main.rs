use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cad_core::{ComparisonResult, ReportType, SeriesKey, DEFAULT_GROUP};
use cad_report::{
    render_comparison, CompareError, ComparisonEngine, PreviousDate, ReportAssembler,
    ReportRequest, NO_DATA,
};
use cad_storage::{
    ArtifactStore, BackoffPolicy, DocumentBackend, FileBackend, IndexLock, MetadataIndex,
    NameRegistry, LOCK_FILE,
};
use cad_sync::{SyncConfig, SyncEngine, SyncOptions};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "cad")]
#[command(about = "Cloud Advisor Digest command-line interface")]
struct Cli {
    /// Cache root; overrides CAD_CACHE_ROOT.
    #[arg(long, global = true)]
    cache_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull new advisory mail into the cache.
    Sync(SyncArgs),
    /// Render the Markdown digest for one date from the cache.
    Report(ReportArgs),
    /// Compare one report series against an earlier snapshot.
    Compare(CompareArgs),
    /// Sync, then report.
    Run(RunArgs),
    /// Drop storage units older than the given number of days.
    Prune {
        #[arg(long)]
        days: u32,
    },
    /// Inspect or edit account display names.
    #[command(subcommand)]
    Names(NamesCommand),
    /// Run the cron-driven sync loop until interrupted.
    Watch(SyncArgs),
}

#[derive(Debug, Clone, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    lookback_hours: Option<u32>,
    /// RFC 3339 window start; wins over --lookback-hours.
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    #[arg(long)]
    dry_run: bool,
    /// Re-fetch items that are already cached.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    account: Option<String>,
}

impl SyncArgs {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            lookback_hours: self.lookback_hours,
            since: self.since,
            dry_run: self.dry_run,
            force_refresh: self.force,
            account: self.account.clone(),
        }
    }
}

#[derive(Debug, Clone, Args)]
struct ReportArgs {
    /// Defaults to the most recent cached date.
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long)]
    account: Option<String>,
    #[arg(long)]
    group: Option<String>,
    #[arg(long)]
    no_compare: bool,
    /// Write the digest here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    #[command(flatten)]
    sync: SyncArgs,
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long)]
    group: Option<String>,
    #[arg(long)]
    no_compare: bool,
    #[arg(long)]
    output: Option<PathBuf>,
}

impl RunArgs {
    fn report(&self) -> ReportArgs {
        ReportArgs {
            date: self.date,
            account: self.sync.account.clone(),
            group: self.group.clone(),
            no_compare: self.no_compare,
            output: self.output.clone(),
        }
    }
}

#[derive(Debug, Clone, Args)]
struct CompareArgs {
    #[arg(long)]
    account: String,
    #[arg(long = "type", default_value = "risk")]
    report_type: ReportType,
    #[arg(long, default_value = DEFAULT_GROUP)]
    group: String,
    /// Defaults to the most recent cached date.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// `auto` or a YYYY-MM-DD date before --date.
    #[arg(long, default_value = "auto")]
    previous: PreviousDate,
    /// Print the comparison as JSON instead of Markdown.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum NamesCommand {
    List,
    /// Set a display name, replacing any extracted one.
    Set { account_id: String, name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    debug!(
        crates = ?[
            cad_core::CRATE_NAME,
            cad_storage::CRATE_NAME,
            cad_sync::CRATE_NAME,
            cad_report::CRATE_NAME,
        ],
        "cad starting"
    );
    let mut config = SyncConfig::from_env();
    if let Some(root) = cli.cache_root {
        config.cache_root = root;
    }

    match cli
        .command
        .unwrap_or_else(|| Commands::Sync(SyncArgs::default()))
    {
        Commands::Sync(args) => {
            sync(config, &args).await?;
        }
        Commands::Report(args) => {
            report(&config, &args).await?;
        }
        Commands::Compare(args) => {
            compare(&config, &args).await?;
        }
        Commands::Run(args) => {
            let engine = sync(config, &args.sync).await?;
            report(engine.config(), &args.report()).await?;
        }
        Commands::Prune { days } => {
            let _lock = lock(&config).await?;
            let store = ArtifactStore::under_cache_root(&config.cache_root);
            let removed = store.prune(days).await?;
            println!("prune complete: removed={removed} older_than_days={days}");
        }
        Commands::Names(command) => {
            names(&config, command).await?;
        }
        Commands::Watch(args) => {
            watch(config, &args).await?;
        }
    }

    Ok(())
}

async fn sync(config: SyncConfig, args: &SyncArgs) -> Result<SyncEngine> {
    let engine = SyncEngine::from_config(config)?;
    let summary = engine.run_once(&args.options()).await?;
    println!("{}", summary.headline());
    Ok(engine)
}

fn documents(config: &SyncConfig) -> Arc<dyn DocumentBackend> {
    Arc::new(FileBackend::new(config.cache_root.clone()))
}

async fn lock(config: &SyncConfig) -> Result<IndexLock> {
    Ok(IndexLock::acquire(
        config.cache_root.join(LOCK_FILE),
        config.lock_mode,
        BackoffPolicy::default(),
    )
    .await?)
}

async fn latest_cached_date(documents: &Arc<dyn DocumentBackend>) -> Result<NaiveDate> {
    let index = MetadataIndex::load(Arc::clone(documents)).await?;
    Ok(index
        .latest_date()
        .unwrap_or_else(|| Utc::now().date_naive()))
}

async fn report(config: &SyncConfig, args: &ReportArgs) -> Result<()> {
    let documents = documents(config);
    let date = match args.date {
        Some(date) => date,
        None => latest_cached_date(&documents).await?,
    };
    let assembler = ReportAssembler::new(ArtifactStore::under_cache_root(&config.cache_root), documents);
    let markdown = assembler
        .assemble(&ReportRequest {
            date,
            account: args.account.clone(),
            group: args.group.clone(),
            compare: !args.no_compare,
        })
        .await?;

    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, markdown.as_bytes())
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), %date, "digest written");
        }
        None => println!("{markdown}"),
    }
    Ok(())
}

async fn compare(config: &SyncConfig, args: &CompareArgs) -> Result<()> {
    let documents = documents(config);
    let date = match args.date {
        Some(date) => date,
        None => latest_cached_date(&documents).await?,
    };
    let series = SeriesKey::new(args.account.as_str(), args.report_type, args.group.as_str());
    let engine = ComparisonEngine::new(ArtifactStore::under_cache_root(&config.cache_root));
    let outcome = engine.compare(&series, date, args.previous).await;
    let registry = NameRegistry::load(documents).await?;
    println!(
        "{}",
        render_compare_outcome(outcome, args.json, &registry.label(&args.account))?
    );
    Ok(())
}

/// A missing snapshot on either side is an expected outcome, not a failure.
fn render_compare_outcome(
    outcome: Result<ComparisonResult, CompareError>,
    json: bool,
    account_label: &str,
) -> Result<String> {
    match outcome {
        Ok(result) if json => Ok(serde_json::to_string_pretty(&result)?),
        Ok(result) => Ok(render_comparison(&result, account_label)),
        Err(err @ (CompareError::NoPriorData { .. } | CompareError::NoData { .. })) => {
            info!(reason = %err, "nothing to compare");
            if json {
                let status = serde_json::json!({ "status": "no_data", "reason": err.to_string() });
                Ok(serde_json::to_string_pretty(&status)?)
            } else {
                Ok(format!("# {account_label}\n\n{NO_DATA}\n"))
            }
        }
        Err(err) => Err(err.into()),
    }
}

async fn names(config: &SyncConfig, command: NamesCommand) -> Result<()> {
    match command {
        NamesCommand::List => {
            let registry = NameRegistry::load(documents(config)).await?;
            for (account_id, name) in registry.entries() {
                println!("{account_id}\t{name}");
            }
        }
        NamesCommand::Set { account_id, name } => {
            if name.trim().is_empty() {
                anyhow::bail!("display name for {account_id} must not be empty");
            }
            let _lock = lock(config).await?;
            let mut registry = NameRegistry::load(documents(config)).await?;
            registry.set_manual(&account_id, &name);
            registry.commit().await?;
            println!("{}", registry.label(&account_id));
        }
    }
    Ok(())
}

async fn watch(mut config: SyncConfig, args: &SyncArgs) -> Result<()> {
    config.scheduler_enabled = true;
    let cron = config.sync_cron.clone();
    let engine = Arc::new(SyncEngine::from_config(config)?);
    let Some(mut sched) = engine.maybe_build_scheduler(args.options()).await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "watching for advisory mail");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
