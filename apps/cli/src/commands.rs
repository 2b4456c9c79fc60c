//! CLI command definitions, routing, and tracing setup.

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use chatlake_artifacts::LocalObjectStore;
use chatlake_core::{
    CatalogRefresher, CommandJobRunner, LaneContext, LaneReport, Orchestrator, PipelineEvent,
    ProgressReporter, parse_notifications, refresher_for, run_lane,
};
use chatlake_shared::{AppConfig, LaneKind, init_config, load_config, load_config_from};
use chatlake_source::JsonlTableSource;
use chatlake_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// chatlake: conversation exports, token costs, and the pipeline behind them.
#[derive(Parser)]
#[command(
    name = "chatlake",
    version,
    about = "Normalize chat conversations, estimate token costs, and publish them to the lake.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.chatlake/chatlake.toml).
    #[arg(long, global = true, env = "CHATLAKE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the normalization lane (one row per user).
    Normalize(LaneArgs),

    /// Run the token estimation lane (one row per conversation).
    Tokens(LaneArgs),

    /// Feed a notification to the pipeline orchestrator.
    Notify(NotifyArgs),

    /// List tracked export runs and recent lane executions.
    Runs {
        /// Only show one lane.
        #[arg(long)]
        lane: Option<LaneKind>,

        /// Maximum entries per table.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
pub(crate) struct LaneArgs {
    /// Run date used in the export key (defaults to today, UTC).
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Hand the new export straight to the orchestrator.
    #[arg(long)]
    pub notify: bool,
}

#[derive(Args)]
#[command(args_conflicts_with_subcommands = true)]
pub(crate) struct NotifyArgs {
    #[command(subcommand)]
    pub action: Option<NotifyAction>,

    /// Notification JSON file, or `-` for stdin.
    pub input: Option<String>,
}

/// Notification shorthands.
#[derive(Subcommand)]
pub(crate) enum NotifyAction {
    /// An object was written to the destination store.
    Object {
        key: String,
        /// Object etag (looked up when omitted).
        #[arg(long)]
        etag: Option<String>,
    },
    /// A transform job changed state.
    Job { job_id: String, state: String },
    /// Schema discovery finished for a catalog target.
    Catalog { target: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "chatlake=info",
        1 => "chatlake=debug",
        _ => "chatlake=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Normalize(args) => {
            cmd_lane(resolve_config(config_path)?, LaneKind::Normalization, args).await
        }
        Command::Tokens(args) => cmd_lane(resolve_config(config_path)?, LaneKind::Tokens, args).await,
        Command::Notify(args) => cmd_notify(resolve_config(config_path)?, args).await,
        Command::Runs { lane, limit } => cmd_runs(resolve_config(config_path)?, lane, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn load(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Load and validate the config.
fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = load(path)?;
    config.validate()?;
    Ok(config)
}

/// Collaborators built from the config.
struct Runtime {
    config: AppConfig,
    storage: Storage,
    store: LocalObjectStore,
    jobs: CommandJobRunner,
    catalog: Box<dyn CatalogRefresher>,
}

impl Runtime {
    async fn open(config: AppConfig) -> Result<Self> {
        let storage = Storage::open(Path::new(&config.state.db_path)).await?;
        let store = LocalObjectStore::new(&config.destination.root);
        let jobs = CommandJobRunner::from_config(&config.transform);
        let catalog = refresher_for(config.catalog.endpoint.as_deref())?;
        Ok(Self {
            config,
            storage,
            store,
            jobs,
            catalog,
        })
    }

    fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(
            &self.config,
            &self.storage,
            &self.store,
            &self.jobs,
            self.catalog.as_ref(),
        )
    }

    async fn dispatch(&self, event: &PipelineEvent) -> Result<()> {
        let outcomes = self.orchestrator().handle(event).await?;
        println!("  {event}");
        for outcome in outcomes {
            println!("    {outcome}");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_lane(config: AppConfig, lane: LaneKind, args: LaneArgs) -> Result<()> {
    let run_date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    let rt = Runtime::open(config).await?;
    let source = JsonlTableSource::new(&rt.config.source.dir, rt.config.source.page_size);

    info!(%lane, %run_date, table = %rt.config.lanes.get(lane).table, "running lane");

    let ctx = LaneContext {
        config: &rt.config,
        source: &source,
        store: &rt.store,
        storage: &rt.storage,
    };
    let reporter = CliProgress::new();
    let report = run_lane(&ctx, lane, run_date, &reporter).await?;
    print_report(&report);

    if args.notify {
        println!("  Pipeline:");
        let event = PipelineEvent::ObjectCreated {
            key: report.export.key.clone(),
            etag: Some(report.export.etag.clone()),
        };
        rt.dispatch(&event).await?;
        println!();
    }

    Ok(())
}

fn print_report(report: &LaneReport) {
    let s = &report.summary;
    println!();
    println!("  {} export written", report.lane);
    println!("  Key:        {}", report.export.key);
    println!("  Rows:       {}", s.rows_written);
    println!("  Scanned:    {}", s.items_scanned);
    println!("  Malformed:  {}", s.malformed_count);
    if s.malformed_histories > 0 {
        println!("  No history: {}", s.malformed_histories);
    }
    if let Some(t) = &s.token_totals {
        println!(
            "  Tokens:     {} in / {} out",
            t.input_tokens, t.output_tokens
        );
        println!(
            "  Cost:       ${:.6} (avg ${:.6} per conversation)",
            t.total_cost_usd, t.average_cost_per_conversation
        );
    }
    println!("  Time:       {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

async fn cmd_notify(config: AppConfig, args: NotifyArgs) -> Result<()> {
    let events = match args.action {
        Some(NotifyAction::Object { key, etag }) => vec![PipelineEvent::ObjectCreated { key, etag }],
        Some(NotifyAction::Job { job_id, state }) => {
            vec![PipelineEvent::JobStateChanged { job_id, state }]
        }
        Some(NotifyAction::Catalog { target }) => vec![PipelineEvent::CatalogRefreshed { target }],
        None => {
            let input = args
                .input
                .ok_or_else(|| eyre!("expected a notification file, '-' for stdin, or a subcommand"))?;
            parse_notifications(&read_input(&input)?)?
        }
    };

    if events.is_empty() {
        println!("No actionable events in notification.");
        return Ok(());
    }

    let rt = Runtime::open(config).await?;
    for event in &events {
        rt.dispatch(event).await?;
    }
    Ok(())
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .map_err(|e| eyre!("failed to read stdin: {e}"))?;
        return Ok(text);
    }
    std::fs::read_to_string(input).map_err(|e| eyre!("failed to read '{input}': {e}"))
}

async fn cmd_runs(config: AppConfig, lane: Option<LaneKind>, limit: u32) -> Result<()> {
    let db_path = Path::new(&config.state.db_path);
    if !db_path.exists() {
        println!("No runs recorded yet ({} does not exist).", db_path.display());
        return Ok(());
    }
    let storage = Storage::open_readonly(db_path).await?;

    let runs = storage.list_lane_runs(lane, limit).await?;
    println!("Export runs:");
    if runs.is_empty() {
        println!("  (none)");
    }
    for run in &runs {
        println!(
            "  {:<20} {:<13} {}",
            run.state.as_str(),
            run.lane.as_str(),
            run.export_key
        );
        println!(
            "  {:<20} job={} updated={}",
            "",
            run.job_id.as_deref().unwrap_or("-"),
            run.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(detail) = &run.detail {
            println!("  {:<20} {detail}", "");
        }
    }

    let summaries = storage.list_run_summaries(lane, limit).await?;
    println!();
    println!("Lane executions:");
    if summaries.is_empty() {
        println!("  (none)");
    }
    for entry in &summaries {
        println!(
            "  {} {:<13} {:<9} rows={} malformed={} started={}",
            entry.run_date,
            entry.lane.as_str(),
            entry.status,
            entry.summary.rows_written,
            entry.summary.malformed_count,
            entry.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &entry.error {
            println!("    error: {error}");
        }
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = load(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    if let Err(e) = config.validate() {
        eprintln!("warning: {e}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn items_scanned(&self, count: usize) {
        self.spinner.set_message(format!("Scanning [{count} items]"));
    }

    fn done(&self, _report: &LaneReport) {
        self.spinner.finish_and_clear();
    }
}

impl Drop for CliProgress {
    fn drop(&mut self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}
