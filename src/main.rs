use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use history_enrich::base_table::scan_pending;
use history_enrich::coverage::analyze_coverage;
use history_enrich::error::{require_input, PipelineError};
use history_enrich::fetcher::{FetchConfig, FetchReport, Fetcher, StopSignal};
use history_enrich::lookup::{SpotifyCredentials, SpotifyEndpoints, SpotifySession};
use history_enrich::merge::{merge, ExternalSource};
use history_enrich::metadata_log::MetadataLog;
use history_enrich::models::{write_stats_json, Columns, FetchStats, MergeStats, DEFAULT_ARTIST_COLUMN, DEFAULT_TRACK_COLUMN};
use history_enrich::normalize::parse_key_arg;
use history_enrich::progress::{format_duration, set_log_only};
use history_enrich::progress_store::ProgressStore;
use history_enrich::skip_set::{build_skip_set, SkipSet, SkipSetConfig, DEFAULT_CHUNK_SIZE};
use history_enrich::split::{sibling_path, split_media_types};

#[derive(Parser)]
#[command(name = "history-enrich")]
#[command(about = "Incrementally enrich a listening history with track metadata")]
struct Cli {
    /// Log-only mode: no progress bars, periodic log lines instead (for tail -f)
    #[arg(long, global = true)]
    log_only: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Look up every key not yet processed or externally enriched
    Fetch(FetchArgs),
    /// Join the base table with the metadata log
    Merge(MergeArgs),
    /// Fetch, then merge
    Run(RunArgs),
    /// Report enrichment coverage of a merged output
    Coverage(CoverageArgs),
    /// Remove keys from the progress store so they are looked up again
    Forget(ForgetArgs),
    /// Split a merged output into songs-only and podcasts-only tables
    Split(SplitArgs),
}

#[derive(Args)]
struct ColumnArgs {
    #[arg(long, default_value = DEFAULT_TRACK_COLUMN)]
    track_column: String,

    #[arg(long, default_value = DEFAULT_ARTIST_COLUMN)]
    artist_column: String,
}

impl ColumnArgs {
    fn to_columns(&self) -> Columns {
        Columns {
            track: self.track_column.clone(),
            artist: self.artist_column.clone(),
        }
    }
}

#[derive(Args)]
struct ExternalArgs {
    /// Pre-enriched dataset: fetch skips its keys, merge joins its columns
    #[arg(long)]
    external: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_TRACK_COLUMN)]
    external_track_column: String,

    #[arg(long, default_value = DEFAULT_ARTIST_COLUMN)]
    external_artist_column: String,

    /// Column whose non-empty value proves a row was enriched
    #[arg(long, default_value = "track_id")]
    strong_signal: String,

    /// Fallback signal, used only when the strong column does not exist
    #[arg(long, default_value = "popularity")]
    weak_signal: String,

    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

impl ExternalArgs {
    fn config(&self) -> SkipSetConfig {
        SkipSetConfig {
            track_column: self.external_track_column.clone(),
            artist_column: self.external_artist_column.clone(),
            strong_signal: self.strong_signal.clone(),
            weak_signal: self.weak_signal.clone(),
            chunk_size: self.chunk_size,
        }
    }

    fn load(&self) -> Result<SkipSet> {
        let Some(path) = &self.external else {
            info!("No external dataset configured; nothing skipped");
            return Ok(SkipSet::empty());
        };
        build_skip_set(path, &self.config())
    }

    /// The dataset as a merge source, when configured.
    fn source(&self) -> Option<ExternalSource> {
        self.external
            .as_ref()
            .map(|path| ExternalSource::new(path, self.config()))
    }
}

#[derive(Args)]
struct FetchArgs {
    /// Base listening history (CSV)
    #[arg(long)]
    base: PathBuf,

    #[arg(long, default_value = "data/enriched/metadata_log.csv")]
    metadata_log: PathBuf,

    #[arg(long, default_value = "data/enriched/progress.sqlite3")]
    progress_db: PathBuf,

    #[command(flatten)]
    columns: ColumnArgs,

    #[command(flatten)]
    external: ExternalArgs,

    #[arg(long, default_value_t = 50)]
    batch_size: usize,

    /// Pause between lookups (ms)
    #[arg(long, default_value_t = 300)]
    request_delay_ms: u64,

    /// Pause between batches (ms)
    #[arg(long, default_value_t = 5000)]
    batch_delay_ms: u64,

    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Stop after this many keys (for testing)
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long, env = "SPOTIFY_CLIENT_ID", hide_env_values = true)]
    client_id: Option<String>,

    #[arg(long, env = "SPOTIFY_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    #[arg(long, hide = true)]
    api_base: Option<String>,

    #[arg(long, hide = true)]
    accounts_base: Option<String>,

    /// Write fetch stats as JSON
    #[arg(long)]
    stats_json: Option<PathBuf>,
}

impl FetchArgs {
    fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            batch_size: self.batch_size,
            request_delay: Duration::from_millis(self.request_delay_ms),
            batch_delay: Duration::from_millis(self.batch_delay_ms),
            max_attempts: self.max_attempts,
            ..Default::default()
        }
    }

    fn credentials(&self) -> Result<SpotifyCredentials> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Ok(SpotifyCredentials {
                client_id: id.clone(),
                client_secret: secret.clone(),
            }),
            _ => Err(PipelineError::Authentication(
                "SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET must be set".to_string(),
            )
            .into()),
        }
    }

    fn endpoints(&self) -> SpotifyEndpoints {
        let mut endpoints = SpotifyEndpoints::default();
        if let Some(api) = &self.api_base {
            endpoints.api_base = api.clone();
        }
        if let Some(accounts) = &self.accounts_base {
            endpoints.accounts_base = accounts.clone();
        }
        endpoints
    }
}

#[derive(Args)]
struct MergeArgs {
    #[arg(long)]
    base: PathBuf,

    #[arg(long, default_value = "data/enriched/metadata_log.csv")]
    metadata_log: PathBuf,

    #[arg(long)]
    output: PathBuf,

    #[command(flatten)]
    columns: ColumnArgs,

    #[command(flatten)]
    external: ExternalArgs,

    /// Write merge stats as JSON
    #[arg(long)]
    stats_json: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    fetch: FetchArgs,

    #[arg(long)]
    output: PathBuf,

    /// Join the external dataset's columns into the output as well
    #[arg(long)]
    join_external: bool,

    #[arg(long)]
    merge_stats_json: Option<PathBuf>,
}

#[derive(Args)]
struct CoverageArgs {
    /// Merged output to analyze
    #[arg(long)]
    enriched: PathBuf,

    #[command(flatten)]
    columns: ColumnArgs,

    #[command(flatten)]
    external: ExternalArgs,

    /// Include per-status progress store counts
    #[arg(long)]
    progress_db: Option<PathBuf>,

    #[arg(long)]
    json: Option<PathBuf>,
}

#[derive(Args)]
struct ForgetArgs {
    #[arg(long, default_value = "data/enriched/progress.sqlite3")]
    progress_db: PathBuf,

    /// Key to forget, as "track::artist" (repeatable)
    #[arg(long, required_unless_present = "unresolved")]
    key: Vec<String>,

    /// Forget every entry recorded without metadata
    #[arg(long)]
    unresolved: bool,
}

#[derive(Args)]
struct SplitArgs {
    /// Merged output to split
    #[arg(long)]
    input: PathBuf,

    /// Songs-only output (default: <input stem>_songs.csv)
    #[arg(long)]
    songs: Option<PathBuf>,

    /// Podcasts-only output (default: <input stem>_podcasts.csv)
    #[arg(long)]
    podcasts: Option<PathBuf>,

    #[arg(long)]
    stats_json: Option<PathBuf>,
}

// ============================================================================
// Stages
// ============================================================================

fn fetch_stage(args: &FetchArgs, stop: &StopSignal) -> Result<FetchReport> {
    require_input(&args.base)?;
    let columns = args.columns.to_columns();

    let skip = args.external.load()?;
    let mut store = ProgressStore::open(&args.progress_db)?;
    let processed = store.load_all_keys()?;
    let work = scan_pending(&args.base, &columns, &skip, &processed)?;

    let mut stats = FetchStats::default();
    work.fill_stats(&mut stats);
    let mut pending = work.pending;
    if let Some(limit) = args.limit {
        pending.truncate(limit);
        stats.pending = pending.len();
    }

    let mut log = MetadataLog::open(&args.metadata_log)?;
    let report = if pending.is_empty() {
        info!("Nothing to fetch");
        FetchReport {
            stats,
            interrupted: false,
        }
    } else {
        let mut session = SpotifySession::connect(args.credentials()?, args.endpoints())?;
        Fetcher::new(&mut session, args.fetch_config(), stop.clone()).run(&pending, &mut store, &mut log, stats)?
    };

    print_fetch_summary(&report, &args.metadata_log, &args.progress_db);
    if let Some(path) = &args.stats_json {
        write_stats_json(&report.stats, path)?;
    }
    Ok(report)
}

fn merge_stage(
    base: &Path,
    metadata_log: &Path,
    output: &Path,
    columns: &Columns,
    external: Option<&ExternalSource>,
    stats_json: Option<&Path>,
) -> Result<MergeStats> {
    info!("Merging {} with {}", base.display(), metadata_log.display());
    let stats = merge(base, metadata_log, output, columns, external)?;

    println!("\n{:=<60}", "");
    println!("Merge complete!");
    println!("  Base rows:          {}", stats.base_rows);
    println!("  Metadata rows:      {}", stats.metadata_rows);
    println!("  Unique metadata:    {} ({} duplicates dropped)", stats.metadata_keys, stats.duplicates_dropped);
    println!("  Matched rows:       {}", stats.matched_rows);
    if stats.torn_log_rows > 0 {
        println!("  Torn log rows:      {} (skipped)", stats.torn_log_rows);
    }
    if let Some(source) = external {
        println!("  External:           {}", source.path.display());
        println!("  External keys:      {} ({} rows)", stats.external_keys, stats.external_rows);
        println!("  External matched:   {}", stats.external_matched_rows);
    }
    println!("  Output rows:        {}", stats.output_rows);
    println!("  Output:             {}", output.display());
    println!("  Elapsed:            {}", format_duration(Duration::from_secs_f64(stats.elapsed_seconds)));
    println!("{:=<60}", "");

    if let Some(path) = stats_json {
        write_stats_json(&stats, path)?;
    }
    Ok(stats)
}

fn coverage_stage(args: &CoverageArgs) -> Result<()> {
    let skip = match &args.external.external {
        Some(_) => Some(args.external.load()?),
        None => None,
    };
    let mut report = analyze_coverage(&args.enriched, &args.columns.to_columns(), skip.as_ref())?;
    if let Some(db) = &args.progress_db {
        require_input(db)?;
        report.progress = Some(ProgressStore::open(db)?.counts()?);
    }

    println!("\n{:=<60}", "");
    println!("Enrichment coverage: {}", args.enriched.display());
    println!("  Rows:               {}", report.total_rows);
    println!("  Rows enriched:      {} ({:.1}%)", report.enriched_rows, report.row_pct);
    println!("  Unique tracks:      {}", report.unique_keys);
    println!("  Tracks enriched:    {} ({:.1}%)", report.enriched_keys, report.key_pct);
    if let Some(external) = &report.external {
        println!("  External tracks:    {}", external.keys);
        println!("  Overlap:            {}", external.overlap);
        println!("  Combined:           {} ({:.1}%)", external.combined_keys, external.combined_pct);
    }
    println!("  Still missing:      {}", report.remaining_keys);
    if let Some(counts) = &report.progress {
        println!(
            "  Progress store:     {} found, {} not found, {} failed",
            counts.found, counts.not_found, counts.failed
        );
    }
    println!("{:=<60}", "");

    if let Some(path) = &args.json {
        write_stats_json(&report, path)?;
    }
    Ok(())
}

fn split_stage(args: &SplitArgs) -> Result<()> {
    let songs = args
        .songs
        .clone()
        .unwrap_or_else(|| sibling_path(&args.input, "songs"));
    let podcasts = args
        .podcasts
        .clone()
        .unwrap_or_else(|| sibling_path(&args.input, "podcasts"));
    let stats = split_media_types(&args.input, &songs, &podcasts)?;

    println!("\n{:=<60}", "");
    println!("Split complete!");
    println!("  Rows:               {}", stats.rows);
    println!("  Songs:              {} -> {}", stats.songs, songs.display());
    println!("  Podcasts:           {} -> {}", stats.podcasts, podcasts.display());
    println!("{:=<60}", "");

    if let Some(path) = &args.stats_json {
        write_stats_json(&stats, path)?;
    }
    Ok(())
}

fn forget_stage(args: &ForgetArgs) -> Result<()> {
    require_input(&args.progress_db)?;
    let mut store = ProgressStore::open(&args.progress_db)?;

    if args.unresolved {
        let removed = store.forget_unresolved()?;
        info!("Forgot {} unresolved entries", removed);
    }
    if !args.key.is_empty() {
        let mut keys = Vec::with_capacity(args.key.len());
        for raw in &args.key {
            match parse_key_arg(raw) {
                Some(key) => keys.push(key),
                None => bail!("Invalid key '{}': expected \"track::artist\"", raw),
            }
        }
        let removed = store.forget(&keys)?;
        if removed < keys.len() {
            warn!("{} of {} keys had no progress entry", keys.len() - removed, keys.len());
        }
        info!("Forgot {} keys", removed);
    }
    Ok(())
}

fn print_fetch_summary(report: &FetchReport, log: &Path, store: &Path) {
    let stats = &report.stats;
    println!("\n{:=<60}", "");
    if report.interrupted {
        println!("Fetch interrupted: state saved, rerun to resume");
    } else {
        println!("Fetch complete!");
    }
    println!("  Unique keys:        {}", stats.unique_keys);
    println!("  Skipped (external): {}", stats.skipped_external);
    println!("  Skipped (done):     {}", stats.skipped_processed);
    println!("  Pending:            {}", stats.pending);
    println!("  Attempted:          {}", stats.attempted);
    println!("  Found:              {} ({:.1}%)", stats.found, stats.hit_rate());
    println!("  Not found:          {}", stats.not_found);
    println!("  Failed:             {}", stats.failed);
    println!("  Retries:            {}", stats.retries);
    println!("  Persisted:          {} log rows, {} progress rows", stats.log_rows_written, stats.progress_rows_written);
    println!("  Metadata log:       {}", log.display());
    println!("  Progress store:     {}", store.display());
    println!("  Elapsed:            {}", format_duration(Duration::from_secs_f64(stats.elapsed_seconds)));
    println!("{:=<60}", "");
}

// ============================================================================
// Entry Point
// ============================================================================

fn install_interrupt_handler() -> Result<StopSignal> {
    let stop = StopSignal::new();
    let handler = stop.clone();
    ctrlc::set_handler(move || {
        if handler.is_stopped() {
            std::process::exit(130);
        }
        warn!("Interrupt received: finishing the current lookup and saving progress (press again to force quit)");
        handler.stop();
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(stop)
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Fetch(args) => {
            let stop = install_interrupt_handler()?;
            fetch_stage(&args, &stop)?;
        }
        Command::Merge(args) => {
            merge_stage(
                &args.base,
                &args.metadata_log,
                &args.output,
                &args.columns.to_columns(),
                args.external.source().as_ref(),
                args.stats_json.as_deref(),
            )?;
        }
        Command::Run(args) => {
            let stop = install_interrupt_handler()?;
            let report = fetch_stage(&args.fetch, &stop)?;
            if report.interrupted {
                info!("Merging what has been fetched so far");
            }
            let external = if args.join_external {
                args.fetch.external.source()
            } else {
                None
            };
            merge_stage(
                &args.fetch.base,
                &args.fetch.metadata_log,
                &args.output,
                &args.fetch.columns.to_columns(),
                external.as_ref(),
                args.merge_stats_json.as_deref(),
            )?;
        }
        Command::Coverage(args) => coverage_stage(&args)?,
        Command::Forget(args) => forget_stage(&args)?,
        Command::Split(args) => split_stage(&args)?,
    }
    Ok(())
}

/// Exit status per failure class: 2 authentication, 3 input, 4 merge
/// correctness, 1 anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::Authentication(_)) => 2,
        Some(PipelineError::MissingInput { .. })
        | Some(PipelineError::MissingColumn { .. })
        | Some(PipelineError::MalformedInput { .. }) => 3,
        Some(PipelineError::MergeCardinality { .. }) | Some(PipelineError::DuplicateMergeKey { .. }) => 4,
        None => 1,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if let Err(e) = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
    {
        eprintln!("Failed to initialise logging: {}", e);
    }

    set_log_only(cli.log_only);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}
