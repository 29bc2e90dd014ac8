// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! rowflow CLI
//!
//! Runs a demo transform over a JSON-lines file and splits the rows into an
//! accepted file (rows that produced a value, with the outputs appended) and
//! an optional rejected file (the original rows that did not). Engine settings
//! are loaded from the settings store and can be overridden per run.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rowflow_app_core::settings::{EngineSettings, SettingsService};
use rowflow_config_fs::FsConfigStore;
use rowflow_core::{
    merged_columns, ColumnSpec, JsonLinesSink, LogProgress, OutputChannel, RowFailurePolicy,
    SplitRouter,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod input;
mod transforms;

use transforms::TransformKind;

#[derive(Parser, Debug)]
#[command(name = "rowflow", author, version, about = "Order-preserving parallel row transforms")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transform a JSON-lines file
    Run(RunArgs),
    /// Show or update the stored engine settings
    Settings(SettingsArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON-lines input file
    #[arg(long)]
    input: PathBuf,
    /// Input column the transform reads
    #[arg(long)]
    column: String,
    /// Transform to apply
    #[arg(long, value_enum, default_value_t = TransformKind::TextStats)]
    transform: TransformKind,
    /// Output file for rows that produced a value
    #[arg(long)]
    accepted: PathBuf,
    /// Output file for rows that did not; such rows are dropped when omitted
    #[arg(long)]
    rejected: Option<PathBuf>,
    /// Also write each row's key under this field
    #[arg(long)]
    key_field: Option<String>,
    /// Settings directory (defaults to the user config dir)
    #[arg(long)]
    config_dir: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Debug)]
struct SettingsArgs {
    /// Settings directory (defaults to the user config dir)
    #[arg(long)]
    config_dir: Option<PathBuf>,
    /// Start from the defaults instead of the stored settings
    #[arg(long)]
    reset: bool,
    #[command(flatten)]
    overrides: Overrides,
}

/// Settings that can be overridden on the command line.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Worker threads
    #[arg(long)]
    workers: Option<usize>,
    /// Rows per batch
    #[arg(long)]
    batch_size: Option<usize>,
    /// Batches submitted but not yet written
    #[arg(long)]
    max_in_flight: Option<usize>,
    /// Rows between progress reports
    #[arg(long)]
    progress_interval: Option<u64>,
    /// Distinct warnings shown per context in the summary
    #[arg(long)]
    display_cap: Option<usize>,
    /// Abort on the first failing row
    #[arg(long, conflicts_with = "deliver_empty")]
    stop_on_error: bool,
    /// Write empty outputs for failing rows and keep going
    #[arg(long)]
    deliver_empty: bool,
    /// Hide matching warnings from the summary (`FULL:`, `SUB:`, `REGEX:` or exact text)
    #[arg(long = "suppress", value_name = "PATTERN")]
    suppress: Vec<String>,
    /// Hide a whole warning context from the summary
    #[arg(long = "suppress-context", value_name = "ID")]
    suppress_context: Vec<String>,
}

impl Overrides {
    fn is_empty(&self) -> bool {
        self.workers.is_none()
            && self.batch_size.is_none()
            && self.max_in_flight.is_none()
            && self.progress_interval.is_none()
            && self.display_cap.is_none()
            && !self.stop_on_error
            && !self.deliver_empty
            && self.suppress.is_empty()
            && self.suppress_context.is_empty()
    }

    fn apply(&self, settings: &mut EngineSettings) {
        if let Some(n) = self.workers {
            settings.workers = Some(n);
        }
        if let Some(n) = self.batch_size {
            settings.batch_size = n;
        }
        if let Some(n) = self.max_in_flight {
            settings.max_in_flight = Some(n);
        }
        if let Some(n) = self.progress_interval {
            settings.progress_interval = n;
        }
        if let Some(n) = self.display_cap {
            settings.warning_display_cap = n;
        }
        if self.stop_on_error {
            settings.failure_policy = RowFailurePolicy::StopExecution;
        } else if self.deliver_empty {
            settings.failure_policy = RowFailurePolicy::DeliverEmpty;
        }
        settings.suppress_warnings.extend(self.suppress.iter().cloned());
        settings
            .suppress_contexts
            .extend(self.suppress_context.iter().cloned());
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Run(args) => run(&args),
        Command::Settings(args) => settings(&args),
    }
}

fn open_store(dir: Option<&Path>) -> Result<FsConfigStore> {
    let store = match dir {
        Some(dir) => FsConfigStore::in_dir(dir),
        None => FsConfigStore::new(),
    }
    .context("open settings store")?;
    info!(dir = %store.base().display(), "using settings store");
    Ok(store)
}

fn json_sink(
    path: Option<&Path>,
    columns: &[ColumnSpec],
    key_field: Option<&str>,
) -> Result<JsonLinesSink<Box<dyn Write>>> {
    let writer: Box<dyn Write> = match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => Box::new(io::sink()),
    };
    let sink = JsonLinesSink::new(writer, columns);
    Ok(match key_field {
        Some(field) => sink
            .with_key_field(field)
            .with_context(|| format!("key field `{field}`"))?,
        None => sink,
    })
}

fn run(args: &RunArgs) -> Result<()> {
    let service = SettingsService::new(open_store(args.config_dir.as_deref())?);
    let mut settings = service.load_or_default().context("load settings")?;
    args.overrides.apply(&mut settings);
    let mut engine = settings.build_engine().context("invalid settings")?;

    let source = input::read_jsonl(&args.input)?;
    info!(
        rows = source.len(),
        columns = source.columns().len(),
        "loaded input"
    );
    let transform = transforms::build(
        args.transform,
        source.columns(),
        &args.column,
        settings.failure_policy,
    )
    .context("set up transform")?;
    let accepted_columns = merged_columns(source.columns(), transform.output_columns(), &[])
        .context("set up outputs")?;
    let key_field = args.key_field.as_deref();
    let accepted = OutputChannel::new(
        "accepted",
        json_sink(Some(args.accepted.as_path()), &accepted_columns, key_field)?,
    );
    let rejected = OutputChannel::new(
        "rejected",
        json_sink(args.rejected.as_deref(), source.columns(), key_field)?,
    );
    let mut router = SplitRouter::new(0, accepted, rejected);

    let report = engine
        .run_single(&source, transform.as_ref(), &mut router, &LogProgress::new())
        .context("run failed")?;
    let (accepted, rejected) = router.into_channels();
    info!(
        outcome = ?report.outcome,
        workers = report.workers,
        accepted = accepted.rows_written(),
        rejected = rejected.rows_written(),
        failed = report.failed_rows,
        release_failures = report.release_failures(),
        elapsed = ?report.elapsed,
        "run complete"
    );
    if let Some(summary) = &report.warnings {
        for line in summary.lines() {
            warn!("{line}");
        }
    }
    Ok(())
}

fn settings(args: &SettingsArgs) -> Result<()> {
    let service = SettingsService::new(open_store(args.config_dir.as_deref())?);
    let mut settings = if args.reset {
        EngineSettings::default()
    } else {
        service.load_or_default().context("load settings")?
    };
    args.overrides.apply(&mut settings);
    if args.reset || !args.overrides.is_empty() {
        service.save(&settings).context("save settings")?;
        info!("settings saved");
    }
    let json = serde_json::to_string_pretty(&settings)?;
    let mut out = io::stdout().lock();
    writeln!(out, "{json}")?;
    Ok(())
}
