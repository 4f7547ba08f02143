//! CLI entry point for scandl.

use std::env;
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scandl_core::cancel::{self, CancelSource, CtrlCSource, KeySequenceSource};
use scandl_core::checkpoint::Checkpoint;
use scandl_core::download::{DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES};
use scandl_core::pipeline::{Input, Pipeline, PipelineConfig, RunReport, load_item_list};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

mod app_config;
mod cli;

use app_config::{FileConfig, split_list};
use cli::Args;

/// Line typed on stdin that stops the run.
const STOP_SEQUENCE: &str = "q";

/// Exit status of an interrupted run.
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let (args, resume) = expand_resume(args)?;

    init_tracing(&args);
    debug!(?args, "CLI arguments parsed");

    // the stdin reader thread cannot be cancelled, so the runtime must not
    // wait for it on shutdown
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(run(args, resume));
    runtime.shutdown_background();
    result
}

async fn run(args: Args, resume: Option<PathBuf>) -> Result<ExitCode> {
    let loaded = app_config::load_default_file_config()?;
    if let (Some(path), Some(_)) = (&loaded.path, &loaded.config) {
        debug!(path = %path.display(), "loaded config file");
    }
    let file = loaded.config.unwrap_or_default();

    let Some(input) = build_input(&args)? else {
        info!("Nothing to do. Pass --start, an id set, --items or --resume.");
        info!("Example: scandl --start 100 --end 200 --metadata-url 'https://api.example.com/items/{{id}}'");
        return Ok(ExitCode::SUCCESS);
    };
    let config = merge_config(&args, &file, resume);
    info!(output = %config.output_dir.display(), concurrency = config.concurrency, "scandl starting");

    let cancel = CancellationToken::new();
    let mut sources: Vec<Arc<dyn CancelSource>> = vec![Arc::new(CtrlCSource)];
    if std::io::stdin().is_terminal() {
        info!("Press Ctrl-C or type '{STOP_SEQUENCE}' and Enter to stop");
        sources.push(Arc::new(KeySequenceSource::new(
            tokio::io::stdin(),
            STOP_SEQUENCE,
        )));
    }
    let watcher = cancel::watch(sources, cancel.clone());

    let result = Pipeline::new(input, config, cancel.clone()).run().await;
    watcher.abort();
    let report = result?;

    info!(
        scanned = report.scanned,
        downloaded = report.downloaded,
        existed = report.already_existed,
        skipped = report.skipped,
        not_found = report.not_found,
        failed = report.failed_ids.len(),
        outstanding = report.outstanding,
        sidecars = report.sidecars,
        "Run complete"
    );
    Ok(ExitCode::from(exit_status(&report)))
}

fn exit_status(report: &RunReport) -> u8 {
    if report.interrupted {
        EXIT_INTERRUPTED
    } else if report.is_clean() {
        0
    } else {
        error!("run finished with unfinished or failed items");
        1
    }
}

/// Replaces `--resume FILE` with the checkpoint's tokens and re-parses.
///
/// Checkpoint tokens come first so options given on the command line win.
fn expand_resume(args: Args) -> Result<(Args, Option<PathBuf>)> {
    let Some(path) = args.resume.clone() else {
        return Ok((args, None));
    };
    let checkpoint = Checkpoint::read(&path)
        .with_context(|| format!("Failed to read checkpoint '{}'", path.display()))?;
    let argv = resume_argv(env::args_os(), &checkpoint);
    let resumed = Args::try_parse_from(argv).unwrap_or_else(|e| e.exit());
    Ok((resumed, Some(path)))
}

fn resume_argv(original: impl IntoIterator<Item = OsString>, checkpoint: &Checkpoint) -> Vec<OsString> {
    let mut original = original.into_iter();
    let mut argv: Vec<OsString> = original.next().into_iter().collect();
    argv.extend(checkpoint.tokens().into_iter().map(OsString::from));
    while let Some(arg) = original.next() {
        if arg == "--resume" {
            original.next();
            continue;
        }
        if arg.to_str().is_some_and(|a| a.starts_with("--resume=")) {
            continue;
        }
        argv.push(arg);
    }
    argv
}

fn build_input(args: &Args) -> Result<Option<Input>> {
    if let Some(path) = &args.items {
        let items = load_item_list(path)?;
        info!(items = items.len(), path = %path.display(), "loaded item list");
        return Ok(Some(Input::Items(items)));
    }
    if let Some(ids) = &args.id_set {
        let ids = match args.end {
            Some(end) => ids.0.iter().copied().filter(|id| *id <= end).collect(),
            None => ids.0.clone(),
        };
        return Ok(Some(Input::Ids(ids)));
    }
    Ok(args.start.map(|start| Input::Range {
        start,
        end: args.end,
    }))
}

/// CLI values override file values, which override built-in defaults.
fn merge_config(args: &Args, file: &FileConfig, resume: Option<PathBuf>) -> PipelineConfig {
    let defaults = PipelineConfig::default();
    PipelineConfig {
        output_dir: args
            .output
            .clone()
            .or_else(|| file.output_dir.clone())
            .unwrap_or(defaults.output_dir),
        concurrency: args
            .concurrency
            .or(file.concurrency)
            .map_or(DEFAULT_CONCURRENCY, usize::from),
        quality: args.quality.or(file.quality).unwrap_or(defaults.quality),
        lookahead: args.lookahead,
        excluded_tags: args
            .exclude_tags
            .as_deref()
            .map(split_list)
            .or_else(|| file.excluded_tags.clone())
            .unwrap_or_default(),
        required_tags: args
            .require_tags
            .as_deref()
            .map(split_list)
            .unwrap_or_default(),
        throttle_kbps: args.throttle.or(file.throttle_kbps).unwrap_or(0.0),
        throttle_auto: args.throttle_auto || file.throttle_auto.unwrap_or(false),
        predict_gaps: args.predict_gaps,
        audit_gaps: args.audit_gaps,
        gap_table: file.gap_table.clone().unwrap_or_default(),
        keep_unfinished: args.keep_unfinished,
        checkpoint: args
            .checkpoint
            .clone()
            .or(resume)
            .or_else(|| file.checkpoint.clone()),
        sidecar: args.sidecar || file.sidecar.unwrap_or(false),
        metadata_url: args
            .metadata_url
            .clone()
            .or_else(|| file.metadata_url.clone()),
        max_retries: args
            .max_retries
            .or(file.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES),
    }
}

fn init_tracing(args: &Args) {
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

    let ansi = use_color(
        args.no_color,
        env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty()),
        env::var("TERM").ok().as_deref(),
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .init();
}

fn use_color(no_color_flag: bool, no_color_env: bool, term: Option<&str>) -> bool {
    !no_color_flag && !no_color_env && term != Some("dumb")
}
