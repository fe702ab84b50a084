mod config;

use anyhow::{Context, Result};
use clap::Parser;
use gccheck::options::{HELP_TEXT, parse_xcheck_argument};
use gccheck::{
    CheckCycle, CheckEngine, CheckOptions, HeapImage, Invocation, OptionError, OptionOutcome, Reporter, ScanFlags,
    TextReporter, fix_dead_objects, parse_options,
};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "gccheck", version, about = "Verify a GC heap image")]
struct Cli {
    /// Heap image (JSON)
    image: PathBuf,

    /// Check options, e.g. `heap:all:verbose` or `-Xcheck:gc:heap`
    #[arg(long, short)]
    options: Option<String>,

    /// Rewrite unmarked objects as holes before checking
    #[arg(long)]
    fix_dead_objects: bool,

    /// Config file; defaults to the nearest gccheck.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the report here instead of stderr
    #[arg(long)]
    output: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose { "gccheck=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .init();

    let config = config::load_config(cli.config.as_deref())?;
    let text = cli.options.or(config.options).unwrap_or_default();
    let parsed = parse_option_text(&text).inspect_err(|err| {
        if err.wants_help() {
            eprintln!("{HELP_TEXT}");
        }
    });
    let Some(mut options) = parsed? else {
        println!("{HELP_TEXT}");
        return Ok(ExitCode::SUCCESS);
    };
    if options.max_errors.is_none() {
        options.max_errors = config.max_errors;
    }

    let mut image =
        HeapImage::load(&cli.image).with_context(|| format!("loading {}", cli.image.display()))?;

    if cli.fix_dead_objects || config.fix_dead_objects {
        let stats = fix_dead_objects(&mut image, None)?;
        println!(
            "fixed dead objects: {} regions, {} live, {} dead, {} holes written ({} bytes)",
            stats.regions, stats.live_objects, stats.dead_objects, stats.holes_written, stats.dead_bytes
        );
    }

    let reporter: Box<dyn Reporter> = match &cli.output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            Box::new(TextReporter::new(BufWriter::new(file)))
        }
        None => Box::new(TextReporter::stderr()),
    };

    let mut engine = CheckEngine::new(reporter);
    let mut cycle = CheckCycle::new(options);
    // Out of process there is nothing to tear down; a requested abort
    // becomes the exit status instead.
    let summary = cycle.run(&mut engine, &image, Invocation::Manual(0), ScanFlags::all(), || {});
    drop(engine);

    println!(
        "gccheck: {} checks, {} errors ({})",
        summary.checks_run, summary.errors, summary.invoked_by
    );
    Ok(if summary.aborted {
        ExitCode::from(2)
    } else if summary.errors > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// `None` when help was requested.
fn parse_option_text(text: &str) -> Result<Option<CheckOptions>, OptionError> {
    let text = text.trim();
    let outcome = if text.starts_with("-Xcheck") {
        parse_xcheck_argument(text)?
    } else {
        parse_options(text)?
    };
    Ok(match outcome {
        OptionOutcome::Help => None,
        OptionOutcome::Options(options) => Some(options),
    })
}
