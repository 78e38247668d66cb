use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use echosync::{AlignInput, Aligner, AlignerConfig, recalc_shifts_index};

#[derive(Parser, Debug)]
#[command(name = "echosync", version)]
#[command(about = "Line up several recordings of the same event")]
struct Cli {
    /// TOML file overriding the default parameters
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Worker threads (defaults to every core)
    #[arg(long, short = 'j', global = true)]
    jobs: Option<i64>,

    /// Fingerprint accuracy, 1 (fastest) to 4 (most thorough)
    #[arg(long, global = true, value_parser = clap::value_parser!(u8).range(1..=4))]
    accuracy: Option<u8>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fingerprint files or directories into a store
    Fingerprint {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Store to extend (.json, .db or .sqlite); loaded first if it exists
        #[arg(long)]
        db: PathBuf,
    },
    /// Match one file against a store
    Recognize {
        file: PathBuf,
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        filter_matches: Option<f64>,
        /// Seconds within which supporting hashes must fall
        #[arg(long)]
        locality: Option<f64>,
        #[arg(long)]
        max_lags: Option<f64>,
    },
    /// Align a directory or a list of files with each other
    Align {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// fingerprints, correlation or visual
        #[arg(long, short, default_value = "fingerprints")]
        technique: String,
        /// Where to write shifted copies and the mixdown
        #[arg(long, short)]
        destination: Option<PathBuf>,
        /// Resolve with this hypothesis rank instead of the best one
        #[arg(long, default_value_t = 0)]
        match_index: usize,
    },
    /// Align files to one target
    TargetAlign {
        target: PathBuf,
        #[arg(required = true)]
        against: Vec<PathBuf>,
        /// Only match the target from this many seconds in
        #[arg(long)]
        start: Option<f64>,
        /// Only match the target up to this many seconds in
        #[arg(long)]
        end: Option<f64>,
        #[arg(long, short, default_value = "fingerprints")]
        technique: String,
        #[arg(long, short)]
        destination: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AlignerConfig::from_toml_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => AlignerConfig::default(),
    };
    if cli.jobs.is_some() {
        config.num_processors = cli.jobs;
    }
    if cli.accuracy.is_some() {
        config.accuracy = cli.accuracy;
    }

    match cli.command {
        Command::Fingerprint { paths, db } => {
            let mut aligner = Aligner::new(config);
            if db.exists() {
                aligner
                    .load_fingerprints(&db)
                    .with_context(|| format!("loading {}", db.display()))?;
            }
            let (dirs, files): (Vec<PathBuf>, Vec<PathBuf>) =
                paths.into_iter().partition(|p| p.is_dir());
            let mut reports = Vec::new();
            for dir in &dirs {
                reports.push(aligner.fingerprint_directory(dir)?);
            }
            if !files.is_empty() {
                reports.push(aligner.fingerprint_files(&files)?);
            }
            aligner.save_fingerprints(&db)?;
            info!(
                files = aligner.store().len(),
                fingerprints = aligner.store().total_fingerprints(),
                "store updated"
            );
            print_json(&reports)
        }
        Command::Recognize {
            file,
            db,
            filter_matches,
            locality,
            max_lags,
        } => {
            let mut aligner = Aligner::new(config);
            aligner
                .load_fingerprints(&db)
                .with_context(|| format!("loading {}", db.display()))?;
            let mut options = aligner.config().recognize.clone();
            options.filter_matches = filter_matches.or(options.filter_matches);
            options.locality = locality.or(options.locality);
            options.max_lags = max_lags.or(options.max_lags);
            let result = aligner.recognize(&file, &options)?;
            if result.is_none() {
                warn!(file = %file.display(), "no match found");
            }
            print_json(&result)
        }
        Command::Align {
            inputs,
            technique,
            destination,
            match_index,
        } => {
            let aligner = Aligner::new(config);
            let input = to_input(inputs)?;
            let write_now = destination.as_deref().filter(|_| match_index == 0);
            let mut result = aligner.align(input, &technique, write_now)?;
            if match_index > 0 {
                result = recalc_shifts_index(&result, match_index);
                if let Some(dest) = &destination {
                    result.written = aligner.write_alignment(&result, dest)?;
                }
            }
            print_json(&result)
        }
        Command::TargetAlign {
            target,
            against,
            start,
            end,
            technique,
            destination,
        } => {
            let aligner = Aligner::new(config);
            let input = to_input(against)?;
            let start_end = (start.is_some() || end.is_some())
                .then(|| (start.unwrap_or(0.0), end.unwrap_or(-1.0)));
            let result = aligner.target_align(
                &target,
                start_end,
                input,
                &technique,
                destination.as_deref(),
            )?;
            print_json(&result)
        }
    }
}

/// A single directory is scanned; anything else is taken as a file list.
fn to_input(mut paths: Vec<PathBuf>) -> anyhow::Result<AlignInput> {
    if paths.len() == 1 && paths[0].is_dir() {
        return Ok(AlignInput::Directory(paths.remove(0)));
    }
    if let Some(dir) = paths.iter().find(|p| p.is_dir()) {
        bail!("{} is a directory; pass one directory or a list of files", dir.display());
    }
    Ok(AlignInput::Files(paths))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
