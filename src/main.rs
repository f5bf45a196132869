//! genoplate: allele-discrimination genotyping from real-time PCR exports
//!
//! Command-line driver over the library: inspect an upload, analyze it to a
//! JSON report, summarize a batch of plates or compare two runs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genoplate::batch::batch_summary;
use genoplate::compare::{compare_runs, RunInput};
use genoplate::config::AnalysisConfig;
use genoplate::output::{AnalysisReport, DatasetSummary, JsonReport};
use genoplate::{parse_path, AnalysisSession, Dataset, RoxMode};
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Allele-discrimination genotyping from qPCR instrument exports
#[derive(Parser, Debug)]
#[command(name = "genoplate")]
#[command(version)]
#[command(about = "Call SNP genotypes from CFX and QuantStudio allele-discrimination runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect format and tier, print a dataset summary
    Inspect(InspectArgs),

    /// Full pipeline: normalize, cluster, score → JSON report
    Analyze(AnalyzeArgs),

    /// Summarize several plates with cross-plate concordance
    Batch(BatchArgs),

    /// Compare endpoint statistics of two runs
    Compare(CompareArgs),
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Instrument export (.zip, .xlsx, .xls, .eds)
    file: PathBuf,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// Instrument export (.zip, .xlsx, .xls, .eds)
    file: PathBuf,

    /// YAML configuration file (clustering, ROX mode, manual labels)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output JSON file
    #[arg(short, long, default_value = "report.json")]
    output: PathBuf,

    /// Use compact JSON (no pretty-printing, smaller file size)
    #[arg(long)]
    compact: bool,

    /// Compress output with gzip (.json.gz)
    #[arg(long)]
    gzip: bool,
}

#[derive(Parser, Debug)]
struct BatchArgs {
    /// Instrument exports, one per plate
    #[arg(required = true, num_args = 1..)]
    files: Vec<PathBuf>,

    /// YAML configuration applied to every plate
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output JSON file
    #[arg(short, long, default_value = "batch.json")]
    output: PathBuf,

    /// Use compact JSON
    #[arg(long)]
    compact: bool,
}

#[derive(Parser, Debug)]
struct CompareArgs {
    /// First run
    file1: PathBuf,

    /// Second run
    file2: PathBuf,

    /// Cycle of the first run (0 = last)
    #[arg(long, default_value_t = 0)]
    cycle1: u32,

    /// Cycle of the second run (0 = last)
    #[arg(long, default_value_t = 0)]
    cycle2: u32,

    /// Force a ROX mode for both runs (ratio or raw); default per instrument
    #[arg(long)]
    rox: Option<RoxMode>,

    /// Also write the comparison to a JSON file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("genoplate v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Inspect(args) => run_inspect(args),
        Commands::Analyze(args) => run_analyze(args),
        Commands::Batch(args) => run_batch(args),
        Commands::Compare(args) => run_compare(args),
    }
}

fn load(path: &Path) -> Result<Dataset> {
    info!("Reading {}", path.display());
    let dataset = parse_path(path).with_context(|| format!("Failed to load {}", path.display()))?;
    info!(
        "{} ({}): {} wells, {} cycles, allele 2 = {}",
        dataset.instrument,
        dataset.shape,
        dataset.wells.len(),
        dataset.cycles.len(),
        dataset.allele2_dye
    );
    Ok(dataset)
}

fn load_config(path: Option<&PathBuf>) -> Result<AnalysisConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration: {}", path.display());
            AnalysisConfig::from_yaml(path)
        }
        None => Ok(AnalysisConfig::default()),
    }
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let dataset = load(&args.file)?;
    let summary = DatasetSummary::from_dataset(&dataset);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("File:          {}", args.file.display());
    println!("Instrument:    {}", summary.instrument);
    println!("Shape:         {}", summary.shape);
    if let Some(tier) = summary.tier {
        println!("Tier:          {}", tier);
    }
    println!("Allele 2 dye:  {}", summary.allele2_dye);
    println!("Wells:         {}", summary.n_wells);
    match (summary.first_cycle, summary.last_cycle) {
        (Some(first), Some(last)) => println!("Cycles:        {} ({}-{})", summary.n_cycles, first, last),
        _ => println!("Cycles:        0"),
    }
    println!("ROX:           {} (default mode: {})", summary.has_rox, summary.default_rox_mode);
    if summary.has_ntc_identification {
        let wells: Vec<String> = summary.ntc_wells.iter().map(|w| w.to_string()).collect();
        println!("NTC wells:     {}", wells.join(", "));
    } else {
        println!("NTC wells:     not identified by the export");
    }
    for window in &summary.data_windows {
        println!("Window:        {} {}-{}", window.name, window.start_cycle, window.end_cycle);
    }
    for step in &summary.protocol_steps {
        println!(
            "Step {}:        {:.1} °C, {} s, x{} {}",
            step.step, step.temperature, step.duration_sec, step.cycles, step.label
        );
    }
    Ok(())
}

/// Write a report, honouring --gzip and --compact.
fn write_output<R: JsonReport>(report: &R, output: &Path, compact: bool, gzip: bool) -> Result<PathBuf> {
    // Auto-detect gzip from output extension
    let is_gz = output.extension().map(|e| e == "gz").unwrap_or(false);
    if gzip || is_gz {
        let output_path = if is_gz {
            output.to_path_buf()
        } else {
            output.with_extension("json.gz")
        };
        report.save_gzip(&output_path, compact)?;
        info!("Gzipped report saved to: {}", output_path.display());
        Ok(output_path)
    } else if compact {
        report.save_compact(output)?;
        info!("Compact report saved to: {}", output.display());
        Ok(output.to_path_buf())
    } else {
        report.save(output)?;
        info!("Report saved to: {}", output.display());
        Ok(output.to_path_buf())
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    let dataset = load(&args.file)?;

    let mut session = AnalysisSession::from_config(dataset, source_name(&args.file), &config)?;
    session.run_clustering().context("Clustering failed")?;
    let report = AnalysisReport::build(&session).context("Failed to build report")?;

    if let Some(advisory) = &report.qc.cross_talk {
        warn!("{}", advisory.message);
    }
    if let Some(suggested) = report.suggested_cycle {
        if suggested != report.cycle {
            info!("Suggested display cycle: {} (analyzed cycle {})", suggested, report.cycle);
        }
    }

    write_output(&report, &args.output, args.compact, args.gzip)?;

    info!(
        "Done! {} wells, call rate {:.1}%, mean quality {:.1}",
        report.qc.n_total,
        report.qc.call_rate * 100.0,
        report.quality_summary.mean_score
    );
    Ok(())
}

fn run_batch(args: BatchArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;

    let mut sessions = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let dataset = load(file)?;
        let mut session = AnalysisSession::from_config(dataset, source_name(file), &config)?;
        session
            .run_clustering()
            .with_context(|| format!("Clustering failed for {}", file.display()))?;
        sessions.push(session);
    }

    let summary = batch_summary(&sessions);
    write_output(&summary, &args.output, args.compact, false)?;

    match summary.concordance.percentage {
        Some(pct) => info!(
            "Done! {} plates, concordance {:.1}% over {} shared wells",
            summary.plates.len(),
            pct,
            summary.concordance.total_compared
        ),
        None => info!("Done! {} plates, no shared wells to compare", summary.plates.len()),
    }
    Ok(())
}

fn run_compare(args: CompareArgs) -> Result<()> {
    let run1 = load(&args.file1)?;
    let run2 = load(&args.file2)?;
    let source1 = source_name(&args.file1);
    let source2 = source_name(&args.file2);

    let comparison = compare_runs(
        RunInput {
            dataset: &run1,
            source: &source1,
            cycle: args.cycle1,
        },
        RunInput {
            dataset: &run2,
            source: &source2,
            cycle: args.cycle2,
        },
        args.rox,
    )
    .context("Comparison failed")?;

    println!("{}", serde_json::to_string_pretty(&comparison)?);
    if let Some(output) = &args.output {
        write_output(&comparison, output, false, false)?;
    }
    Ok(())
}
