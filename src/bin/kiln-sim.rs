//! Replay a job trace against the reference scheduler, or compare two replays.
//!
//! # Usage
//!
//! ```sh
//! kiln-sim simulate --trace trace.json --hosts hosts.json --config sim.toml --output out.csv
//! kiln-sim compare baseline.csv candidate.csv
//! ```
//!
//! `trace.json` is a JSON array of jobs sorted by `submit_time_ms`; `hosts.json` is a
//! JSON array of hosts. `compare` exits with status 1 when the traces differ.

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use kiln::sim::Host;
use kiln::sim::Job;
use kiln::sim::SimConfig;
use kiln::testing::ReplayRig;
use serde_json::from_str;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kiln-sim")]
#[command(about = "Deterministic replay harness for batch schedulers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a trace and write the resulting task rows.
    Simulate(SimulateArgs),

    /// Check two trace files for relative scheduling equivalence.
    Compare(CompareArgs),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// JSON array of jobs, sorted by submit time.
    #[arg(long)]
    trace: PathBuf,

    /// JSON array of hosts.
    #[arg(long)]
    hosts: PathBuf,

    /// TOML simulation config.
    #[arg(long, env = "KILN_CONFIG")]
    config: Option<PathBuf>,

    /// Override `cycle_step_ms` from the config.
    #[arg(long)]
    cycle_step_ms: Option<u64>,

    /// Override the reclamation sampling seed from the config.
    #[arg(long)]
    seed: Option<u64>,

    /// Where to write the final rows.
    #[arg(long)]
    output: PathBuf,

    /// Append finished rows here while the replay runs.
    #[arg(long)]
    incremental_output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CompareArgs {
    /// Baseline trace file.
    baseline: PathBuf,

    /// Trace file to check against the baseline.
    candidate: PathBuf,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {what} from {}", path.display()))?;
    from_str(&text).with_context(|| format!("failed to parse {what} in {}", path.display()))
}

fn build_config(args: &SimulateArgs) -> Result<SimConfig> {
    let mut config = match &args.config {
        Some(path) => SimConfig::load(path).context("failed to load simulation config")?,
        None => SimConfig::default(),
    };
    if let Some(step) = args.cycle_step_ms {
        config.cycle_step_ms = Some(step);
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    Ok(config)
}

async fn simulate(args: SimulateArgs) -> Result<ExitCode> {
    let config = build_config(&args)?;
    let trace: Vec<Job> = load_json(&args.trace, "trace")?;
    let hosts: Vec<Host> = load_json(&args.hosts, "hosts")?;
    info!(jobs = trace.len(), hosts = hosts.len(), "loaded inputs");

    let records = ReplayRig::new(&config)
        .run(&hosts, trace, &config, args.incremental_output.as_deref())
        .await
        .context("replay failed")?;

    let rows = kiln::sim::to_rows(&records);
    kiln::sim::write_rows(&args.output, &rows).context("failed to write output")?;
    info!(rows = rows.len(), output = %args.output.display(), "replay written");
    Ok(ExitCode::SUCCESS)
}

fn compare(args: CompareArgs) -> Result<ExitCode> {
    let baseline = kiln::sim::read_rows(&args.baseline).context("failed to read baseline")?;
    let candidate = kiln::sim::read_rows(&args.candidate).context("failed to read candidate")?;
    let comparison = kiln::sim::equivalent(&baseline, &candidate);

    if comparison.is_equivalent() {
        println!("equivalent ({} rows vs {} rows)", baseline.len(), candidate.len());
        return Ok(ExitCode::SUCCESS);
    }
    for diff in &comparison.diffs {
        println!("{diff}");
    }
    println!("{} difference(s)", comparison.diffs.len());
    Ok(ExitCode::FAILURE)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Simulate(args) => simulate(args).await,
        Command::Compare(args) => compare(args),
    }
}
