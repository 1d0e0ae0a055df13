use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kubefix::config::RunConfig;
use kubefix::controller::RunContext;
use kubefix::detection::load_detections;
use kubefix::patch::Patch;
use kubefix::report::{write_json, RunSummary};
use kubefix::verify::VerificationResult;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "kubefix",
    version,
    about = "Propose and certify JSON Patch remediations for Kubernetes manifests"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate, verify and retry patches for a batch of detections.
    Remediate(RemediateArgs),
    /// Run an existing patch file through the guard, semantic check and gates.
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
struct RemediateArgs {
    #[arg(long)]
    detections: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    jobs: Option<usize>,
    /// Accepted patches; stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    results_out: Option<PathBuf>,
    #[arg(long)]
    metrics_out: Option<PathBuf>,
    #[arg(long)]
    include_errors: bool,
    #[arg(long)]
    enable_rescan: bool,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    #[arg(long)]
    detections: PathBuf,
    #[arg(long)]
    patches: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Verification results; stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    include_errors: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Remediate(args) => run_remediate(args),
        Commands::Verify(args) => run_verify(args),
    }
}

fn run_remediate(args: RemediateArgs) -> Result<()> {
    let mut config = RunConfig::load_or_default(args.config.as_deref())?;
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }
    if args.enable_rescan {
        config.verifier.enable_rescan = true;
    }
    let detections = load_detections(&args.detections)?;
    let ctx = RunContext::from_config(config)?;
    let outcomes = ctx.run_batch(&detections)?;

    let accepted: Vec<&Patch> = outcomes
        .iter()
        .filter(|o| o.accepted())
        .filter_map(|o| o.patch.as_ref())
        .collect();
    let results: Vec<VerificationResult> = outcomes
        .iter()
        .map(|o| present(o.result.clone(), args.include_errors))
        .collect();
    let summary = RunSummary::from_outcomes(&ctx.run_id, &outcomes);

    emit(args.out.as_deref(), &accepted)?;
    if let Some(path) = &args.results_out {
        write_json(path, &results)?;
    }
    if let Some(path) = &args.metrics_out {
        write_json(path, &summary)?;
    }
    tracing::info!(
        run_id = %ctx.run_id,
        total = summary.total,
        accepted = summary.accepted,
        rate = %format!("{:.1}%", summary.acceptance_rate * 100.0),
        "run complete"
    );
    Ok(())
}

fn run_verify(args: VerifyArgs) -> Result<()> {
    let config = RunConfig::load_or_default(args.config.as_deref())?;
    let detections = load_detections(&args.detections)?;
    let patches = load_patches(&args.patches)?;
    let ctx = RunContext::from_config(config)?;
    let results: Vec<VerificationResult> = ctx
        .verify_patches(&detections, &patches)?
        .into_iter()
        .map(|r| present(r, args.include_errors))
        .collect();
    let accepted = results.iter().filter(|r| r.accepted).count();
    emit(args.out.as_deref(), &results)?;
    tracing::info!(total = results.len(), accepted, "verification complete");
    Ok(())
}

fn present(result: VerificationResult, include_errors: bool) -> VerificationResult {
    if include_errors {
        result
    } else {
        result.without_errors()
    }
}

fn load_patches(path: &Path) -> Result<Vec<Patch>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read patches from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Patches file {} is not a JSON array of patches", path.display()))
}

fn emit<T: Serialize + ?Sized>(path: Option<&Path>, value: &T) -> Result<()> {
    match path {
        Some(path) => write_json(path, value),
        None => {
            let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
            println!("{}", json);
            Ok(())
        }
    }
}
