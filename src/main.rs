use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tinfoil_measure::attestation::ProvenanceKind;
use tinfoil_measure::{LoadedConfig, Pipeline, Result, RunOptions};

/// Compute and publish the measurements of a Tinfoil CVM deployment
#[derive(Parser, Debug)]
#[command(name = "tinfoil-measure", version)]
struct Cli {
    /// Deployment config (also hashed into the kernel command line)
    #[arg(long, default_value = "/config.yml")]
    config: PathBuf,

    /// Download cache, reused across runs
    #[arg(long, default_value = "/cache")]
    cache_dir: PathBuf,

    /// Where tinfoil-deployment.json and release.md are written
    #[arg(long, default_value = "/output")]
    output_dir: PathBuf,

    /// tdx-measure executable
    #[arg(long, default_value = "/app/tdx-measure")]
    tdx_measure: PathBuf,

    /// GitHub CLI executable
    #[arg(long, default_value = "gh")]
    gh: PathBuf,

    /// Base URL of the attestation index
    #[arg(long, default_value = "https://api.github.com")]
    attestation_index: String,

    /// Provenance back-end for every lineage, overriding the lineage default
    #[arg(long, value_enum)]
    provenance: Option<ProvenanceArg>,

    /// PEM bundle of trusted Fulcio certificates; required for index provenance
    #[arg(long)]
    fulcio_roots: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProvenanceArg {
    LocalTool,
    Index,
}

impl From<ProvenanceArg> for ProvenanceKind {
    fn from(value: ProvenanceArg) -> Self {
        match value {
            ProvenanceArg::LocalTool => ProvenanceKind::LocalTool,
            ProvenanceArg::Index => ProvenanceKind::Index,
        }
    }
}

impl From<Cli> for RunOptions {
    fn from(cli: Cli) -> Self {
        Self {
            config_path: cli.config,
            cache_dir: cli.cache_dir,
            output_dir: cli.output_dir,
            tdx_measure: cli.tdx_measure,
            gh: cli.gh,
            attestation_index: cli.attestation_index,
            provenance: cli.provenance.map(Into::into),
            fulcio_roots: cli.fulcio_roots,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let options = RunOptions::from(Cli::parse());
    if let Err(e) = run(&options).await {
        error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(options: &RunOptions) -> Result<()> {
    let config = LoadedConfig::load(&options.config_path)?;
    let pipeline = Pipeline::new(options, config)?;

    let descriptor = pipeline.run().await?;
    let path = descriptor.write(&options.output_dir)?;

    info!(
        path = %path.display(),
        snp = %descriptor.snp_measurement(),
        "measurements published"
    );
    Ok(())
}
