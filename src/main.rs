use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use activation_flow::{
    ActivationFlow, Config, FeatureMatrix, LabelId, LabelVector, PropagationStatus,
    observability::Telemetry,
};

/// 特徴行列とシードを JSON で受け取り、拡散結果を標準出力へ書き出す。
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input document: {"features": [[f32]], "seeds": [[row, label]]}
    #[arg(long, env = "ACTIVATION_FLOW_INPUT")]
    input: PathBuf,

    /// Neighbor count (overrides ACTIVATION_FLOW_K)
    #[arg(long)]
    k: Option<usize>,

    /// Diffusion rounds (overrides ACTIVATION_FLOW_ITERATIONS)
    #[arg(long)]
    iterations: Option<usize>,

    /// RNG seed for the approximate neighbor search
    #[arg(long)]
    seed: Option<u64>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Deserialize)]
struct Input {
    features: Vec<Vec<f32>>,
    #[serde(default)]
    seeds: Vec<(usize, LabelId)>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::new().context("failed to initialize telemetry")?;

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(k) = cli.k {
        config = config.with_k(k).context("invalid --k")?;
    }
    if let Some(iterations) = cli.iterations {
        config = config.with_iterations(iterations);
    }
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
    }

    let file = File::open(&cli.input)
        .with_context(|| format!("failed to open {}", cli.input.display()))?;
    let input: Input = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse {}", cli.input.display()))?;

    let features = FeatureMatrix::from_rows(input.features).context("invalid feature matrix")?;
    let seed = LabelVector::from_sparse(features.n_points(), &input.seeds)
        .context("invalid seed markers")?;

    info!(
        points = features.n_points(),
        features = features.n_features(),
        markers = seed.labeled_count(),
        k = config.k(),
        iterations = config.iterations(),
        "starting activation flow"
    );

    let flow = ActivationFlow::fit_with_metrics(&features, &config, Some(telemetry.metrics_handle()))
        .context("failed to build neighbor graph")?;
    if let Some(warning) = &flow.build_report().warning {
        warn!(%warning, "neighbor graph quality warning");
    }

    let propagation = flow.classify(&seed).context("label diffusion failed")?;
    if propagation.status == PropagationStatus::NothingToPropagate {
        warn!("no seed markers supplied; labels were not propagated");
    }

    let output = if cli.pretty {
        serde_json::to_string_pretty(&propagation)?
    } else {
        serde_json::to_string(&propagation)?
    };
    println!("{output}");
    Ok(())
}
