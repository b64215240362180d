//! Train the road-matching CRF.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::Device;
use clap::Parser;
use roadmatch_trainer::{load_road_embeddings, load_trajectories, RoadGraph, TrainConfig, Trainer};
use tracing::info;

/// CLI arguments
#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train the road-matching CRF on labelled trajectories")]
#[command(version)]
struct Cli {
    /// Training trajectories (JSON Lines)
    #[arg(long)]
    train: PathBuf,

    /// Evaluation trajectories (JSON Lines)
    #[arg(long)]
    eval: Option<PathBuf>,

    /// Road embedding table (safetensors, `road_emb`)
    #[arg(long)]
    road_emb: PathBuf,

    /// Road graph (JSON)
    #[arg(long)]
    road_graph: PathBuf,

    /// Where to write the best weights
    #[arg(long, default_value = "models/roadcrf.safetensors")]
    checkpoint: PathBuf,

    /// JSON training configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    /// Weight decay
    #[arg(long)]
    wd: Option<f64>,

    /// Negative tags sampled per step
    #[arg(long)]
    neg_nums: Option<usize>,

    /// Decode with a beam of this width instead of exhaustively
    #[arg(long)]
    beam_size: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,
}

impl Cli {
    fn train_config(&self) -> anyhow::Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => TrainConfig::default(),
        };
        if let Some(batch_size) = self.batch_size {
            config = config.with_batch_size(batch_size);
        }
        if let Some(epochs) = self.epochs {
            config = config.with_epochs(epochs);
        }
        if let Some(lr) = self.lr {
            config = config.with_lr(lr);
        }
        if let Some(wd) = self.wd {
            config = config.with_weight_decay(wd);
        }
        if let Some(neg_nums) = self.neg_nums {
            config = config.with_neg_nums(neg_nums);
        }
        if self.beam_size.is_some() {
            config = config.with_beam_size(self.beam_size);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        Ok(config)
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.train_config()?;
    let device = Device::Cpu;

    let embeddings = load_road_embeddings(&cli.road_emb, &device)?;
    let adjacency = RoadGraph::load(&cli.road_graph)?.adjacency(&device)?;
    let train = load_trajectories(&cli.train)?;
    let eval = match &cli.eval {
        Some(path) => load_trajectories(path)?,
        None => Vec::new(),
    };
    info!(
        train = train.len(),
        eval = eval.len(),
        "Loaded trajectories"
    );

    let mut trainer = Trainer::new(config, embeddings, adjacency, device)?;
    let summary = trainer.train(&train, &eval, Some(cli.checkpoint.as_path()))?;

    match (&summary.best, summary.best_epoch) {
        (Some(best), Some(epoch)) => info!("best epoch {}: {}", epoch, best),
        _ => info!(loss = summary.final_loss, "training finished"),
    }
    println!(
        "{}",
        serde_json::to_string(&summary).context("failed to serialize summary")?
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Training failed: {:#}", e);
        std::process::exit(1);
    }
}
