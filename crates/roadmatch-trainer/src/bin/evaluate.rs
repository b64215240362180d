//! Evaluate a trained road-matching CRF.

use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use roadmatch_core::DecodeStrategy;
use roadmatch_trainer::{
    load_crf_config, load_road_embeddings, load_trajectories, RoadGraph, TrainConfig, Trainer,
};

/// CLI arguments
#[derive(Parser)]
#[command(name = "evaluate")]
#[command(about = "Report acc(T), acc(G) and acc(LCS) of a trained model")]
#[command(version)]
struct Cli {
    /// Test trajectories (JSON Lines)
    #[arg(long)]
    data: PathBuf,

    /// Road embedding table (safetensors, `road_emb`)
    #[arg(long)]
    road_emb: PathBuf,

    /// Road graph (JSON)
    #[arg(long)]
    road_graph: PathBuf,

    /// Weights written by `train`
    #[arg(long, default_value = "models/roadcrf.safetensors")]
    checkpoint: PathBuf,

    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    /// Decode with a beam of this width instead of the saved strategy
    #[arg(long)]
    beam_size: Option<usize>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut crf_config = load_crf_config(&cli.checkpoint)?;
    if let Some(width) = cli.beam_size {
        crf_config = crf_config.with_decode_strategy(DecodeStrategy::Beam { width });
    }

    let embeddings = load_road_embeddings(&cli.road_emb, &device)?;
    let adjacency = RoadGraph::load(&cli.road_graph)?.adjacency(&device)?;
    let data = load_trajectories(&cli.data)?;

    let mut config = TrainConfig::new();
    config.eval_batch_size = cli.batch_size.max(1);
    let mut trainer = Trainer::with_crf_config(config, crf_config, embeddings, adjacency, device)?;
    trainer.load_checkpoint(&cli.checkpoint)?;

    let report = trainer.evaluate(&data)?;
    if cli.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!("testset: {}", report);
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Evaluation failed: {:#}", e);
        std::process::exit(1);
    }
}
