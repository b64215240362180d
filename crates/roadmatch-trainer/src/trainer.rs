//! Training loop for the road-matching CRF.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use oorandom::Rand32;
use roadmatch_core::{AccuracyReport, AccuracyTracker, Adjacency, CrfConfig, RoadCrf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TrainConfig;
use crate::data::{collate, shuffled_indices, Trajectory};

/// Outcome of [`Trainer::train`].
#[derive(Debug, Clone, Serialize)]
pub struct TrainSummary {
    pub epochs: usize,
    pub final_loss: f64,
    /// 1-based epoch with the best `acc(T)`, when an evaluation set was given.
    pub best_epoch: Option<usize>,
    pub best: Option<AccuracyReport>,
}

pub struct Trainer {
    config: TrainConfig,
    device: Device,
    varmap: VarMap,
    crf: RoadCrf,
    embeddings: Tensor,
    adjacency: Adjacency,
    rng: Rand32,
}

impl Trainer {
    /// Build a freshly initialised model for the given road network.
    ///
    /// # Arguments
    /// * `embeddings` - `[num_roads, emb_dim]` road embedding table
    /// * `adjacency` - road graph over the same `num_roads` segments
    pub fn new(
        config: TrainConfig,
        embeddings: Tensor,
        adjacency: Adjacency,
        device: Device,
    ) -> anyhow::Result<Self> {
        let (num_tags, emb_dim) = embeddings.dims2()?;
        let crf_config = config.crf_config(num_tags, emb_dim);
        Self::with_crf_config(config, crf_config, embeddings, adjacency, device)
    }

    /// Build a model from an explicit CRF configuration, e.g. one saved next to a checkpoint.
    pub fn with_crf_config(
        config: TrainConfig,
        crf_config: CrfConfig,
        embeddings: Tensor,
        adjacency: Adjacency,
        device: Device,
    ) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let crf = RoadCrf::new(crf_config, vb)?;
        let rng = Rand32::new(config.seed);

        Ok(Self {
            config,
            device,
            varmap,
            crf,
            embeddings,
            adjacency,
            rng,
        })
    }

    pub fn crf(&self) -> &RoadCrf {
        &self.crf
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    fn num_tags(&self) -> usize {
        self.crf.config().num_tags
    }

    /// Run `epochs` passes over `train`, evaluating on `eval` after each one.
    ///
    /// When `checkpoint` is set, the weights with the best `acc(T)` (or the
    /// last weights, without an evaluation set) are written there.
    pub fn train(
        &mut self,
        train: &[Trajectory],
        eval: &[Trajectory],
        checkpoint: Option<&Path>,
    ) -> anyhow::Result<TrainSummary> {
        if train.is_empty() {
            anyhow::bail!("no training trajectories");
        }
        info!(
            trajectories = train.len(),
            eval_trajectories = eval.len(),
            num_roads = self.num_tags(),
            epochs = self.config.epochs,
            "starting training"
        );

        let params = ParamsAdamW {
            lr: self.config.lr,
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(self.varmap.all_vars(), params)?;
        if eval.is_empty() && checkpoint.is_some() {
            warn!("no evaluation set, checkpointing the last epoch");
        }

        let mut summary = TrainSummary {
            epochs: self.config.epochs,
            final_loss: f64::NAN,
            best_epoch: None,
            best: None,
        };

        for epoch in 0..self.config.epochs {
            let loss = self.train_epoch(train, &mut optimizer, epoch)?;
            summary.final_loss = loss;

            if eval.is_empty() {
                info!(epoch = epoch + 1, loss, "epoch complete");
                if let Some(path) = checkpoint {
                    self.save_checkpoint(path)?;
                }
                continue;
            }

            let report = self.evaluate(eval)?;
            info!(epoch = epoch + 1, loss, "epoch complete: {}", report);

            let improved = summary.best.is_none_or(|best| report.acc_t > best.acc_t);
            if improved {
                summary.best = Some(report);
                summary.best_epoch = Some(epoch + 1);
                if let Some(path) = checkpoint {
                    self.save_checkpoint(path)?;
                }
            }
        }

        Ok(summary)
    }

    /// One pass over `train` in shuffled mini-batches. Returns the mean loss.
    pub fn train_epoch(
        &mut self,
        train: &[Trajectory],
        optimizer: &mut AdamW,
        epoch: usize,
    ) -> anyhow::Result<f64> {
        let indices = shuffled_indices(train.len(), &mut self.rng);
        let steps = indices.len().div_ceil(self.config.batch_size);

        let mut total = 0f64;
        for (step, chunk) in indices.chunks(self.config.batch_size).enumerate() {
            let trajectories: Vec<&Trajectory> = chunk.iter().map(|&i| &train[i]).collect();
            let batch = collate(&trajectories, self.num_tags(), &self.device)?;

            let llh = self.crf.log_likelihood(
                &batch.emissions,
                &batch.tags,
                &self.embeddings,
                &self.adjacency,
                &batch.mask,
                &mut self.rng,
            )?;
            let loss = llh.neg()?;
            optimizer.backward_step(&loss)?;

            let loss = f64::from(loss.to_scalar::<f32>()?);
            total += loss;
            if (step + 1) % self.config.log_every.max(1) == 0 {
                info!(
                    epoch = epoch + 1,
                    step = step + 1,
                    steps,
                    loss,
                    "training"
                );
            }
        }

        Ok(total / steps.max(1) as f64)
    }

    /// Decode `data` and compare against its gold tags.
    pub fn evaluate(&self, data: &[Trajectory]) -> anyhow::Result<AccuracyReport> {
        let mut tracker = AccuracyTracker::new();
        for chunk in data.chunks(self.config.eval_batch_size.max(1)) {
            let trajectories: Vec<&Trajectory> = chunk.iter().collect();
            let batch = collate(&trajectories, self.num_tags(), &self.device)?;
            let paths =
                self.crf
                    .decode(&batch.emissions, &self.embeddings, &self.adjacency, &batch.mask)?;
            tracker.update(&paths, &batch.targets, &batch.lengths)?;
        }
        let report = tracker.report();
        debug!(trajectories = report.trajectories, "evaluation: {}", report);
        Ok(report)
    }

    /// Write the model weights and, next to them, the CRF configuration.
    pub fn save_checkpoint(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.varmap
            .save(path)
            .with_context(|| format!("failed to save {}", path.display()))?;

        let config_path = crf_config_path(path);
        let json = serde_json::to_string_pretty(self.crf.config())?;
        std::fs::write(&config_path, json)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        info!("Model saved to {:?}", path);
        Ok(())
    }

    /// Overwrite the current weights with a saved checkpoint.
    pub fn load_checkpoint(&mut self, path: &Path) -> anyhow::Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        Ok(())
    }
}

/// Path of the CRF configuration stored alongside a checkpoint.
pub fn crf_config_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("json")
}

/// Read the CRF configuration saved next to `checkpoint`.
pub fn load_crf_config(checkpoint: &Path) -> anyhow::Result<CrfConfig> {
    let path = crf_config_path(checkpoint);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: CrfConfig = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
