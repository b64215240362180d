//! Data loading for map-matching training runs.
//!
//! - trajectories: JSON Lines, one `{"emissions": [[f32; num_tags]; len], "tags": [u32; len]}` per line
//! - road embeddings: a safetensors file holding a `road_emb` tensor of shape `[num_roads, emb_dim]`
//! - road graph: JSON `{"num_roads": n, "edges": [[a, b], ...]}`

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use oorandom::Rand32;
use roadmatch_core::Adjacency;
use serde::{Deserialize, Serialize};

/// Tensor name of the road embedding table inside a safetensors file.
pub const ROAD_EMB_KEY: &str = "road_emb";

/// A single trajectory: per-step emission scores and the gold road segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub emissions: Vec<Vec<f32>>,
    pub tags: Vec<u32>,
}

impl Trajectory {
    pub fn new(emissions: Vec<Vec<f32>>, tags: Vec<u32>) -> Self {
        Self { emissions, tags }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Check the trajectory against a road network of `num_tags` segments.
    pub fn validate(&self, num_tags: usize) -> anyhow::Result<()> {
        if self.is_empty() {
            bail!("empty trajectory");
        }
        if self.emissions.len() != self.tags.len() {
            bail!(
                "{} emission rows for {} tags",
                self.emissions.len(),
                self.tags.len()
            );
        }
        if let Some((step, row)) = self
            .emissions
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != num_tags)
        {
            bail!(
                "emission row {} has {} scores, expected {}",
                step,
                row.len(),
                num_tags
            );
        }
        if let Some(&tag) = self.tags.iter().find(|&&t| t as usize >= num_tags) {
            bail!("tag {} out of range for {} roads", tag, num_tags);
        }
        Ok(())
    }
}

/// Load trajectories from a JSON Lines file. Blank lines and `#` comments are skipped.
pub fn load_trajectories<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Trajectory>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut trajectories = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let trajectory: Trajectory = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid trajectory", path.display(), lineno + 1))?;
        trajectories.push(trajectory);
    }

    Ok(trajectories)
}

/// Load the road embedding table as `f32`.
pub fn load_road_embeddings<P: AsRef<Path>>(path: P, device: &Device) -> anyhow::Result<Tensor> {
    let path = path.as_ref();
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let road_emb = tensors.remove(ROAD_EMB_KEY).with_context(|| {
        format!("{} has no `{}` tensor", path.display(), ROAD_EMB_KEY)
    })?;
    road_emb.dims2().context("road embeddings must be two-dimensional")?;
    Ok(road_emb.to_dtype(DType::F32)?)
}

/// Undirected road network as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadGraph {
    pub num_roads: usize,
    pub edges: Vec<(u32, u32)>,
}

impl RoadGraph {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse road graph {}", path.display()))
    }

    pub fn adjacency(&self, device: &Device) -> anyhow::Result<Adjacency> {
        Ok(Adjacency::from_edges(self.num_roads, &self.edges, device)?)
    }
}

/// A padded, batch-first mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, max_len, num_tags]`
    pub emissions: Tensor,
    /// `[batch, max_len]`, `u32`, zero past each length
    pub tags: Tensor,
    /// `[batch, max_len]`, `u8`
    pub mask: Tensor,
    pub lengths: Vec<usize>,
    /// Unpadded gold tags, for accuracy.
    pub targets: Vec<Vec<u32>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }
}

/// Pad `trajectories` to the longest one and stack them.
pub fn collate(
    trajectories: &[&Trajectory],
    num_tags: usize,
    device: &Device,
) -> anyhow::Result<Batch> {
    if trajectories.is_empty() {
        bail!("cannot collate an empty batch");
    }
    for (i, trajectory) in trajectories.iter().enumerate() {
        trajectory
            .validate(num_tags)
            .with_context(|| format!("trajectory {} of batch", i))?;
    }

    let batch_size = trajectories.len();
    let max_len = trajectories.iter().map(|t| t.len()).max().unwrap_or(0);

    let mut emissions = vec![0f32; batch_size * max_len * num_tags];
    let mut tags = vec![0u32; batch_size * max_len];
    let mut mask = vec![0u8; batch_size * max_len];

    for (b, trajectory) in trajectories.iter().enumerate() {
        for (t, (row, &tag)) in trajectory.emissions.iter().zip(&trajectory.tags).enumerate() {
            let offset = (b * max_len + t) * num_tags;
            emissions[offset..offset + num_tags].copy_from_slice(row);
            tags[b * max_len + t] = tag;
            mask[b * max_len + t] = 1;
        }
    }

    Ok(Batch {
        emissions: Tensor::from_vec(emissions, (batch_size, max_len, num_tags), device)?,
        tags: Tensor::from_vec(tags, (batch_size, max_len), device)?,
        mask: Tensor::from_vec(mask, (batch_size, max_len), device)?,
        lengths: trajectories.iter().map(|t| t.len()).collect(),
        targets: trajectories.iter().map(|t| t.tags.clone()).collect(),
    })
}

/// Fisher-Yates shuffle of `0..len`.
pub fn shuffled_indices(len: usize, rng: &mut Rand32) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    for i in (1..len).rev() {
        let j = rng.rand_range(0..(i as u32 + 1)) as usize;
        indices.swap(i, j);
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn trajectory(len: usize, num_tags: usize, tag: u32) -> Trajectory {
        Trajectory::new(vec![vec![0.5; num_tags]; len], vec![tag; len])
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("roadmatch-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_validate() {
        assert!(trajectory(3, 4, 1).validate(4).is_ok());
        assert!(trajectory(3, 4, 4).validate(4).is_err());
        assert!(trajectory(3, 5, 1).validate(4).is_err());
        assert!(trajectory(0, 4, 1).validate(4).is_err());
        let ragged = Trajectory::new(vec![vec![0.0; 4]; 2], vec![0; 3]);
        assert!(ragged.validate(4).is_err());
    }

    #[test]
    fn test_collate_pads() {
        let dev = Device::Cpu;
        let long = trajectory(3, 2, 1);
        let short = trajectory(1, 2, 0);
        let batch = collate(&[&long, &short], 2, &dev).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.emissions.dims3().unwrap(), (2, 3, 2));
        assert_eq!(batch.lengths, vec![3, 1]);
        assert_eq!(
            batch.mask.to_vec2::<u8>().unwrap(),
            vec![vec![1, 1, 1], vec![1, 0, 0]]
        );
        assert_eq!(
            batch.tags.to_vec2::<u32>().unwrap(),
            vec![vec![1, 1, 1], vec![0, 0, 0]]
        );
        let emissions = batch.emissions.to_vec3::<f32>().unwrap();
        assert_eq!(emissions[1][0], vec![0.5, 0.5]);
        assert_eq!(emissions[1][2], vec![0.0, 0.0]);
        assert_eq!(batch.targets[1], vec![0]);
    }

    #[test]
    fn test_collate_rejects_bad_input() {
        let dev = Device::Cpu;
        assert!(collate(&[], 2, &dev).is_err());
        let bad = trajectory(2, 3, 0);
        assert!(collate(&[&bad], 2, &dev).is_err());
    }

    #[test]
    fn test_shuffle_is_permutation() {
        let mut rng = Rand32::new(3);
        let mut indices = shuffled_indices(50, &mut rng);
        let again = shuffled_indices(50, &mut Rand32::new(3));
        assert_eq!(indices, again);
        indices.sort_unstable();
        assert_eq!(indices, (0..50).collect::<Vec<_>>());
        assert!(shuffled_indices(0, &mut rng).is_empty());
    }

    #[test]
    fn test_load_trajectories() {
        let path = temp_path("trajectories.jsonl");
        std::fs::write(
            &path,
            "# header\n{\"emissions\": [[0.1, 0.9]], \"tags\": [1]}\n\n\
             {\"emissions\": [[1.0, 0.0], [0.0, 1.0]], \"tags\": [0, 1]}\n",
        )
        .unwrap();

        let trajectories = load_trajectories(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(trajectories.len(), 2);
        assert_eq!(trajectories[0].tags, vec![1]);
        assert_eq!(trajectories[1].len(), 2);
    }

    #[test]
    fn test_load_trajectories_reports_line() {
        let path = temp_path("broken.jsonl");
        std::fs::write(&path, "{\"emissions\": [[0.1]], \"tags\": [0]}\nnot json\n").unwrap();
        let err = load_trajectories(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(format!("{:#}", err).contains(":2:"));
    }

    #[test]
    fn test_road_graph() {
        let path = temp_path("graph.json");
        std::fs::write(&path, r#"{"num_roads": 3, "edges": [[0, 1], [1, 2]]}"#).unwrap();
        let graph = RoadGraph::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let adjacency = graph.adjacency(&Device::Cpu).unwrap();
        assert_eq!(adjacency.num_tags(), 3);
        assert!(adjacency.is_adjacent(1, 0));
        assert!(!adjacency.is_adjacent(0, 2));
    }

    #[test]
    fn test_load_road_embeddings() {
        let dev = Device::Cpu;
        let path = temp_path("road_emb.safetensors");
        let table = Tensor::arange(0f32, 6.0, &dev).unwrap().reshape((3, 2)).unwrap();
        let tensors: HashMap<String, Tensor> =
            [(ROAD_EMB_KEY.to_string(), table)].into_iter().collect();
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let loaded = load_road_embeddings(&path, &dev).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.dims2().unwrap(), (3, 2));
        assert_eq!(loaded.to_vec2::<f32>().unwrap()[2], vec![4.0, 5.0]);
    }
}
