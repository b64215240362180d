use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use oorandom::Rand32;
use roadmatch_core::{Adjacency, CrfConfig, RoadCrf};

const NUM_TAGS: usize = 512;
const EMB_DIM: usize = 32;
const BATCH: usize = 8;
const SEQ_LEN: usize = 24;

/// A grid-like road graph: every segment touches its next two neighbours.
fn road_graph(dev: &Device) -> Adjacency {
    let edges: Vec<(u32, u32)> = (0..NUM_TAGS as u32)
        .flat_map(|t| [(t, (t + 1) % NUM_TAGS as u32), (t, (t + 2) % NUM_TAGS as u32)])
        .collect();
    Adjacency::from_edges(NUM_TAGS, &edges, dev).unwrap()
}

fn bench_crf(c: &mut Criterion) {
    let dev = Device::Cpu;
    let adjacency = road_graph(&dev);
    let embeddings = Tensor::randn(0f32, 1.0, (NUM_TAGS, EMB_DIM), &dev).unwrap();
    let emissions = Tensor::randn(0f32, 1.0, (BATCH, SEQ_LEN, NUM_TAGS), &dev).unwrap();
    let tags = Tensor::zeros((BATCH, SEQ_LEN), DType::U32, &dev).unwrap();
    let mask = Tensor::ones((BATCH, SEQ_LEN), DType::U8, &dev).unwrap();

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let config = CrfConfig::new(NUM_TAGS, EMB_DIM).with_neg_nums(64);
    let exhaustive = RoadCrf::new(config.clone(), vb.clone()).unwrap();
    let beam = RoadCrf::new(config.with_beam(5), vb).unwrap();

    c.bench_function("log_likelihood_512_tags", |b| {
        let mut rng = Rand32::new(17);
        b.iter(|| {
            exhaustive
                .log_likelihood(
                    black_box(&emissions),
                    &tags,
                    &embeddings,
                    &adjacency,
                    &mask,
                    &mut rng,
                )
                .unwrap()
        });
    });

    c.bench_function("viterbi_exhaustive_512_tags", |b| {
        b.iter(|| {
            exhaustive
                .decode(black_box(&emissions), &embeddings, &adjacency, &mask)
                .unwrap()
        });
    });

    c.bench_function("viterbi_beam5_512_tags", |b| {
        b.iter(|| {
            beam.decode(black_box(&emissions), &embeddings, &adjacency, &mask)
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_crf);
criterion_main!(benches);
