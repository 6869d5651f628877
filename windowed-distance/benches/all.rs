use bencher::{benchmark_group, benchmark_main, Bencher};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use windowed_distance::{
    Builder, DenseVectors, Filter, LayerRange, SearchParams, Space,
};

benchmark_main!(benches);
benchmark_group!(benches, build_index, search_windowed);

const SEED: u64 = 123456789;

fn store(n: usize, dim: usize) -> DenseVectors {
    let mut rng = StdRng::seed_from_u64(SEED);
    DenseVectors::from_rows(
        dim,
        (0..n).map(|_| (0..dim).map(|_| rng.gen::<f32>()).collect()),
    )
}

fn build_index(bench: &mut Bencher) {
    let store = store(1024, 16);
    bench.iter(|| {
        Builder::default()
            .out_degree(16)
            .window_top(5)
            .window_base(4)
            .seed(SEED)
            .build(store.clone(), Space::L2)
            .unwrap()
    })
}

fn search_windowed(bench: &mut Bencher) {
    let (graph, _) = Builder::default()
        .out_degree(16)
        .window_top(5)
        .window_base(4)
        .seed(SEED)
        .build(store(1024, 16), Space::L2)
        .unwrap();
    let mut rng = StdRng::seed_from_u64(SEED + 1);
    let query: Vec<f32> = (0..16).map(|_| rng.gen()).collect();
    let params = SearchParams {
        dynamic_layers: true,
        ef: 100,
        k: 10,
        layers: LayerRange { lower: 0, upper: 0 },
    };
    bench.iter(|| graph.search(&query, Filter::new(128, 639), &params))
}
