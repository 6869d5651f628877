use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use windowed_distance::{
    index_file_name, Builder, DenseVectors, Filter, Label, LayerRange, SearchParams, Space,
    VectorStore, WindowGraph,
};

mod dataset;
mod recall;

use recall::{recall_at_k, RecallStats};

#[derive(Parser)]
#[command(about = "Build, ground-truth and sweep windowed-distance indexes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an index from a base `fvecs` file and save it.
    Build(BuildArgs),
    /// Sweep `ef` over a saved index and append recall/QPS CSV rows.
    Search(SearchArgs),
    /// Generate brute-force windowed ground truth.
    GroundTruth(GroundTruthArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// Database name, e.g. sift1m; only used for the index filename.
    #[arg(long)]
    database: String,
    /// Base vector `fvecs` path.
    #[arg(long)]
    base_vec: PathBuf,
    /// Distance space: l2, ip or cos.
    #[arg(long)]
    space: String,
    /// Directory the index file is written into.
    #[arg(long)]
    output: PathBuf,
    /// Out-degree cap per node and layer.
    #[arg(long, default_value_t = 16)]
    out_degree: usize,
    /// Window base of the layer schedule.
    #[arg(long, default_value_t = 1)]
    local_m: usize,
    /// Beam width during construction.
    #[arg(long, default_value_t = 100)]
    ef_construction: usize,
    /// Index of the top window layer.
    #[arg(long, default_value_t = 1)]
    window_top: usize,
    /// Builder workers; 0 means one per CPU.
    #[arg(long, default_value_t = 1)]
    threads: usize,
    /// Cap on the number of base vectors read.
    #[arg(long)]
    max_n: Option<usize>,
    /// Seed for the insertion shuffle.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct SearchArgs {
    /// Database name; logged only.
    #[arg(long)]
    database: String,
    /// Base vector `fvecs` path.
    #[arg(long)]
    base_vec: PathBuf,
    /// Query vector `fvecs` path.
    #[arg(long)]
    query_vec: PathBuf,
    /// Per-query window range file (`l,u` as two i32 each).
    #[arg(long)]
    query_attr: PathBuf,
    /// Ground truth path.
    #[arg(long)]
    ground_truth: PathBuf,
    /// Index file path.
    #[arg(long)]
    index: PathBuf,
    /// CSV output path (appended).
    #[arg(long)]
    output: PathBuf,
    /// Distance space: l2, ip or cos.
    #[arg(long)]
    space: String,
    /// Results per query.
    #[arg(long, default_value_t = 10)]
    k: usize,
    /// Derive the layer range from each filter's width; when off, every
    /// `[0, top]` range is swept instead.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    dynamic_layer: bool,
    /// Beam widths to sweep.
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [10, 20, 40, 60, 80, 100, 150, 200, 300, 400, 600, 800, 1000]
    )]
    ef: Vec<usize>,
    /// Cap on the number of queries per sweep point.
    #[arg(long, default_value_t = 1000)]
    queries: usize,
}

#[derive(Args)]
struct GroundTruthArgs {
    /// Base vector `fvecs` path.
    #[arg(long)]
    base_vec: PathBuf,
    /// Query vector `fvecs` path.
    #[arg(long)]
    query_vec: PathBuf,
    /// Per-query window range file.
    #[arg(long)]
    query_attr: PathBuf,
    /// Ground truth output path.
    #[arg(long)]
    output: PathBuf,
    /// Distance space: l2, ip or cos.
    #[arg(long)]
    space: String,
    /// Neighbors per query.
    #[arg(long, default_value_t = 10)]
    k: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    match Cli::parse().command {
        Command::Build(args) => run_build(args),
        Command::Search(args) => run_search(args),
        Command::GroundTruth(args) => run_ground_truth(args),
    }
}

fn run_build(args: BuildArgs) -> Result<()> {
    let space: Space = args.space.parse()?;
    let store = dataset::read_fvecs(&args.base_vec, args.max_n)?;
    let (dim, count) = (store.dim(), store.len());

    let mut builder = Builder::default()
        .out_degree(args.out_degree)
        .window_top(args.window_top)
        .window_base(args.local_m)
        .ef_construction(args.ef_construction)
        .threads(args.threads);
    if let Some(seed) = args.seed {
        builder = builder.seed(seed);
    }
    let (graph, status) = builder.build(store, space)?;
    tracing::info!(
        run_time = status.run_time,
        avg_dist = status.dist_computations,
        avg_hops = status.hops,
        avg_out_degree = status.avg_out_degree,
        "index built"
    );

    let name = index_file_name(&args.database, "fvecs", "int", dim, count, graph.params());
    graph.save(&args.output.join(name))?;
    Ok(())
}

fn run_search(args: SearchArgs) -> Result<()> {
    let space: Space = args.space.parse()?;
    let base = dataset::read_fvecs(&args.base_vec, None)?;
    let queries = dataset::read_fvecs(&args.query_vec, None)?;
    let filters = dataset::read_filters(&args.query_attr)?;
    let truth = dataset::read_ground_truth(&args.ground_truth)?;
    let graph = WindowGraph::load(&args.index, base, space)?;

    let count = queries
        .len()
        .min(filters.len())
        .min(truth.len())
        .min(args.queries);
    tracing::info!(db = %args.database, count, k = args.k, "searching");

    for &ef in &args.ef {
        if args.dynamic_layer {
            sweep(&graph, &queries, &filters, &truth, count, ef, args.k, None, &args.output)?;
        } else {
            for top in 0..=graph.params().window_top {
                let layers = LayerRange {
                    lower: 0,
                    upper: top,
                };
                sweep(
                    &graph,
                    &queries,
                    &filters,
                    &truth,
                    count,
                    ef,
                    args.k,
                    Some(layers),
                    &args.output,
                )?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn sweep(
    graph: &WindowGraph<DenseVectors>,
    queries: &DenseVectors,
    filters: &[Filter],
    truth: &[Vec<Label>],
    count: usize,
    ef: usize,
    k: usize,
    layers: Option<LayerRange>,
    output: &std::path::Path,
) -> Result<()> {
    let params = SearchParams {
        dynamic_layers: layers.is_none(),
        ef,
        k,
        layers: layers.unwrap_or(LayerRange { lower: 0, upper: 0 }),
    };
    let mut stats = RecallStats::default();
    let mut reported = params.layers;
    for i in 0..count {
        let query = queries.vector(Label(i as u32));
        let filter = filters[i];
        let out = graph.search(query, filter, &params);
        stats.step(
            out.status.run_time,
            out.status.dist_computations,
            out.status.hops,
            recall_at_k(&truth[i], k, &out.results),
        );
        if layers.is_none() && filter.lower <= filter.upper {
            reported = graph.decide_layer_range(filter);
        }
    }
    stats.dump(output, ef, reported)
}

fn run_ground_truth(args: GroundTruthArgs) -> Result<()> {
    let space: Space = args.space.parse()?;
    let base = dataset::read_fvecs(&args.base_vec, None)?;
    let queries = dataset::read_fvecs(&args.query_vec, None)?;
    let mut filters = dataset::read_filters(&args.query_attr)?;
    filters.truncate(queries.len());
    anyhow::ensure!(
        filters.len() == queries.len(),
        "{} filters for {} queries",
        filters.len(),
        queries.len()
    );

    let truth = dataset::generate_ground_truth(&base, &queries, &filters, space, args.k);
    dataset::write_ground_truth(&args.output, &truth)?;
    Ok(())
}
