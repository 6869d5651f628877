//! Approximate nearest-neighbor search over vectors carrying a totally
//! ordered attribute: a query supplies a vector and a closed attribute
//! range, and gets back the `k` closest base vectors inside the range.

use thiserror::Error as ThisError;

mod build;
mod graph;
mod index;
mod order;
mod persist;
mod search;
mod space;
mod storage;
mod types;
mod visited;

pub use index::WindowGraph;
pub use order::{OrderTable, SortedVecOrderTable, WbTreeOrderTable};
pub use persist::index_file_name;
pub use search::{SearchParams, SearchStatus};
pub use space::{Space, VECTOR_ALIGN};
pub use storage::{DenseVectors, VectorStore};
pub use types::{Candidate, Filter, Label, LayerRange, RuntimeStatus};

#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    #[error("unsupported space: {0}")]
    UnknownSpace(String),
    #[error("dataset holds {points} points but the index capacity is {capacity}")]
    CapacityExceeded { points: usize, capacity: usize },
    #[error("population outgrew the window of top layer {top}")]
    LayerOverflow { top: usize },
    #[error("point {0} cannot be its own neighbor")]
    SelfEdge(Label),
    #[error("corrupt index file: {0}")]
    Corruption(String),
    #[error("failed to start builder worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parameters frozen at build time and persisted with the index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexParams {
    /// Capacity in points; also the sentinel label value.
    pub max_points: usize,
    /// Index of the top layer; layers are `0..=window_top`.
    pub window_top: usize,
    /// Per-layer out-degree cap.
    pub out_degree: usize,
    /// Base of the geometric window schedule.
    pub window_base: usize,
}

/// Parameters for building a [`WindowGraph`].
#[derive(Clone)]
pub struct Builder {
    pub(crate) capacity: Option<usize>,
    pub(crate) out_degree: usize,
    pub(crate) window_top: usize,
    pub(crate) window_base: usize,
    pub(crate) ef_construction: usize,
    pub(crate) threads: usize,
    pub(crate) seed: u64,
    pub(crate) shuffle: bool,
    #[cfg(feature = "indicatif")]
    pub(crate) progress: Option<indicatif::ProgressBar>,
}

impl Builder {
    /// Set the index capacity; defaults to the number of points built.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the per-layer out-degree cap (`M`).
    pub fn out_degree(mut self, out_degree: usize) -> Self {
        self.out_degree = out_degree;
        self
    }

    /// Set the top layer index (`W`); the index has `W + 1` layers.
    pub fn window_top(mut self, window_top: usize) -> Self {
        self.window_top = window_top;
        self
    }

    /// Set the window base (`b`): layer `ℓ` connects points within
    /// `b^ℓ` attribute ranks of each other.
    pub fn window_base(mut self, window_base: usize) -> Self {
        self.window_base = window_base;
        self
    }

    /// Set the beam width used while inserting points.
    pub fn ef_construction(mut self, ef_construction: usize) -> Self {
        self.ef_construction = ef_construction;
        self
    }

    /// Set the number of inserting workers; `0` means one per CPU.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the seed for the insertion shuffle and entry-point sampling.
    ///
    /// If this value is left unset, a seed is generated from entropy.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Whether to insert points in a random order (the default). Disable
    /// when the labels should be consumed in attribute order.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// A `ProgressBar` to track construction progress.
    #[cfg(feature = "indicatif")]
    pub fn progress(mut self, bar: indicatif::ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    /// Build a [`WindowGraph`] over the given vectors, consuming the
    /// points in a seeded random order. Also returns the averaged build
    /// counters.
    pub fn build<S: VectorStore>(
        self,
        storage: S,
        space: Space,
    ) -> Result<(WindowGraph<S>, RuntimeStatus), Error> {
        build::build(self, storage, space)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            capacity: None,
            out_degree: 16,
            window_top: 1,
            window_base: 1,
            ef_construction: 100,
            threads: 1,
            seed: rand::random(),
            shuffle: true,
            #[cfg(feature = "indicatif")]
            progress: None,
        }
    }
}
