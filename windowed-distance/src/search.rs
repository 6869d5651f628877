use std::time::Instant;

use ordered_float::OrderedFloat;

use crate::index::WindowGraph;
use crate::storage::VectorStore;
use crate::types::{Candidate, Filter, Label, LayerRange, RuntimeStatus};

/// Per-query knobs.
#[derive(Clone, Copy, Debug)]
pub struct SearchParams {
    /// Derive the layer range from the filter width; `layers` is ignored.
    pub dynamic_layers: bool,
    /// Beam width of the traversal.
    pub ef: usize,
    /// Number of results to return.
    pub k: usize,
    /// Layer range to traverse when `dynamic_layers` is off.
    pub layers: LayerRange,
}

/// One query's results (ascending by distance, padded with the sentinel
/// label when fewer than `k` in-range points exist) and its counters.
#[derive(Clone, Debug)]
pub struct SearchStatus {
    pub status: RuntimeStatus,
    pub results: Vec<Candidate>,
}

impl<S: VectorStore> WindowGraph<S> {
    /// Approximate `k` nearest neighbors of `query` among points whose
    /// attribute lies in `filter`.
    pub fn search(&self, query: &[f32], filter: Filter, params: &SearchParams) -> SearchStatus {
        let start = Instant::now();
        let mut status = RuntimeStatus::default();
        let sentinel = Candidate {
            distance: OrderedFloat(f32::INFINITY),
            label: self.sentinel(),
        };

        let count = self.storage.len();
        let upper = match count {
            0 => {
                return SearchStatus {
                    status,
                    results: vec![sentinel; params.k],
                }
            }
            n => filter.upper.min(Label(n as u32 - 1)),
        };
        if filter.lower > upper {
            return SearchStatus {
                status,
                results: vec![sentinel; params.k],
            };
        }
        let filter = Filter {
            lower: filter.lower,
            upper,
        };

        let layers = match params.dynamic_layers {
            true => self.decide_layer_range(filter),
            false => params.layers,
        };
        let entry = Label((filter.lower.0 + filter.upper.0) / 2);
        let mut heap = self.search_candidates::<false>(
            &[entry],
            query,
            filter,
            layers,
            params.ef,
            None,
            &mut status,
        );

        while heap.len() > params.k {
            heap.pop();
        }
        let mut results = heap.into_sorted_vec();
        results.resize(params.k.max(results.len()), sentinel);
        status.run_time = start.elapsed().as_secs_f64();
        SearchStatus { status, results }
    }

    /// Maps the filter width to the layer pair whose windows fit it best:
    /// the largest layer whose window the filter covers, plus whichever
    /// adjacent layer has the better fit ratio.
    pub fn decide_layer_range(&self, filter: Filter) -> LayerRange {
        let length = filter.width();
        let sizes = &self.window_size;
        let mut idx = sizes.partition_point(|&w| w < length);
        if idx == sizes.len() || sizes[idx] > length {
            idx = idx.saturating_sub(1);
        }

        let top = self.params.window_top;
        let range = if idx == 0 {
            LayerRange {
                lower: 0,
                upper: (idx + 1).min(top),
            }
        } else if idx == top {
            LayerRange {
                lower: idx - 1,
                upper: idx,
            }
        } else {
            let fit_below = sizes[idx - 1] as f32 / length as f32;
            let fit_above = length as f32 / sizes[idx + 1].min(self.params.max_points) as f32;
            if fit_below > fit_above {
                LayerRange {
                    lower: idx - 1,
                    upper: idx,
                }
            } else {
                LayerRange {
                    lower: idx,
                    upper: idx + 1,
                }
            }
        };
        // The traversal always starts from the densest layer; the computed
        // lower bound is kept only to pick the upper one.
        LayerRange {
            lower: 0,
            upper: range.upper,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::WindowGraph;
    use crate::order::WbTreeOrderTable;
    use crate::space::Space;
    use crate::storage::DenseVectors;
    use crate::IndexParams;

    fn graph(window_top: usize, window_base: usize, n: u32) -> WindowGraph<DenseVectors> {
        let store = DenseVectors::from_rows(2, (0..n).map(|i| vec![i as f32, 0.0]));
        let params = IndexParams {
            max_points: n as usize,
            window_top,
            out_degree: 16,
            window_base,
        };
        let order = Box::new(WbTreeOrderTable::with_seed(n as usize, 3));
        WindowGraph::assemble(store, Space::L2, params, order)
    }

    #[test]
    fn dynamic_range_starts_at_zero() {
        // The computed lower bound is always overridden down to layer 0.
        let graph = graph(3, 4, 2000);
        for width in [2u32, 7, 31, 127, 512, 1999] {
            let range = graph.decide_layer_range(Filter::new(0, width));
            assert_eq!(range.lower, 0, "width {width}");
        }
    }

    #[test]
    fn dynamic_range_covers_the_matching_layer() {
        // windows are [2, 8, 32, 128]; a filter of width w with
        // window[ℓ] ≤ w < window[ℓ+1] must see layer ℓ in the range.
        let graph = graph(3, 4, 2000);
        for (width, layer) in [(2u32, 0usize), (8, 1), (9, 1), (32, 2), (127, 2), (128, 3)] {
            let range = graph.decide_layer_range(Filter::new(0, width - 1));
            assert!(
                range.lower <= layer && layer <= range.upper,
                "width {width} expected layer {layer} inside {range:?}"
            );
        }
    }

    #[test]
    fn dynamic_range_upper_is_clamped_to_top() {
        let graph = graph(1, 2, 64);
        let range = graph.decide_layer_range(Filter::new(0, 63));
        assert!(range.upper <= 1);
    }

    #[test]
    fn tiny_filter_width_falls_back_to_bottom_layers() {
        let graph = graph(3, 4, 2000);
        let range = graph.decide_layer_range(Filter::new(5, 5));
        assert_eq!(range.lower, 0);
        assert!(range.upper >= 1);
    }

    #[test]
    fn empty_index_pads_with_sentinels() {
        let store = DenseVectors::new(2);
        let params = IndexParams {
            max_points: 0,
            window_top: 1,
            out_degree: 4,
            window_base: 2,
        };
        let order = Box::new(WbTreeOrderTable::with_seed(1, 3));
        let graph = WindowGraph::assemble(store, Space::L2, params, order);
        let out = graph.search(
            &[0.0, 0.0],
            Filter::new(0, 10),
            &SearchParams {
                dynamic_layers: true,
                ef: 10,
                k: 3,
                layers: LayerRange { lower: 0, upper: 0 },
            },
        );
        assert_eq!(out.results.len(), 3);
        assert!(out.results.iter().all(|c| c.label == graph.sentinel()));
    }

    #[test]
    fn inverted_filter_pads_with_sentinels() {
        let graph = graph(1, 2, 16);
        let out = graph.search(
            &[0.0, 0.0],
            Filter::new(12, 3),
            &SearchParams {
                dynamic_layers: true,
                ef: 10,
                k: 2,
                layers: LayerRange { lower: 0, upper: 0 },
            },
        );
        assert!(out.results.iter().all(|c| c.label == graph.sentinel()));
    }
}
