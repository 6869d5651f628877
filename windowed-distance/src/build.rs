use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use ordered_float::OrderedFloat;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::index::WindowGraph;
use crate::order::WbTreeOrderTable;
use crate::space::Space;
use crate::storage::VectorStore;
use crate::types::{Candidate, Label, LayerRange, RuntimeStatus};
use crate::{Builder, Error, IndexParams};

#[derive(Default)]
pub(crate) struct BuildCounters {
    dist_computations: AtomicUsize,
    hops: AtomicUsize,
    processed: AtomicUsize,
}

impl BuildCounters {
    fn merge(&self, status: &RuntimeStatus) {
        self.dist_computations
            .fetch_add(status.dist_computations, Ordering::Relaxed);
        self.hops.fetch_add(status.hops, Ordering::Relaxed);
    }
}

pub(crate) fn build<S: VectorStore>(
    builder: Builder,
    storage: S,
    space: Space,
) -> Result<(WindowGraph<S>, RuntimeStatus), Error> {
    let capacity = builder.capacity.unwrap_or_else(|| storage.len());
    if storage.len() > capacity {
        return Err(Error::CapacityExceeded {
            points: storage.len(),
            capacity,
        });
    }
    let params = IndexParams {
        max_points: capacity,
        window_top: builder.window_top,
        out_degree: builder.out_degree,
        window_base: builder.window_base,
    };
    tracing::info!(
        max_points = params.max_points,
        window_top = params.window_top,
        out_degree = params.out_degree,
        window_base = params.window_base,
        ef_construction = builder.ef_construction,
        "building index"
    );

    let order = Box::new(WbTreeOrderTable::with_seed(
        params.max_points,
        builder.seed,
    ));
    let index = WindowGraph::assemble(storage, space, params, order);

    let count = index.storage.len();
    let mut labels: Vec<Label> = (0..count as u32).map(Label).collect();
    if builder.shuffle {
        labels.shuffle(&mut SmallRng::seed_from_u64(builder.seed));
    }

    #[cfg(feature = "indicatif")]
    if let Some(bar) = &builder.progress {
        bar.set_length(count as u64);
        bar.set_message("Building index");
    }

    let threads = match builder.threads {
        0 => num_cpus::get(),
        n => n,
    };
    let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;

    let counters = BuildCounters::default();
    let ef_construction = builder.ef_construction;
    let start = Instant::now();
    pool.install(|| {
        labels.par_iter().try_for_each(|&label| {
            index.add_point(label, ef_construction, &counters)?;
            let done = counters.processed.fetch_add(1, Ordering::Relaxed) + 1;
            if done % 1000 == 0 {
                tracing::debug!(processed = done, total = count, "insertions");
                #[cfg(feature = "indicatif")]
                if let Some(bar) = &builder.progress {
                    bar.set_position(done as u64);
                }
            }
            Ok::<(), Error>(())
        })
    })?;

    #[cfg(feature = "indicatif")]
    if let Some(bar) = &builder.progress {
        bar.finish();
    }

    let mut status = RuntimeStatus {
        run_time: start.elapsed().as_secs_f64(),
        ..RuntimeStatus::default()
    };
    if count > 0 {
        let mut total_links = 0usize;
        for layer in 0..=params.window_top {
            let layer_links: usize = (0..count)
                .map(|l| index.links.count(Label(l as u32), layer))
                .sum();
            tracing::info!(
                layer,
                avg_out_degree = layer_links as f64 / count as f64,
                "layer populated"
            );
            total_links += layer_links;
        }
        status.dist_computations = counters.dist_computations.load(Ordering::Relaxed) / count;
        status.hops = counters.hops.load(Ordering::Relaxed) / count;
        status.avg_out_degree = total_links as f64 / count as f64;
    }
    Ok((index, status))
}

impl<S: VectorStore> WindowGraph<S> {
    fn add_point(
        &self,
        label: Label,
        ef_construction: usize,
        counters: &BuildCounters,
    ) -> Result<(), Error> {
        let vector = self.storage.vector(label);
        let mut status = RuntimeStatus::default();

        let max_level = {
            let mut growth = self.growth.lock();
            let cur_num = growth.population;
            growth.population += 1;
            if cur_num == 0 {
                let _node = self.locks[label.index()].lock();
                for layer in 0..=self.params.window_top {
                    self.links.set_count(label, layer, 0);
                }
                self.order.insert(label);
                return Ok(());
            }
            if cur_num > self.window_size[growth.max_layer] {
                if growth.max_layer == self.params.window_top {
                    return Err(Error::LayerOverflow {
                        top: self.params.window_top,
                    });
                }
                let old_top = growth.max_layer;
                growth.max_layer += 1;
                tracing::info!(
                    population = cur_num,
                    top = growth.max_layer,
                    "population outgrew its window, opening a new layer"
                );
                // Every populated list at the old top seeds the new top.
                // Each label's lock is held for its copy so a concurrent
                // inserter never observes a half-copied list.
                for other in 0..self.params.max_points as u32 {
                    let other = Label(other);
                    let _node = self.locks[other.index()].lock();
                    if self.links.count(other, old_top) == 0 {
                        continue;
                    }
                    self.links.copy_layer(other, old_top, old_top + 1);
                }
            }
            growth.max_layer
        };

        let m = self.params.out_degree;
        let mut tmp_lists: Vec<Vec<Candidate>> = vec![Vec::new(); max_level + 1];
        {
            // Candidates found at a wider layer remain valid at the layer
            // below once refiltered to the narrower window, which skips a
            // full graph search for most layers. `reused` records which
            // labels the running candidate set already holds.
            let mut prev_layer: Vec<Candidate> = Vec::new();
            let mut reused = self.visited.lease();
            for layer in (0..=max_level).rev() {
                let half_w = self.params.window_base.pow(layer as u32);
                let mut entries = Vec::new();
                let window = self.order.window_endpoints(label, half_w, &mut entries);
                reused.clear_range(window.lower, window.upper);
                prev_layer.retain(|c| window.contains(c.label));
                for c in &prev_layer {
                    reused.set(c.label);
                }

                let all_candidates = if prev_layer.len() > m {
                    prev_layer.clone()
                } else {
                    let found = self.search_candidates::<true>(
                        &entries,
                        vector,
                        window,
                        LayerRange {
                            lower: layer,
                            upper: max_level,
                        },
                        ef_construction,
                        Some(label),
                        &mut status,
                    );
                    for c in found {
                        if c.label == label {
                            return Err(Error::SelfEdge(label));
                        }
                        if !reused.test(c.label) {
                            prev_layer.push(c);
                        }
                    }
                    prev_layer.clone()
                };

                let pruned = self.prune_by_heuristic(all_candidates, m / 2, &mut status);
                debug_assert!(pruned.len() <= m);
                tmp_lists[layer] = pruned;
            }
        }

        {
            let _node = self.locks[label.index()].lock();
            for layer in 0..=max_level {
                let list = &tmp_lists[layer];
                self.links.set_count(label, layer, list.len());
                for (slot, c) in list.iter().enumerate() {
                    debug_assert!(c.label != label);
                    debug_assert_eq!(
                        self.links.neighbor(label, layer, slot),
                        Label(0),
                        "a new point must start from blank link lists"
                    );
                    self.links.set_neighbor(label, layer, slot, c.label);
                }

                // Reciprocal edges: either append into free slots or
                // re-prune the neighbor's list with the new point included,
                // restricted to the neighbor's own window at this layer.
                let half_w = self.params.window_base.pow(layer as u32);
                for c in list {
                    let _neighbor = self.locks[c.label.index()].lock();
                    let count = self.links.count(c.label, layer);
                    if count < m {
                        self.links.set_neighbor(c.label, layer, count, label);
                        self.links.set_count(c.label, layer, count + 1);
                    } else {
                        let neighbor_vec = self.storage.vector(c.label);
                        let current: Vec<Candidate> = (0..count)
                            .map(|slot| {
                                let w = self.links.neighbor(c.label, layer, slot);
                                Candidate::new(
                                    self.space.distance(neighbor_vec, self.storage.vector(w)),
                                    w,
                                )
                            })
                            .collect();
                        let mut in_window = self.order.filter_candidates(&current, c.label, half_w);
                        in_window.push(Candidate {
                            distance: c.distance,
                            label,
                        });
                        let pruned = self.prune_by_heuristic(in_window, m, &mut status);
                        debug_assert!(pruned.len() <= m);
                        for (slot, p) in pruned.iter().enumerate() {
                            self.links.set_neighbor(c.label, layer, slot, p.label);
                        }
                        self.links.set_count(c.label, layer, pruned.len());
                    }
                }
            }
        }

        self.order.insert(label);
        counters.merge(&status);
        Ok(())
    }

    /// Keeps a candidate only if it is closer to the inserted point than to
    /// every already-kept candidate, scanning in ascending distance; the
    /// usual relative-neighborhood pruning of proximity-graph indexes.
    fn prune_by_heuristic(
        &self,
        mut candidates: Vec<Candidate>,
        m: usize,
        status: &mut RuntimeStatus,
    ) -> Vec<Candidate> {
        if candidates.len() <= m {
            return candidates;
        }
        if m == 0 {
            return Vec::new();
        }
        if m == 1 {
            candidates.truncate(1);
            return candidates;
        }
        candidates.sort_unstable();
        let mut pruned: Vec<Candidate> = Vec::with_capacity(m);
        for candidate in candidates {
            if pruned.len() >= m {
                break;
            }
            let candidate_vec = self.storage.vector(candidate.label);
            let mut keep = true;
            for kept in &pruned {
                let between = self
                    .space
                    .distance(candidate_vec, self.storage.vector(kept.label));
                status.dist_computations += 1;
                if OrderedFloat(between) < candidate.distance {
                    keep = false;
                    break;
                }
            }
            if keep {
                pruned.push(candidate);
            }
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DenseVectors;

    fn line_graph(n: u32) -> WindowGraph<DenseVectors> {
        let store = DenseVectors::from_rows(2, (0..n).map(|i| vec![i as f32, 0.0]));
        let params = IndexParams {
            max_points: n as usize,
            window_top: 1,
            out_degree: 4,
            window_base: 2,
        };
        let order = Box::new(WbTreeOrderTable::with_seed(n as usize, 3));
        WindowGraph::assemble(store, Space::L2, params, order)
    }

    #[test]
    fn prune_keeps_closest_and_drops_dominated() {
        let graph = line_graph(8);
        let mut status = RuntimeStatus::default();
        // Candidates around the point at x = 3. The nearest on each side
        // survive; 5 is dominated by 4 (d(5,4) = 1 < d(3,5) = 4) and 0 by
        // 2 (d(0,2) = 4 < d(3,0) = 9).
        let candidates = vec![
            Candidate::new(4.0, Label(5)),
            Candidate::new(1.0, Label(2)),
            Candidate::new(9.0, Label(0)),
            Candidate::new(1.0, Label(4)),
        ];
        let pruned = graph.prune_by_heuristic(candidates, 3, &mut status);
        let labels: Vec<Label> = pruned.iter().map(|c| c.label).collect();
        assert_eq!(labels, vec![Label(2), Label(4)]);
        assert!(status.dist_computations > 0);
    }

    #[test]
    fn prune_returns_short_input_untouched() {
        let graph = line_graph(4);
        let mut status = RuntimeStatus::default();
        let candidates = vec![
            Candidate::new(9.0, Label(3)),
            Candidate::new(1.0, Label(1)),
        ];
        let pruned = graph.prune_by_heuristic(candidates.clone(), 2, &mut status);
        assert_eq!(pruned, candidates);
        assert_eq!(status.dist_computations, 0);
    }

    #[test]
    fn prune_degenerate_caps() {
        let graph = line_graph(4);
        let mut status = RuntimeStatus::default();
        let candidates = vec![
            Candidate::new(1.0, Label(1)),
            Candidate::new(4.0, Label(2)),
        ];
        assert!(graph
            .prune_by_heuristic(candidates.clone(), 0, &mut status)
            .is_empty());
        let one = graph.prune_by_heuristic(candidates, 1, &mut status);
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn first_point_registers_without_edges() {
        let graph = line_graph(8);
        let counters = BuildCounters::default();
        graph.add_point(Label(5), 10, &counters).unwrap();
        assert_eq!(graph.population(), 1);
        assert_eq!(graph.order.len(), 1);
        for layer in 0..=1 {
            assert!(graph.neighbors(Label(5), layer).is_empty());
        }
    }
}
