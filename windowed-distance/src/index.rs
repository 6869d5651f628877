use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;
use parking_lot::Mutex;

use crate::graph::{prefetch, LinkLists};
use crate::order::OrderTable;
use crate::space::Space;
use crate::storage::VectorStore;
use crate::types::{Candidate, Filter, Label, LayerRange, RuntimeStatus};
use crate::visited::VisitedPool;
use crate::IndexParams;

pub(crate) struct Growth {
    pub(crate) max_layer: usize,
    pub(crate) population: usize,
}

/// The windowed multi-layer proximity-graph index.
///
/// Layer `ℓ` only holds edges between points whose attribute ranks are
/// within `window_base^ℓ` of each other, so a range-filtered query can pick
/// the layers whose windows match its filter and ignore the rest.
pub struct WindowGraph<S> {
    pub(crate) params: IndexParams,
    pub(crate) space: Space,
    pub(crate) storage: S,
    pub(crate) links: LinkLists,
    pub(crate) order: Box<dyn OrderTable>,
    pub(crate) locks: Box<[Mutex<()>]>,
    pub(crate) visited: VisitedPool,
    /// `window_size[ℓ] = 2 · window_base^ℓ`, with `window_size[0] = 2`.
    pub(crate) window_size: Vec<usize>,
    pub(crate) growth: Mutex<Growth>,
}

impl<S> std::fmt::Debug for WindowGraph<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowGraph").finish_non_exhaustive()
    }
}

impl<S> WindowGraph<S> {
    pub(crate) fn assemble(
        storage: S,
        space: Space,
        params: IndexParams,
        order: Box<dyn OrderTable>,
    ) -> Self {
        let links = LinkLists::new(params.max_points, params.window_top, params.out_degree);
        let locks = (0..params.max_points).map(|_| Mutex::new(())).collect();
        Self {
            visited: VisitedPool::new(params.max_points),
            window_size: window_schedule(&params),
            growth: Mutex::new(Growth {
                max_layer: 0,
                population: 0,
            }),
            params,
            space,
            storage,
            links,
            order,
            locks,
        }
    }

    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    pub fn space(&self) -> Space {
        self.space
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Number of inserted points.
    pub fn population(&self) -> usize {
        self.growth.lock().population
    }

    /// Highest layer the population has grown into so far.
    pub fn max_layer(&self) -> usize {
        self.growth.lock().max_layer
    }

    pub fn window_sizes(&self) -> &[usize] {
        &self.window_size
    }

    /// The label used to pad results shorter than `k`; one past the last
    /// valid label when the index is built at capacity.
    pub fn sentinel(&self) -> Label {
        Label(self.params.max_points as u32)
    }

    /// Snapshot of a label's neighbor list at `layer`.
    pub fn neighbors(&self, label: Label, layer: usize) -> Vec<Label> {
        let count = self.links.count(label, layer);
        (0..count)
            .map(|slot| self.links.neighbor(label, layer, slot))
            .collect()
    }
}

impl<S: VectorStore> WindowGraph<S> {
    /// Best-first traversal shared by construction (`BUILD = true`) and
    /// queries. Returns up to `ef` in-window candidates as a max-heap keyed
    /// by distance.
    ///
    /// Neighbor slots are scanned from `layers.upper` down, stopping once
    /// `out_degree` in-window neighbors of the current hop were evaluated;
    /// this bounds each hop's cost independent of the number of layers. In
    /// query mode a layer scanned without meeting any out-of-window
    /// neighbor ends the descent, since the narrower layers below cannot
    /// add coverage. In build mode the hop's adjacency is read under that
    /// label's lock; queries read lock-free.
    pub(crate) fn search_candidates<const BUILD: bool>(
        &self,
        entries: &[Label],
        query: &[f32],
        filter: Filter,
        layers: LayerRange,
        ef: usize,
        ignore: Option<Label>,
        status: &mut RuntimeStatus,
    ) -> BinaryHeap<Candidate> {
        debug_assert!(
            layers.lower <= layers.upper && layers.upper <= self.params.window_top,
            "invalid layer range {layers:?}"
        );
        let mut visited = self.visited.lease();
        if BUILD {
            visited.clear();
            if let Some(skip) = ignore {
                visited.set(skip);
            }
        } else {
            visited.clear_range(filter.lower, filter.upper);
        }

        let mut candidates: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();
        for &entry in entries {
            let distance = OrderedFloat(self.space.distance(query, self.storage.vector(entry)));
            status.dist_computations += 1;
            candidates.push(Reverse(Candidate {
                distance,
                label: entry,
            }));
            results.push(Candidate {
                distance,
                label: entry,
            });
            visited.set(entry);
        }

        let m = self.params.out_degree;
        let mut worst = results
            .peek()
            .map(|c| c.distance)
            .unwrap_or(OrderedFloat(f32::INFINITY));
        while let Some(&Reverse(current)) = candidates.peek() {
            let stop = match BUILD {
                true => current.distance > worst && results.len() == ef,
                false => current.distance > worst,
            };
            if stop {
                break;
            }
            candidates.pop();
            status.hops += 1;

            let _guard = BUILD.then(|| self.locks[current.label.index()].lock());
            let mut neighbor_cnt = 0;
            for layer in (layers.lower..=layers.upper).rev() {
                if neighbor_cnt >= m {
                    break;
                }
                let count = self.links.count(current.label, layer);
                prefetch(self.links.list_ptr(current.label, layer));
                if count > 0 {
                    let first = self.links.neighbor(current.label, layer, 0);
                    prefetch(self.storage.vector(first).as_ptr());
                }
                let mut saw_out_of_window = false;
                for slot in 0..count {
                    if neighbor_cnt >= m {
                        break;
                    }
                    let neighbor = self.links.neighbor(current.label, layer, slot);
                    if !filter.contains(neighbor) {
                        saw_out_of_window = true;
                        continue;
                    }
                    if slot + 1 < count {
                        let next = self.links.neighbor(current.label, layer, slot + 1);
                        prefetch(self.storage.vector(next).as_ptr());
                    }
                    if visited.test(neighbor) {
                        continue;
                    }
                    visited.set(neighbor);
                    let distance =
                        OrderedFloat(self.space.distance(query, self.storage.vector(neighbor)));
                    status.dist_computations += 1;
                    neighbor_cnt += 1;
                    if results.len() < ef || distance < worst {
                        candidates.push(Reverse(Candidate {
                            distance,
                            label: neighbor,
                        }));
                        results.push(Candidate {
                            distance,
                            label: neighbor,
                        });
                        if results.len() > ef {
                            results.pop();
                        }
                        worst = results.peek().unwrap().distance;
                    }
                }
                if !BUILD && !saw_out_of_window {
                    break;
                }
            }
        }
        results
    }
}

fn window_schedule(params: &IndexParams) -> Vec<usize> {
    let mut sizes = Vec::with_capacity(params.window_top + 1);
    sizes.push(2);
    for layer in 1..=params.window_top {
        sizes.push(params.window_base * sizes[layer - 1]);
    }
    sizes
}
