use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::Label;

/// Flat per-layer adjacency storage.
///
/// One `u32` slot array of `max_points · (window_top+1) · (out_degree+1)`
/// entries, zero-initialized. The list for `(label, layer)` starts at
/// `label · node_stride + layer · (out_degree+1)`; slots `0..out_degree`
/// hold neighbor labels and the final slot holds the list length.
///
/// Slots are relaxed atomics: writers serialize through the per-label
/// mutexes owned by the index, while query traversals read concurrently
/// without locks and re-read the length on every visit. A reader may
/// observe a list mid-rewrite; it never observes a torn slot.
pub(crate) struct LinkLists {
    slots: Box<[AtomicU32]>,
    layer_stride: usize,
    node_stride: usize,
}

impl LinkLists {
    pub(crate) fn new(max_points: usize, window_top: usize, out_degree: usize) -> Self {
        let layer_stride = out_degree + 1;
        let node_stride = (window_top + 1) * layer_stride;
        let slots: Box<[AtomicU32]> = (0..max_points * node_stride)
            .map(|_| AtomicU32::new(0))
            .collect();
        advise_huge_pages(&slots);
        Self {
            slots,
            layer_stride,
            node_stride,
        }
    }

    #[inline]
    fn base(&self, label: Label, layer: usize) -> usize {
        label.index() * self.node_stride + layer * self.layer_stride
    }

    #[inline]
    pub(crate) fn count(&self, label: Label, layer: usize) -> usize {
        self.slots[self.base(label, layer) + self.layer_stride - 1].load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub(crate) fn set_count(&self, label: Label, layer: usize, count: usize) {
        self.slots[self.base(label, layer) + self.layer_stride - 1]
            .store(count as u32, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn neighbor(&self, label: Label, layer: usize, slot: usize) -> Label {
        debug_assert!(slot < self.layer_stride - 1);
        Label(self.slots[self.base(label, layer) + slot].load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_neighbor(&self, label: Label, layer: usize, slot: usize, neighbor: Label) {
        debug_assert!(slot < self.layer_stride - 1);
        self.slots[self.base(label, layer) + slot].store(neighbor.0, Ordering::Relaxed);
    }

    /// Copies a label's whole list (neighbors and length) between layers.
    pub(crate) fn copy_layer(&self, label: Label, from: usize, to: usize) {
        let src = self.base(label, from);
        let dst = self.base(label, to);
        for i in 0..self.layer_stride {
            let value = self.slots[src + i].load(Ordering::Relaxed);
            self.slots[dst + i].store(value, Ordering::Relaxed);
        }
    }

    /// Number of slots, for persistence.
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn load_slot(&self, index: usize) -> u32 {
        self.slots[index].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn store_slot(&self, index: usize, value: u32) {
        self.slots[index].store(value, Ordering::Relaxed);
    }

    /// Pointer to a list's first slot, for prefetching only.
    #[inline]
    pub(crate) fn list_ptr(&self, label: Label, layer: usize) -> *const AtomicU32 {
        self.slots[self.base(label, layer)..].as_ptr()
    }
}

#[cfg(target_os = "linux")]
fn advise_huge_pages(slots: &[AtomicU32]) {
    // Ask the kernel to back the allocation's whole pages with 2-MB pages;
    // madvise wants a page-aligned address, so round the span inward.
    const PAGE: usize = 4096;
    let start = slots.as_ptr() as usize;
    let end = start + std::mem::size_of_val(slots);
    let aligned_start = (start + PAGE - 1) & !(PAGE - 1);
    let aligned_end = end & !(PAGE - 1);
    if aligned_end > aligned_start {
        unsafe {
            libc::madvise(
                aligned_start as *mut libc::c_void,
                aligned_end - aligned_start,
                libc::MADV_HUGEPAGE,
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_huge_pages(_slots: &[AtomicU32]) {}

#[inline]
pub(crate) fn prefetch<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch(ptr as *const i8, _MM_HINT_T0);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_blank() {
        let links = LinkLists::new(4, 2, 3);
        for label in 0..4u32 {
            for layer in 0..=2 {
                assert_eq!(links.count(Label(label), layer), 0);
            }
        }
        assert_eq!(links.slot_count(), 4 * 3 * 4);
    }

    #[test]
    fn lists_are_independent_per_layer() {
        let links = LinkLists::new(4, 1, 2);
        links.set_neighbor(Label(1), 0, 0, Label(3));
        links.set_count(Label(1), 0, 1);

        assert_eq!(links.count(Label(1), 0), 1);
        assert_eq!(links.neighbor(Label(1), 0, 0), Label(3));
        assert_eq!(links.count(Label(1), 1), 0);
        assert_eq!(links.count(Label(2), 0), 0);
    }

    #[test]
    fn copy_layer_carries_length() {
        let links = LinkLists::new(2, 1, 2);
        links.set_neighbor(Label(0), 0, 0, Label(1));
        links.set_neighbor(Label(0), 0, 1, Label(0));
        links.set_count(Label(0), 0, 2);

        links.copy_layer(Label(0), 0, 1);
        assert_eq!(links.count(Label(0), 1), 2);
        assert_eq!(links.neighbor(Label(0), 1, 0), Label(1));
        assert_eq!(links.neighbor(Label(0), 1, 1), Label(0));
    }
}
