use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

use crate::types::Label;

/// Fixed-capacity bitset over labels, backed by 64-bit words.
pub(crate) struct Bitset {
    words: Box<[u64]>,
}

impl Bitset {
    fn with_capacity(labels: usize) -> Self {
        Self {
            words: vec![0u64; (labels + 63) / 64].into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn set(&mut self, label: Label) {
        self.words[label.index() / 64] |= 1u64 << (label.index() % 64);
    }

    #[inline]
    pub(crate) fn test(&self, label: Label) -> bool {
        self.words[label.index() / 64] & (1u64 << (label.index() % 64)) != 0
    }

    pub(crate) fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Clears every word covering `[lower, upper]`. Bits outside the range
    /// that share a boundary word are cleared too; callers only test labels
    /// inside the range they cleared.
    pub(crate) fn clear_range(&mut self, lower: Label, upper: Label) {
        let start = lower.index() / 64;
        let end = upper.index() / 64;
        self.words[start..=end].fill(0);
    }
}

/// Free-list of recycled bitsets; one is leased per traversal and returned
/// when the lease drops.
pub(crate) struct VisitedPool {
    pool: Mutex<Vec<Bitset>>,
    labels: usize,
}

impl VisitedPool {
    pub(crate) fn new(labels: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            labels,
        }
    }

    pub(crate) fn lease(&self) -> VisitedLease<'_> {
        let bits = match self.pool.lock().pop() {
            Some(bits) => bits,
            None => Bitset::with_capacity(self.labels),
        };
        VisitedLease {
            pool: self,
            bits: Some(bits),
        }
    }
}

pub(crate) struct VisitedLease<'a> {
    pool: &'a VisitedPool,
    bits: Option<Bitset>,
}

impl Deref for VisitedLease<'_> {
    type Target = Bitset;

    fn deref(&self) -> &Bitset {
        self.bits.as_ref().unwrap()
    }
}

impl DerefMut for VisitedLease<'_> {
    fn deref_mut(&mut self) -> &mut Bitset {
        self.bits.as_mut().unwrap()
    }
}

impl Drop for VisitedLease<'_> {
    fn drop(&mut self) {
        if let Some(bits) = self.bits.take() {
            self.pool.pool.lock().push(bits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_test() {
        let mut bits = Bitset::with_capacity(130);
        bits.set(Label(0));
        bits.set(Label(64));
        bits.set(Label(129));
        assert!(bits.test(Label(0)));
        assert!(bits.test(Label(64)));
        assert!(bits.test(Label(129)));
        assert!(!bits.test(Label(1)));
    }

    #[test]
    fn clear_range_clears_covering_words() {
        let mut bits = Bitset::with_capacity(256);
        for i in 0..256 {
            bits.set(Label(i));
        }
        bits.clear_range(Label(70), Label(130));
        // Bits inside the range are gone.
        assert!(!bits.test(Label(70)));
        assert!(!bits.test(Label(130)));
        // The boundary words were cleared wholesale.
        assert!(!bits.test(Label(64)));
        assert!(!bits.test(Label(191)));
        // Words entirely outside the range survive.
        assert!(bits.test(Label(63)));
        assert!(bits.test(Label(192)));
    }

    #[test]
    fn leases_recycle() {
        let pool = VisitedPool::new(64);
        {
            let mut lease = pool.lease();
            lease.set(Label(3));
        }
        // The recycled bitset comes back dirty; leasing does not clear.
        let lease = pool.lease();
        assert!(lease.test(Label(3)));
        assert_eq!(pool.pool.lock().len(), 0);
        drop(lease);
        assert_eq!(pool.pool.lock().len(), 1);
    }
}
