use aligned_vec::{AVec, ConstAlign};

use crate::space::VECTOR_ALIGN;
use crate::types::Label;

/// Read access to the dense base (or query) vectors behind an index.
///
/// Implementations must hand out the same row for the same label for the
/// lifetime of the store; distances are computed on these rows without any
/// locking.
pub trait VectorStore: Sync {
    fn dim(&self) -> usize;

    fn len(&self) -> usize;

    /// The vector row for `label`. Panics if the label is out of range.
    fn vector(&self, label: Label) -> &[f32];

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owned row-major `f32` vector storage, aligned to [`VECTOR_ALIGN`] bytes.
#[derive(Clone)]
pub struct DenseVectors {
    data: AVec<f32, ConstAlign<VECTOR_ALIGN>>,
    dim: usize,
}

impl DenseVectors {
    pub fn new(dim: usize) -> Self {
        Self::with_capacity(dim, 0)
    }

    pub fn with_capacity(dim: usize, rows: usize) -> Self {
        assert!(dim > 0, "vector dimension must be positive");
        Self {
            data: AVec::with_capacity(VECTOR_ALIGN, rows * dim),
            dim,
        }
    }

    /// Appends one row; the new row's label is the previous [`len`].
    ///
    /// [`len`]: VectorStore::len
    pub fn push(&mut self, row: &[f32]) {
        assert_eq!(row.len(), self.dim, "row length does not match dimension");
        for &value in row {
            self.data.push(value);
        }
    }

    pub fn from_rows(dim: usize, rows: impl IntoIterator<Item = Vec<f32>>) -> Self {
        let mut this = Self::new(dim);
        for row in rows {
            this.push(&row);
        }
        this
    }
}

impl VectorStore for DenseVectors {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    fn vector(&self, label: Label) -> &[f32] {
        let start = label.index() * self.dim;
        &self.data[start..start + self.dim]
    }
}

impl<T: VectorStore> VectorStore for &T {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn vector(&self, label: Label) -> &[f32] {
        (**self).vector(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_round_trip() {
        let mut store = DenseVectors::new(3);
        store.push(&[1.0, 2.0, 3.0]);
        store.push(&[4.0, 5.0, 6.0]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.vector(Label(1)), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn rows_are_aligned() {
        let mut store = DenseVectors::new(4);
        store.push(&[0.0; 4]);
        let addr = store.vector(Label(0)).as_ptr() as usize;
        assert_eq!(addr % VECTOR_ALIGN, 0);
    }
}
