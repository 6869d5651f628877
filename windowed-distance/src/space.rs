use std::str::FromStr;

use crate::Error;

/// Alignment of base and query vector rows, in bytes. Distance kernels may
/// assume rows never straddle a cache line boundary mid-element.
pub const VECTOR_ALIGN: usize = 64;

/// Distance metric between two vectors; smaller values are closer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Space {
    /// Squared Euclidean distance.
    L2,
    /// `1 − Σ xᵢ·yᵢ`.
    InnerProduct,
    /// `1 − (x·y)/(‖x‖·‖y‖)`. Pre-normalized vectors can use
    /// [`Space::InnerProduct`] instead and skip the norm computation.
    Cosine,
}

impl Space {
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Space::L2 => l2_squared(a, b),
            Space::InnerProduct => 1.0 - dot(a, b),
            Space::Cosine => cosine_distance(a, b),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Space::L2 => "l2",
            Space::InnerProduct => "ip",
            Space::Cosine => "cos",
        }
    }
}

impl FromStr for Space {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "l2" => Ok(Space::L2),
            "ip" => Ok(Space::InnerProduct),
            "cos" => Ok(Space::Cosine),
            other => Err(Error::UnknownSpace(other.to_owned())),
        }
    }
}

#[inline]
fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let norms = dot(a, a) * dot(b, b);
    if norms <= 0.0 {
        return 1.0;
    }
    1.0 - dot(a, b) / norms.sqrt()
}
