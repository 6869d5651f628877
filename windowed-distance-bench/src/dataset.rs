//! Dataset files: `fvecs` vectors, query filter pairs, and ground truth.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use windowed_distance::{Candidate, DenseVectors, Filter, Label, Space, VectorStore};

/// Reads an `fvecs` file: each vector is a little-endian `i32` dimension
/// followed by that many `f32` components. At most `max_n` vectors are kept.
pub fn read_fvecs(path: &Path, max_n: Option<usize>) -> Result<DenseVectors> {
    let mut input = BufReader::new(
        File::open(path).with_context(|| format!("open {}", path.display()))?,
    );
    let cap = max_n.unwrap_or(usize::MAX);
    let mut store: Option<DenseVectors> = None;
    let mut count = 0usize;
    let mut row = Vec::new();
    while count < cap {
        let dim = match input.read_i32::<LittleEndian>() {
            Ok(d) => d as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("read vector dimension"),
        };
        let store = store.get_or_insert_with(|| DenseVectors::new(dim));
        if dim != store.dim() {
            bail!(
                "vector {count} has dimension {dim}, expected {}",
                store.dim()
            );
        }
        row.clear();
        for _ in 0..dim {
            row.push(input.read_f32::<LittleEndian>()?);
        }
        store.push(&row);
        count += 1;
    }
    let store = store.with_context(|| format!("{} holds no vectors", path.display()))?;
    tracing::info!(path = %path.display(), dim = store.dim(), count, "vectors loaded");
    Ok(store)
}

/// Reads per-query filters: one `(l, u)` pair of little-endian `i32` each.
pub fn read_filters(path: &Path) -> Result<Vec<Filter>> {
    let mut input = BufReader::new(
        File::open(path).with_context(|| format!("open {}", path.display()))?,
    );
    let mut filters = Vec::new();
    loop {
        let lower = match input.read_i32::<LittleEndian>() {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("read filter"),
        };
        let upper = input.read_i32::<LittleEndian>()?;
        filters.push(Filter::new(lower as u32, upper as u32));
    }
    tracing::info!(path = %path.display(), count = filters.len(), "query filters loaded");
    Ok(filters)
}

/// Ground truth file: per query an `i32` length then that many `i32` ids.
pub fn read_ground_truth(path: &Path) -> Result<Vec<Vec<Label>>> {
    let mut input = BufReader::new(
        File::open(path).with_context(|| format!("open {}", path.display()))?,
    );
    let mut truth = Vec::new();
    loop {
        let len = match input.read_i32::<LittleEndian>() {
            Ok(n) => n as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("read ground truth length"),
        };
        let mut ids = Vec::with_capacity(len);
        for _ in 0..len {
            ids.push(Label(input.read_i32::<LittleEndian>()? as u32));
        }
        truth.push(ids);
    }
    tracing::info!(path = %path.display(), count = truth.len(), "ground truth loaded");
    Ok(truth)
}

pub fn write_ground_truth(path: &Path, truth: &[Vec<Label>]) -> Result<()> {
    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("create {}", path.display()))?,
    );
    for ids in truth {
        out.write_i32::<LittleEndian>(ids.len() as i32)?;
        for id in ids {
            out.write_i32::<LittleEndian>(id.0 as i32)?;
        }
    }
    out.flush()?;
    tracing::info!(path = %path.display(), count = truth.len(), "ground truth saved");
    Ok(())
}

/// Brute-force windowed `k`-NN over the base vectors, one list per query.
pub fn generate_ground_truth(
    base: &DenseVectors,
    queries: &DenseVectors,
    filters: &[Filter],
    space: Space,
    k: usize,
) -> Vec<Vec<Label>> {
    (0..queries.len())
        .into_par_iter()
        .map(|i| {
            let query = queries.vector(Label(i as u32));
            let filter = filters[i];
            let mut nearest: Vec<Candidate> = (0..base.len() as u32)
                .map(Label)
                .filter(|&l| filter.contains(l))
                .map(|l| Candidate::new(space.distance(query, base.vector(l)), l))
                .collect();
            nearest.sort_unstable();
            nearest.truncate(k);
            nearest.into_iter().map(|c| c.label).collect()
        })
        .collect()
}
