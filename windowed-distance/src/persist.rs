use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::index::WindowGraph;
use crate::order::WbTreeOrderTable;
use crate::space::Space;
use crate::storage::VectorStore;
use crate::types::Label;
use crate::{Error, IndexParams};

/// Conventional index filename:
/// `pp_<db>_<vec-type>_<attr-type>_<d>_<N>_<W>_<M>_<b>.index`.
pub fn index_file_name(
    db_name: &str,
    vector_kind: &str,
    attribute_kind: &str,
    dim: usize,
    points: usize,
    params: &IndexParams,
) -> String {
    format!(
        "pp_{}_{}_{}_{}_{}_{}_{}_{}.index",
        db_name,
        vector_kind,
        attribute_kind,
        dim,
        points,
        params.window_top,
        params.out_degree,
        params.window_base
    )
}

impl<S: VectorStore> WindowGraph<S> {
    /// Writes the index to a single little-endian binary file: parameters,
    /// growth state, link-list sizing, the raw link-list slots, then the
    /// order table.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let mut out = BufWriter::new(File::create(path)?);
        let params = &self.params;
        out.write_u64::<LittleEndian>(params.max_points as u64)?;
        out.write_u64::<LittleEndian>(params.window_top as u64)?;
        out.write_u64::<LittleEndian>(params.out_degree as u64)?;
        out.write_u64::<LittleEndian>(params.window_base as u64)?;

        let (max_layer, population) = {
            let growth = self.growth.lock();
            (growth.max_layer, growth.population)
        };
        out.write_i32::<LittleEndian>(max_layer as i32)?;
        out.write_u64::<LittleEndian>(population as u64)?;

        let elem_per_list = (params.out_degree + 1) * (params.window_top + 1);
        out.write_u64::<LittleEndian>(elem_per_list as u64)?;
        out.write_u64::<LittleEndian>((self.links.slot_count() * 4) as u64)?;
        for slot in 0..self.links.slot_count() {
            out.write_u32::<LittleEndian>(self.links.load_slot(slot))?;
        }

        self.order.serialize(&mut out)?;
        out.flush()?;
        tracing::info!(path = %path.display(), "index saved");
        Ok(())
    }

    /// Reconstructs an index from [`save`]'s format over an existing vector
    /// store. Sizing fields are cross-checked against the parameters before
    /// anything is allocated from them.
    ///
    /// [`save`]: WindowGraph::save
    pub fn load(path: &Path, storage: S, space: Space) -> Result<Self, Error> {
        let mut input = BufReader::new(File::open(path)?);
        let params = IndexParams {
            max_points: input.read_u64::<LittleEndian>()? as usize,
            window_top: input.read_u64::<LittleEndian>()? as usize,
            out_degree: input.read_u64::<LittleEndian>()? as usize,
            window_base: input.read_u64::<LittleEndian>()? as usize,
        };
        let max_layer = input.read_i32::<LittleEndian>()?;
        if max_layer < 0 || max_layer as usize > params.window_top {
            return Err(Error::Corruption(format!(
                "top layer {max_layer} outside 0..={}",
                params.window_top
            )));
        }
        let population = input.read_u64::<LittleEndian>()? as usize;
        if population > params.max_points {
            return Err(Error::Corruption(format!(
                "population {population} exceeds capacity {}",
                params.max_points
            )));
        }

        let elem_per_list = input.read_u64::<LittleEndian>()? as usize;
        if elem_per_list != (params.out_degree + 1) * (params.window_top + 1) {
            return Err(Error::Corruption(format!(
                "link list stride {elem_per_list} does not match parameters"
            )));
        }
        let bytes = input.read_u64::<LittleEndian>()? as usize;
        if bytes != params.max_points * elem_per_list * 4 {
            return Err(Error::Corruption(format!(
                "link list memory of {bytes} bytes does not match parameters"
            )));
        }

        let order = WbTreeOrderTable::new(params.max_points);
        let index = WindowGraph::assemble(storage, space, params, Box::new(order));
        for slot in 0..index.links.slot_count() {
            index.links.store_slot(slot, input.read_u32::<LittleEndian>()?);
        }
        index.order.deserialize(&mut input)?;
        {
            let mut growth = index.growth.lock();
            growth.max_layer = max_layer as usize;
            growth.population = population;
        }

        tracing::info!(
            path = %path.display(),
            max_points = params.max_points,
            window_top = params.window_top,
            out_degree = params.out_degree,
            window_base = params.window_base,
            "index loaded"
        );
        if population > 0 {
            for layer in 0..=params.window_top {
                let links: usize = (0..population)
                    .map(|l| index.links.count(Label(l as u32), layer))
                    .sum();
                tracing::info!(
                    layer,
                    avg_out_degree = links as f64 / population as f64,
                    "layer loaded"
                );
            }
        }
        Ok(index)
    }
}
