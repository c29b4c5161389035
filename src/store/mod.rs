//! Step-oriented, selection-based persistence.
//!
//! A persisted sequence is a list of steps; each step holds named arrays with
//! a global shape, and every writer contributes the block it owns. Readers ask
//! for any selection in global coordinates and get it assembled from whatever
//! blocks cover it, so data written by N ranks can be read back by M.
//!
//! All arrays are x fastest, like [`crate::field::Field`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::{MemoryReader, MemoryStore, MemoryWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ElementType {
    F64,
}

/// A named array together with this rank's selection of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayHandle {
    name: String,
    global: [usize; 3],
    offset: [usize; 3],
    extent: [usize; 3],
    element: ElementType,
}

impl ArrayHandle {
    pub fn new(
        name: &str,
        global: [usize; 3],
        offset: [usize; 3],
        extent: [usize; 3],
        element: ElementType,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::persistence("array name must not be empty"));
        }
        if (0..3).any(|a| offset[a] + extent[a] > global[a]) {
            return Err(Error::persistence(format!(
                "selection {offset:?}+{extent:?} of '{name}' exceeds global shape {global:?}"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            global,
            offset,
            extent,
            element,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn global_shape(&self) -> [usize; 3] {
        self.global
    }

    pub fn offset(&self) -> [usize; 3] {
        self.offset
    }

    pub fn extent(&self) -> [usize; 3] {
        self.extent
    }

    pub fn element_type(&self) -> ElementType {
        self.element
    }

    /// Number of elements in the selection.
    pub fn len(&self) -> usize {
        self.extent.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The persistence collaborator of the engine.
///
/// Writes and reads are bracketed by [`begin_step`](Persistence::begin_step)
/// and [`end_step`](Persistence::end_step). A writer appends one step per
/// bracket; a reader advances through the stored steps in order and fails
/// with [`Error::StepUnavailable`] once none are left.
pub trait Persistence {
    fn define_array(
        &mut self,
        name: &str,
        global_shape: [usize; 3],
        offset: [usize; 3],
        extent: [usize; 3],
        element: ElementType,
    ) -> Result<ArrayHandle> {
        ArrayHandle::new(name, global_shape, offset, extent, element)
    }

    fn begin_step(&mut self) -> Result<()>;

    fn end_step(&mut self) -> Result<()>;

    /// Stores this rank's block of `array` for the open step.
    fn write(&mut self, array: &ArrayHandle, data: &[f64]) -> Result<()>;

    /// Fills `out` with the selection of `array` for the open step.
    fn read(&mut self, array: &ArrayHandle, out: &mut [f64]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// One writer's contiguous block of an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub offset: [usize; 3],
    pub extent: [usize; 3],
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArray {
    pub global: [usize; 3],
    pub element: ElementType,
    pub blocks: Vec<Block>,
}

/// Every array of one step, by name.
pub type StepArrays = BTreeMap<String, StoredArray>;

/// Adds a block written through `array` to `step`.
pub(crate) fn record_block(step: &mut StepArrays, array: &ArrayHandle, data: &[f64]) -> Result<()> {
    if data.len() != array.len() {
        return Err(Error::persistence(format!(
            "'{}' block holds {} values, selection needs {}",
            array.name,
            data.len(),
            array.len()
        )));
    }
    let stored = step
        .entry(array.name.clone())
        .or_insert_with(|| StoredArray {
            global: array.global,
            element: array.element,
            blocks: Vec::new(),
        });
    check_shape(stored, array)?;
    stored.blocks.push(Block {
        offset: array.offset,
        extent: array.extent,
        data: data.to_vec(),
    });
    Ok(())
}

/// Merges the arrays of one writer into a step shared by all writers.
pub(crate) fn merge_step(into: &mut StepArrays, from: StepArrays) -> Result<()> {
    for (name, array) in from {
        match into.get_mut(&name) {
            Some(existing) => {
                if existing.global != array.global || existing.element != array.element {
                    return Err(Error::persistence(format!(
                        "writers disagree on the shape of '{name}'"
                    )));
                }
                existing.blocks.extend(array.blocks);
            }
            None => {
                into.insert(name, array);
            }
        }
    }
    Ok(())
}

fn check_shape(stored: &StoredArray, array: &ArrayHandle) -> Result<()> {
    if stored.global != array.global {
        return Err(Error::persistence(format!(
            "'{}' is stored with global shape {:?}, requested {:?}",
            array.name, stored.global, array.global
        )));
    }
    if stored.element != array.element {
        return Err(Error::persistence(format!(
            "'{}' is stored as {:?}, requested {:?}",
            array.name, stored.element, array.element
        )));
    }
    Ok(())
}

/// Copies the selection of `array` out of the blocks stored in `step`.
pub(crate) fn assemble(step: &StepArrays, array: &ArrayHandle, out: &mut [f64]) -> Result<()> {
    let stored = step
        .get(&array.name)
        .ok_or_else(|| Error::persistence(format!("no array '{}' in this step", array.name)))?;
    check_shape(stored, array)?;
    if out.len() != array.len() {
        return Err(Error::persistence(format!(
            "buffer of {} values for a selection of {}",
            out.len(),
            array.len()
        )));
    }

    let (o, e) = (array.offset, array.extent);
    let mut covered = vec![false; out.len()];
    for block in &stored.blocks {
        let (bo, be) = (block.offset, block.extent);
        if block.data.len() != be.iter().product::<usize>() {
            return Err(Error::persistence(format!(
                "corrupt block of '{}' at {bo:?}",
                array.name
            )));
        }
        let lo: [usize; 3] = std::array::from_fn(|a| o[a].max(bo[a]));
        let hi: [usize; 3] = std::array::from_fn(|a| (o[a] + e[a]).min(bo[a] + be[a]));
        if (0..3).any(|a| lo[a] >= hi[a]) {
            continue;
        }
        let run = hi[0] - lo[0];
        for z in lo[2]..hi[2] {
            for y in lo[1]..hi[1] {
                let src = (lo[0] - bo[0]) + (y - bo[1]) * be[0] + (z - bo[2]) * be[0] * be[1];
                let dst = (lo[0] - o[0]) + (y - o[1]) * e[0] + (z - o[2]) * e[0] * e[1];
                out[dst..dst + run].copy_from_slice(&block.data[src..src + run]);
                covered[dst..dst + run].iter_mut().for_each(|c| *c = true);
            }
        }
    }

    if let Some(missing) = covered.iter().position(|c| !c) {
        return Err(Error::persistence(format!(
            "selection of '{}' not covered by stored blocks (first gap at element {missing})",
            array.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(offset: [usize; 3], extent: [usize; 3]) -> ArrayHandle {
        ArrayHandle::new("u", [4, 2, 1], offset, extent, ElementType::F64).unwrap()
    }

    fn global_value(x: usize, y: usize) -> f64 {
        (x + 10 * y) as f64
    }

    fn block_values(offset: [usize; 3], extent: [usize; 3]) -> Vec<f64> {
        let mut data = Vec::new();
        for y in offset[1]..offset[1] + extent[1] {
            for x in offset[0]..offset[0] + extent[0] {
                data.push(global_value(x, y));
            }
        }
        data
    }

    #[test]
    fn selection_must_fit_global_shape() {
        assert!(ArrayHandle::new("u", [4, 4, 4], [2, 0, 0], [3, 4, 4], ElementType::F64).is_err());
        assert!(ArrayHandle::new("", [4, 4, 4], [0, 0, 0], [1, 1, 1], ElementType::F64).is_err());
        let h = handle([1, 0, 0], [3, 2, 1]);
        assert_eq!(h.len(), 6);
    }

    #[test]
    fn assembles_selection_across_blocks() {
        let mut step = StepArrays::new();
        for offset in [[0, 0, 0], [2, 0, 0]] {
            let h = handle(offset, [2, 2, 1]);
            record_block(&mut step, &h, &block_values(offset, [2, 2, 1])).unwrap();
        }
        let wanted = handle([1, 0, 0], [2, 2, 1]);
        let mut out = vec![0.0; wanted.len()];
        assemble(&step, &wanted, &mut out).unwrap();
        assert_eq!(out, block_values([1, 0, 0], [2, 2, 1]));
    }

    #[test]
    fn gaps_and_mismatches_are_persistence_failures() {
        let mut step = StepArrays::new();
        let left = handle([0, 0, 0], [2, 2, 1]);
        record_block(&mut step, &left, &block_values([0, 0, 0], [2, 2, 1])).unwrap();

        let all = handle([0, 0, 0], [4, 2, 1]);
        let mut out = vec![0.0; all.len()];
        assert!(matches!(
            assemble(&step, &all, &mut out),
            Err(Error::PersistenceFailure(_))
        ));

        let reshaped =
            ArrayHandle::new("u", [4, 4, 1], [0, 0, 0], [2, 2, 1], ElementType::F64).unwrap();
        let mut out = vec![0.0; reshaped.len()];
        assert!(assemble(&step, &reshaped, &mut out).is_err());

        let other =
            ArrayHandle::new("v", [4, 2, 1], [0, 0, 0], [2, 2, 1], ElementType::F64).unwrap();
        assert!(assemble(&step, &other, &mut out).is_err());
    }

    #[test]
    fn block_length_must_match_selection() {
        let mut step = StepArrays::new();
        let h = handle([0, 0, 0], [2, 2, 1]);
        assert!(record_block(&mut step, &h, &[1.0; 3]).is_err());
    }

    #[test]
    fn merging_keeps_every_writer_block() {
        let mut shared = StepArrays::new();
        for offset in [[0, 0, 0], [2, 0, 0]] {
            let mut mine = StepArrays::new();
            let h = handle(offset, [2, 2, 1]);
            record_block(&mut mine, &h, &block_values(offset, [2, 2, 1])).unwrap();
            merge_step(&mut shared, mine).unwrap();
        }
        assert_eq!(shared["u"].blocks.len(), 2);
    }
}
