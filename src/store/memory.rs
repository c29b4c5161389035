//! In-process persistence shared by every rank of a [`LocalUniverse`] run.
//!
//! [`LocalUniverse`]: crate::transport::LocalUniverse

use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use super::{assemble, merge_step, record_block, ArrayHandle, Persistence, StepArrays};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Step {
    ended: usize,
    arrays: StepArrays,
}

#[derive(Debug, Default)]
struct Catalog {
    writers: usize,
    steps: Vec<Step>,
}

impl Catalog {
    /// Steps every writer has ended, in order.
    fn complete(&self) -> usize {
        self.steps
            .iter()
            .take_while(|s| s.ended >= self.writers)
            .count()
    }
}

/// A persisted sequence held in memory.
///
/// Cloning yields another handle to the same sequence.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    catalog: Arc<Mutex<Catalog>>,
}

impl MemoryStore {
    /// An empty sequence that `writers` ranks will contribute to.
    pub fn new(writers: usize) -> Self {
        Self {
            catalog: Arc::new(Mutex::new(Catalog {
                writers: writers.max(1),
                steps: Vec::new(),
            })),
        }
    }

    pub fn writer(&self, rank: usize) -> MemoryWriter {
        MemoryWriter {
            rank,
            catalog: Arc::clone(&self.catalog),
            next: 0,
            open: None,
        }
    }

    pub fn reader(&self) -> MemoryReader {
        MemoryReader {
            catalog: Arc::clone(&self.catalog),
            next: 0,
            open: None,
        }
    }

    /// Number of steps every writer has completed.
    pub fn steps(&self) -> usize {
        lock(&self.catalog).map(|c| c.complete()).unwrap_or(0)
    }
}

fn lock(catalog: &Mutex<Catalog>) -> Result<MutexGuard<'_, Catalog>> {
    catalog
        .lock()
        .map_err(|_| Error::persistence("memory store poisoned by a panicking writer"))
}

pub struct MemoryWriter {
    rank: usize,
    catalog: Arc<Mutex<Catalog>>,
    next: usize,
    open: Option<StepArrays>,
}

impl Persistence for MemoryWriter {
    fn begin_step(&mut self) -> Result<()> {
        if self.open.is_some() {
            return Err(Error::persistence("step already open"));
        }
        self.open = Some(StepArrays::new());
        Ok(())
    }

    fn end_step(&mut self) -> Result<()> {
        let arrays = self
            .open
            .take()
            .ok_or_else(|| Error::persistence("end_step without begin_step"))?;
        let mut catalog = lock(&self.catalog)?;
        while catalog.steps.len() <= self.next {
            catalog.steps.push(Step::default());
        }
        let step = &mut catalog.steps[self.next];
        merge_step(&mut step.arrays, arrays)?;
        step.ended += 1;
        debug!("Rank {} stored step {} in memory", self.rank, self.next);
        self.next += 1;
        Ok(())
    }

    fn write(&mut self, array: &ArrayHandle, data: &[f64]) -> Result<()> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| Error::persistence("write outside a step"))?;
        record_block(open, array, data)
    }

    fn read(&mut self, array: &ArrayHandle, _out: &mut [f64]) -> Result<()> {
        Err(Error::persistence(format!(
            "cannot read '{}' through a writer",
            array.name()
        )))
    }

    fn close(&mut self) -> Result<()> {
        if self.open.is_some() {
            return Err(Error::persistence("close with a step still open"));
        }
        Ok(())
    }
}

pub struct MemoryReader {
    catalog: Arc<Mutex<Catalog>>,
    next: usize,
    open: Option<usize>,
}

impl Persistence for MemoryReader {
    fn begin_step(&mut self) -> Result<()> {
        let complete = lock(&self.catalog)?.complete();
        if self.next >= complete {
            return Err(Error::StepUnavailable(format!(
                "step {} requested, {complete} stored",
                self.next
            )));
        }
        self.open = Some(self.next);
        self.next += 1;
        Ok(())
    }

    fn end_step(&mut self) -> Result<()> {
        self.open
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::persistence("end_step without begin_step"))
    }

    fn write(&mut self, array: &ArrayHandle, _data: &[f64]) -> Result<()> {
        Err(Error::persistence(format!(
            "cannot write '{}' through a reader",
            array.name()
        )))
    }

    fn read(&mut self, array: &ArrayHandle, out: &mut [f64]) -> Result<()> {
        let index = self
            .open
            .ok_or_else(|| Error::persistence("read outside a step"))?;
        let catalog = lock(&self.catalog)?;
        assemble(&catalog.steps[index].arrays, array, out)
    }

    fn close(&mut self) -> Result<()> {
        self.open = None;
        Ok(())
    }
}
