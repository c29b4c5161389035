//! Snapshots of U and V through a [`Persistence`] collaborator.
//!
//! A snapshot holds three arrays: `u` and `v` with global shape `[L, L, L]`,
//! each rank contributing its ghost-stripped interior at its global offset,
//! and `step`, a single value written by the rank that owns the origin cell.
//! Selections are global, so a snapshot written by one process grid can be
//! restored onto any other with the same L.

use log::{debug, info};

use crate::decomposition::LocalDomain;
use crate::error::{Error, Result};
use crate::field::Field;
use crate::store::{ArrayHandle, ElementType, Persistence};

/// Interior cells of `field`, x fastest, ghosts dropped.
pub fn strip_ghosts(field: &Field) -> Vec<f64> {
    let mut out = Vec::with_capacity(field.size().iter().product());
    field.for_each_interior(|_, v| out.push(v));
    out
}

/// A ghost-padded field whose interior is `interior`; ghosts are zero.
pub fn insert_ghosts(size: [usize; 3], interior: &[f64]) -> Result<Field> {
    let cells: usize = size.iter().product();
    if interior.len() != cells {
        return Err(Error::persistence(format!(
            "{} values for an interior of {size:?}",
            interior.len()
        )));
    }
    let mut field = Field::zeros(size);
    let mut values = interior.iter();
    field.for_each_interior_mut(|_, cell| {
        if let Some(&v) = values.next() {
            *cell = v;
        }
    });
    Ok(field)
}

fn field_arrays(
    store: &mut dyn Persistence,
    domain: &LocalDomain,
) -> Result<(ArrayHandle, ArrayHandle)> {
    let global = [domain.global; 3];
    let u = store.define_array("u", global, domain.offset, domain.size, ElementType::F64)?;
    let v = store.define_array("v", global, domain.offset, domain.size, ElementType::F64)?;
    Ok((u, v))
}

fn step_array(store: &mut dyn Persistence) -> Result<ArrayHandle> {
    store.define_array("step", [1, 1, 1], [0, 0, 0], [1, 1, 1], ElementType::F64)
}

/// Writes snapshots of one rank's fields.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    u: ArrayHandle,
    v: ArrayHandle,
    step: Option<ArrayHandle>,
    size: [usize; 3],
}

impl Checkpointer {
    /// Defines the snapshot arrays on `store` for this rank's selection.
    pub fn new(store: &mut dyn Persistence, domain: &LocalDomain) -> Result<Self> {
        let (u, v) = field_arrays(store, domain)?;
        let step = if domain.contains_global([0, 0, 0]) {
            Some(step_array(store)?)
        } else {
            None
        };
        Ok(Self {
            u,
            v,
            step,
            size: domain.size,
        })
    }

    /// Appends one step holding `u`, `v` and the step number.
    pub fn checkpoint(
        &self,
        store: &mut dyn Persistence,
        u: &Field,
        v: &Field,
        step: u64,
    ) -> Result<()> {
        if u.size() != self.size || v.size() != self.size {
            return Err(Error::persistence(format!(
                "fields of {:?} for a selection of {:?}",
                u.size(),
                self.size
            )));
        }
        store.begin_step()?;
        store.write(&self.u, &strip_ghosts(u))?;
        store.write(&self.v, &strip_ghosts(v))?;
        if let Some(handle) = &self.step {
            store.write(handle, &[step as f64])?;
        }
        store.end_step()?;
        debug!("Snapshot of step {} written", step);
        Ok(())
    }
}

/// One-shot form of [`Checkpointer::checkpoint`].
pub fn checkpoint(
    store: &mut dyn Persistence,
    domain: &LocalDomain,
    u: &Field,
    v: &Field,
    step: u64,
) -> Result<()> {
    Checkpointer::new(store, domain)?.checkpoint(store, u, v, step)
}

/// Fields and step number read back from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Restored {
    pub u: Field,
    pub v: Field,
    pub step: u64,
}

/// Reads the next stored step restricted to `domain`.
///
/// Fails with [`Error::StepUnavailable`] once the sequence is exhausted.
pub fn restore(store: &mut dyn Persistence, domain: &LocalDomain) -> Result<Restored> {
    let (u_handle, v_handle) = field_arrays(store, domain)?;
    let step_handle = step_array(store)?;

    store.begin_step()?;
    let mut u = vec![0.0; u_handle.len()];
    let mut v = vec![0.0; v_handle.len()];
    let mut step = [0.0];
    store.read(&u_handle, &mut u)?;
    store.read(&v_handle, &mut v)?;
    store.read(&step_handle, &mut step)?;
    store.end_step()?;

    if !(step[0] >= 0.0) || step[0].fract() != 0.0 {
        return Err(Error::persistence(format!("stored step {} is not a step number", step[0])));
    }
    Ok(Restored {
        u: insert_ghosts(domain.size, &u)?,
        v: insert_ghosts(domain.size, &v)?,
        step: step[0] as u64,
    })
}

/// Reads every remaining step and keeps the last.
pub fn restore_latest(store: &mut dyn Persistence, domain: &LocalDomain) -> Result<Restored> {
    let mut latest = None;
    loop {
        match restore(store, domain) {
            Ok(restored) => latest = Some(restored),
            Err(Error::StepUnavailable(_)) => break,
            Err(e) => return Err(e),
        }
    }
    let restored = latest.ok_or_else(|| Error::persistence("no snapshot to restore"))?;
    info!("Restored snapshot of step {}", restored.step);
    Ok(restored)
}
