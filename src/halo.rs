//! Ghost-layer exchange between face neighbors.
//!
//! Each axis is exchanged as two shifts. Shifting toward minus, every rank
//! sends its first interior slab to the minus neighbor and fills its upper
//! ghost slab from the plus neighbor; shifting toward plus does the reverse.
//! One shift is a single send/receive, so a whole face arrives or the
//! exchange fails; the stepper never sees half a face.
//!
//! Only face slabs travel (YZ, XZ and XY planes); edges and corners are never
//! read by the 7-point stencil.

use log::debug;

use crate::decomposition::{Axis, Face, Neighbors, ProcessTopology, Side};
use crate::error::{Error, Result};
use crate::field::{Field, FieldStore};
use crate::world::World;

const HALO_TAG_BASE: i32 = 100;

fn tag(axis: Axis, toward: Side) -> i32 {
    HALO_TAG_BASE + 2 * axis.index() as i32 + toward as i32
}

/// The two axes spanning the plane normal to `axis`, lower first.
fn plane_axes(axis: Axis) -> (usize, usize) {
    match axis {
        Axis::X => (1, 2),
        Axis::Y => (0, 2),
        Axis::Z => (0, 1),
    }
}

/// Number of cells in one face slab normal to `axis`.
pub fn face_len(field: &Field, axis: Axis) -> usize {
    let (a, b) = plane_axes(axis);
    field.size()[a] * field.size()[b]
}

/// Copies the slab at padded position `at` along `axis` (interior of the
/// plane only) into a contiguous buffer.
pub fn pack_face(field: &Field, axis: Axis, at: usize) -> Vec<f64> {
    let (a, b) = plane_axes(axis);
    let size = field.size();
    let data = field.data();
    let mut out = Vec::with_capacity(size[a] * size[b]);
    for j in 1..=size[b] {
        for i in 1..=size[a] {
            let mut c = [0; 3];
            c[axis.index()] = at;
            c[a] = i;
            c[b] = j;
            out.push(data[field.index(c[0], c[1], c[2])]);
        }
    }
    out
}

/// Inverse of [`pack_face`].
pub fn unpack_face(field: &mut Field, axis: Axis, at: usize, values: &[f64]) -> Result<()> {
    let expected = face_len(field, axis);
    if values.len() != expected {
        return Err(Error::comm(format!(
            "{} face holds {} values, expected {expected}",
            axis.plane(),
            values.len()
        )));
    }
    let (a, b) = plane_axes(axis);
    let size = field.size();
    let mut values = values.iter();
    for j in 1..=size[b] {
        for i in 1..=size[a] {
            let mut c = [0; 3];
            c[axis.index()] = at;
            c[a] = i;
            c[b] = j;
            let idx = field.index(c[0], c[1], c[2]);
            if let Some(&v) = values.next() {
                field.data_mut()[idx] = v;
            }
        }
    }
    Ok(())
}

/// Fills ghost layers of one rank's fields from its neighbors.
#[derive(Debug, Clone)]
pub struct HaloExchange {
    rank: usize,
    neighbors: Neighbors,
}

impl HaloExchange {
    /// Binds a topology to the world it will talk over.
    pub fn new(world: &World, topology: &ProcessTopology) -> Result<Self> {
        if topology.procs != world.size() || topology.rank != world.rank() {
            return Err(Error::comm(format!(
                "topology mismatch: topology is rank {} of {}, world is rank {} of {}",
                topology.rank,
                topology.procs,
                world.rank(),
                world.size()
            )));
        }
        for (face, neighbor) in topology.neighbors.iter() {
            if neighbor.is_some_and(|n| n >= world.size()) {
                return Err(Error::comm(format!(
                    "topology mismatch: {} neighbor {:?} outside world of {}",
                    face.name(),
                    neighbor,
                    world.size()
                )));
            }
        }
        Ok(Self {
            rank: topology.rank,
            neighbors: topology.neighbors,
        })
    }

    /// Populates all six ghost faces of `field`.
    ///
    /// Blocks until every face this rank receives has arrived. Faces without
    /// a neighbor mirror the adjacent interior slab (zero normal flux).
    pub fn exchange(&self, world: &World, field: &mut Field) -> Result<()> {
        for axis in Axis::ALL {
            self.shift(world, field, axis, Side::Minus)?;
            self.shift(world, field, axis, Side::Plus)?;
        }
        Ok(())
    }

    /// Exchanges U, then V.
    pub fn exchange_all(&self, world: &World, fields: &mut FieldStore) -> Result<()> {
        self.exchange(world, &mut fields.u)?;
        self.exchange(world, &mut fields.v)
    }

    fn shift(&self, world: &World, field: &mut Field, axis: Axis, toward: Side) -> Result<()> {
        let s = field.size()[axis.index()];
        let (send_at, recv_at) = match toward {
            Side::Minus => (1, s + 1),
            Side::Plus => (s, 0),
        };
        let dest = self.neighbors.get(Face::new(axis, toward));
        let source = self.neighbors.get(Face::new(axis, toward.opposite()));

        let incoming = match (dest, source) {
            (Some(d), Some(src)) if d == self.rank && src == self.rank => {
                Some(pack_face(field, axis, send_at))
            }
            (None, None) => None,
            _ => {
                let outgoing = match dest {
                    Some(_) => pack_face(field, axis, send_at),
                    None => Vec::new(),
                };
                debug!(
                    "Rank {} shifting {} faces toward {:?}: to {:?}, from {:?}",
                    self.rank,
                    axis.plane(),
                    toward,
                    dest,
                    source
                );
                world.sendrecv_values(
                    &outgoing,
                    dest,
                    source,
                    tag(axis, toward),
                    face_len(field, axis),
                )?
            }
        };

        let values = match incoming {
            Some(values) => values,
            None => {
                // No neighbor on the receiving side: mirror the interior.
                let mirror = if recv_at == 0 { 1 } else { s };
                pack_face(field, axis, mirror)
            }
        };
        unpack_face(field, axis, recv_at, &values)
    }
}
