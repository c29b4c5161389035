//! The set of ranks taking part in one run.
//!
//! [`World`] gives a rank its identity and the typed message passing the
//! engine needs: point-to-point messages, a combined send/receive for halo
//! shifts, and a handful of collectives. Payload delivery is delegated to a
//! [`Transport`], so the same engine runs with ranks as threads of one process
//! ([`crate::transport::LocalUniverse`]) or as separate processes
//! ([`crate::transport::ShmUniverse`]).

use log::debug;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};
use crate::transport::Transport;

const BARRIER_ARRIVE_TAG: i32 = -1;
const BARRIER_COMPLETE_TAG: i32 = -2;
const BROADCAST_TAG: i32 = -3;
const GATHER_TAG: i32 = -4;

/// Message passing among all ranks of a run.
///
/// # Examples
///
/// Point-to-point between two in-process ranks:
/// ```rust
/// use grayscott_mpi::transport::LocalUniverse;
///
/// let results = LocalUniverse::run(2, |world| {
///     if world.rank() == 0 {
///         world.send(&42u32, 1, 0).unwrap();
///         0
///     } else {
///         world.recv::<u32>(0, 0).unwrap()
///     }
/// })
/// .unwrap();
/// assert_eq!(results, vec![0, 42]);
/// ```
pub struct World {
    rank: usize,
    size: usize,
    transport: Box<dyn Transport>,
}

impl World {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            rank: transport.rank(),
            size: transport.size(),
            transport,
        }
    }

    /// The rank of this process, between 0 and `size() - 1`.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The total number of ranks. Constant for the lifetime of the World.
    pub fn size(&self) -> usize {
        self.size
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.size {
            return Err(Error::InvalidRank(rank));
        }
        Ok(())
    }

    /// Serializes `data` and sends it to `dest`.
    ///
    /// Tags must be non-negative; negative tags are reserved for collectives.
    pub fn send<T: Serialize>(&self, data: &T, dest: usize, tag: i32) -> Result<()> {
        self.check_rank(dest)?;
        debug!("Rank {} sending to rank {} with tag {}", self.rank, dest, tag);
        let serialized = bincode::serialize(data)?;
        self.transport.post(dest, tag, &serialized)
    }

    /// Blocks until a message with `tag` arrives from `source` and
    /// deserializes it.
    pub fn recv<T: DeserializeOwned>(&self, source: usize, tag: i32) -> Result<T> {
        self.check_rank(source)?;
        debug!("Rank {} receiving from rank {} with tag {}", self.rank, source, tag);
        let bytes = self.transport.take(source, tag)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Sends a slice of doubles as raw bytes, without serialization framing.
    pub fn send_values(&self, values: &[f64], dest: usize, tag: i32) -> Result<()> {
        self.check_rank(dest)?;
        self.transport.post(dest, tag, bytemuck::cast_slice(values))
    }

    /// Receives exactly `expected` doubles from `source`.
    pub fn recv_values(&self, source: usize, tag: i32, expected: usize) -> Result<Vec<f64>> {
        self.check_rank(source)?;
        let bytes = self.transport.take(source, tag)?;
        decode_values(&bytes, source, expected)
    }

    /// Sends `values` to `dest` while receiving `expected` doubles from
    /// `source`, either of which may be absent.
    ///
    /// This is the building block of a halo shift: every rank sends one way
    /// along an axis and receives from the other way.
    pub fn sendrecv_values(
        &self,
        values: &[f64],
        dest: Option<usize>,
        source: Option<usize>,
        tag: i32,
        expected: usize,
    ) -> Result<Option<Vec<f64>>> {
        if let Some(dest) = dest {
            self.check_rank(dest)?;
        }
        if let Some(source) = source {
            self.check_rank(source)?;
        }
        let received = self
            .transport
            .sendrecv(dest, bytemuck::cast_slice(values), source, tag)?;
        match (received, source) {
            (Some(bytes), Some(source)) => Ok(Some(decode_values(&bytes, source, expected)?)),
            _ => Ok(None),
        }
    }

    /// Blocks until every rank has reached the barrier.
    pub fn barrier(&self) -> Result<()> {
        debug!("Rank {} entering barrier", self.rank);

        // First phase: everyone reports to root
        if self.rank == 0 {
            for rank in 1..self.size {
                self.transport.take(rank, BARRIER_ARRIVE_TAG)?;
            }
        } else {
            self.transport.post(0, BARRIER_ARRIVE_TAG, &[])?;
        }

        // Second phase: root releases everyone
        if self.rank == 0 {
            for rank in 1..self.size {
                self.transport.post(rank, BARRIER_COMPLETE_TAG, &[])?;
            }
        } else {
            self.transport.take(0, BARRIER_COMPLETE_TAG)?;
        }

        debug!("Rank {} exiting barrier", self.rank);
        Ok(())
    }

    /// Every rank returns the value `root` passed in.
    pub fn broadcast<T: Serialize + DeserializeOwned + Clone>(
        &self,
        data: &T,
        root: usize,
    ) -> Result<T> {
        self.check_rank(root)?;
        if self.rank == root {
            let serialized = bincode::serialize(data)?;
            for rank in (0..self.size).filter(|&r| r != root) {
                self.transport.post(rank, BROADCAST_TAG, &serialized)?;
            }
            Ok(data.clone())
        } else {
            let bytes = self.transport.take(root, BROADCAST_TAG)?;
            Ok(bincode::deserialize(&bytes)?)
        }
    }

    /// Collects one value per rank on `root`, in rank order.
    ///
    /// Returns `Some` on root and `None` everywhere else.
    pub fn gather<T: Serialize + DeserializeOwned + Clone>(
        &self,
        data: &T,
        root: usize,
    ) -> Result<Option<Vec<T>>> {
        self.check_rank(root)?;
        if self.rank == root {
            let mut result = Vec::with_capacity(self.size);
            for rank in 0..self.size {
                if rank == root {
                    result.push(data.clone());
                } else {
                    let bytes = self.transport.take(rank, GATHER_TAG)?;
                    result.push(bincode::deserialize(&bytes)?);
                }
            }
            Ok(Some(result))
        } else {
            let serialized = bincode::serialize(data)?;
            self.transport.post(root, GATHER_TAG, &serialized)?;
            Ok(None)
        }
    }

    /// Gathers on rank 0, folds there, broadcasts the result back.
    fn all_reduce(&self, local: f64, fold: fn(f64, f64) -> f64) -> Result<f64> {
        let reduced = self
            .gather(&local, 0)?
            .and_then(|values| values.into_iter().reduce(fold))
            .unwrap_or(local);
        self.broadcast(&reduced, 0)
    }

    pub fn all_reduce_sum(&self, local: f64) -> Result<f64> {
        self.all_reduce(local, |a, b| a + b)
    }

    pub fn all_reduce_min(&self, local: f64) -> Result<f64> {
        self.all_reduce(local, f64::min)
    }

    pub fn all_reduce_max(&self, local: f64) -> Result<f64> {
        self.all_reduce(local, f64::max)
    }

    /// Synchronized shutdown. Call once every rank is done communicating.
    pub fn finalize(mut self) -> Result<()> {
        debug!("Rank {} finalizing", self.rank);
        self.transport.finalize()
    }
}

fn decode_values(bytes: &[u8], source: usize, expected: usize) -> Result<Vec<f64>> {
    let width = std::mem::size_of::<f64>();
    if bytes.len() != expected * width {
        return Err(Error::comm(format!(
            "topology mismatch: expected {expected} values from rank {source}, got {} bytes",
            bytes.len()
        )));
    }
    let mut values = vec![0.0f64; expected];
    bytemuck::cast_slice_mut::<f64, u8>(&mut values).copy_from_slice(bytes);
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalUniverse;

    #[test]
    fn typed_point_to_point() {
        let got = LocalUniverse::run(2, |world| {
            if world.rank() == 0 {
                world.send(&"Hello from rank 0".to_string(), 1, 0).unwrap();
                None
            } else {
                Some(world.recv::<String>(0, 0).unwrap())
            }
        })
        .unwrap();
        assert_eq!(got[1].as_deref(), Some("Hello from rank 0"));
    }

    #[test]
    fn raw_values_keep_bit_patterns() {
        let values = vec![1.5, -0.0, f64::MIN_POSITIVE, 1e300];
        let expected = values.clone();
        let got = LocalUniverse::run(2, |world| {
            if world.rank() == 0 {
                world.send_values(&values, 1, 4).unwrap();
                Vec::new()
            } else {
                world.recv_values(0, 4, 4).unwrap()
            }
        })
        .unwrap();
        assert_eq!(got[1].len(), 4);
        for (a, b) in got[1].iter().zip(&expected) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn wrong_length_is_a_topology_mismatch() {
        let got = LocalUniverse::run(2, |world| {
            if world.rank() == 0 {
                world.send_values(&[1.0, 2.0], 1, 0).map(|_| ())
            } else {
                world.recv_values(0, 0, 3).map(|_| ())
            }
        })
        .unwrap();
        assert!(got[0].is_ok());
        assert!(matches!(got[1], Err(Error::CommunicationFailure(_))));
    }

    #[test]
    fn ring_sendrecv() {
        let got = LocalUniverse::run(4, |world| {
            let size = world.size();
            let right = (world.rank() + 1) % size;
            let left = (world.rank() + size - 1) % size;
            world
                .sendrecv_values(&[world.rank() as f64], Some(right), Some(left), 11, 1)
                .unwrap()
                .unwrap()[0]
        })
        .unwrap();
        assert_eq!(got, vec![3.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn collectives() {
        let got = LocalUniverse::run(4, |world| {
            world.barrier().unwrap();
            let root_value = world.broadcast(&(world.rank() * 100 + 7), 2).unwrap();
            let gathered = world.gather(&world.rank(), 0).unwrap();
            let sum = world.all_reduce_sum(world.rank() as f64 + 1.0).unwrap();
            let min = world.all_reduce_min(world.rank() as f64).unwrap();
            let max = world.all_reduce_max(world.rank() as f64).unwrap();
            (root_value, gathered, sum, min, max)
        })
        .unwrap();
        for (rank, (root_value, gathered, sum, min, max)) in got.into_iter().enumerate() {
            assert_eq!(root_value, 207);
            if rank == 0 {
                assert_eq!(gathered, Some(vec![0, 1, 2, 3]));
            } else {
                assert_eq!(gathered, None);
            }
            assert_eq!(sum, 10.0);
            assert_eq!(min, 0.0);
            assert_eq!(max, 3.0);
        }
    }

    #[test]
    fn invalid_rank_is_rejected() {
        let got = LocalUniverse::run(1, |world| world.send(&1u8, 3, 0)).unwrap();
        assert!(matches!(got[0], Err(Error::InvalidRank(3))));
    }
}
