//! Byte-level message delivery between ranks.
//!
//! A [`Transport`] moves opaque payloads from one rank to another, matched by
//! source and tag. Messages between the same pair of ranks with the same tag
//! are delivered in the order they were posted. Everything typed lives one
//! level up in [`crate::world::World`].
//!
//! Backends differ in how far a receiver may skip ahead. [`local`] queues
//! every message, so a `take` may pick any tag that is waiting. [`shm`] holds
//! one message per ordered pair at a time, so each pair must take messages in
//! the order they were posted; a `take` that finds another tag at the head of
//! its slot fails with a communication error. The collectives in
//! [`crate::world::World`] and the halo exchange keep to that order on every
//! rank.

pub mod local;
pub mod shm;

use crate::error::Result;

pub use local::LocalUniverse;
pub use shm::ShmUniverse;

pub trait Transport {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Hands `payload` to `dest`. May return before the receiver has taken it.
    fn post(&self, dest: usize, tag: i32, payload: &[u8]) -> Result<()>;

    /// Blocks until a message with `tag` from `source` arrives.
    ///
    /// See the module docs for which backends allow taking out of order.
    fn take(&self, source: usize, tag: i32) -> Result<Vec<u8>>;

    /// Sends to `dest` and receives from `source` as one operation.
    ///
    /// Either side may be absent. Implementations whose `post` can block on a
    /// slow receiver override this to interleave both directions.
    fn sendrecv(
        &self,
        dest: Option<usize>,
        payload: &[u8],
        source: Option<usize>,
        tag: i32,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(dest) = dest {
            self.post(dest, tag, payload)?;
        }
        source.map(|source| self.take(source, tag)).transpose()
    }

    /// Synchronized shutdown; called once, after the last message.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}
