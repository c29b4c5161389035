//! Ranks as threads of one process.
//!
//! Every ordered pair of ranks owns a mailbox. Posting never blocks; taking
//! waits on the mailbox condition variable. When an endpoint is dropped its
//! rank is marked gone, so a peer waiting on it fails instead of hanging.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;

use super::Transport;
use crate::error::{Error, Result};
use crate::world::World;

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<(i32, Vec<u8>)>>,
    arrived: Condvar,
}

struct Shared {
    size: usize,
    mailboxes: Vec<Mailbox>,
    alive: Vec<AtomicBool>,
}

impl Shared {
    fn mailbox(&self, src: usize, dst: usize) -> &Mailbox {
        &self.mailboxes[src * self.size + dst]
    }
}

/// A set of in-process ranks that can reach each other.
pub struct LocalUniverse {
    shared: Arc<Shared>,
}

impl LocalUniverse {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::config("Size must be positive"));
        }
        let shared = Shared {
            size,
            mailboxes: (0..size * size).map(|_| Mailbox::default()).collect(),
            alive: (0..size).map(|_| AtomicBool::new(true)).collect(),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// One endpoint per rank, in rank order.
    pub fn endpoints(self) -> Vec<LocalEndpoint> {
        (0..self.shared.size)
            .map(|rank| LocalEndpoint {
                rank,
                shared: Arc::clone(&self.shared),
            })
            .collect()
    }

    /// Runs `f` once per rank on its own thread and collects the results in
    /// rank order.
    pub fn run<F, R>(size: usize, f: F) -> Result<Vec<R>>
    where
        F: Fn(World) -> R + Sync,
        R: Send,
    {
        let endpoints = Self::new(size)?.endpoints();
        let f = &f;
        thread::scope(|scope| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|endpoint| {
                    let rank = endpoint.rank;
                    let handle = thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(scope, move || f(World::new(Box::new(endpoint))));
                    (rank, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(rank, handle)| {
                    handle
                        .map_err(|e| Error::ProcessError(format!("spawning rank {rank}: {e}")))?
                        .join()
                        .map_err(|_| Error::ProcessError(format!("rank {rank} panicked")))
                })
                .collect()
        })
    }
}

/// One rank's view of a [`LocalUniverse`].
pub struct LocalEndpoint {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalEndpoint {
    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.shared.size {
            return Err(Error::InvalidRank(rank));
        }
        Ok(())
    }
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn post(&self, dest: usize, tag: i32, payload: &[u8]) -> Result<()> {
        self.check_rank(dest)?;
        if !self.shared.alive[dest].load(Ordering::SeqCst) {
            return Err(Error::comm(format!(
                "rank {} cannot reach rank {dest}: it has shut down",
                self.rank
            )));
        }
        let mailbox = self.shared.mailbox(self.rank, dest);
        let mut queue = mailbox
            .queue
            .lock()
            .map_err(|_| Error::comm("mailbox lock poisoned"))?;
        queue.push_back((tag, payload.to_vec()));
        mailbox.arrived.notify_all();
        Ok(())
    }

    fn take(&self, source: usize, tag: i32) -> Result<Vec<u8>> {
        self.check_rank(source)?;
        let mailbox = self.shared.mailbox(source, self.rank);
        let mut queue = mailbox
            .queue
            .lock()
            .map_err(|_| Error::comm("mailbox lock poisoned"))?;
        loop {
            if let Some(pos) = queue.iter().position(|(t, _)| *t == tag) {
                if let Some((_, payload)) = queue.remove(pos) {
                    return Ok(payload);
                }
            }
            if !self.shared.alive[source].load(Ordering::SeqCst) {
                return Err(Error::comm(format!(
                    "rank {source} shut down before sending tag {tag} to rank {}",
                    self.rank
                )));
            }
            queue = mailbox
                .arrived
                .wait(queue)
                .map_err(|_| Error::comm("mailbox lock poisoned"))?;
        }
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.shared.alive[self.rank].store(false, Ordering::SeqCst);
        // Wake every receiver that might be waiting on this rank.
        for dst in 0..self.shared.size {
            let mailbox = self.shared.mailbox(self.rank, dst);
            if let Ok(_queue) = mailbox.queue.lock() {
                mailbox.arrived.notify_all();
            }
        }
        debug!("Rank {} left the local universe", self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_by_tag_in_order() {
        let mut endpoints = LocalUniverse::new(2).unwrap().endpoints();
        let b = endpoints.pop().unwrap();
        let a = endpoints.pop().unwrap();
        a.post(1, 7, b"first").unwrap();
        a.post(1, 9, b"other").unwrap();
        a.post(1, 7, b"second").unwrap();
        assert_eq!(b.take(0, 9).unwrap(), b"other");
        assert_eq!(b.take(0, 7).unwrap(), b"first");
        assert_eq!(b.take(0, 7).unwrap(), b"second");
    }

    #[test]
    fn self_messages_are_delivered() {
        let endpoints = LocalUniverse::new(1).unwrap().endpoints();
        endpoints[0].post(0, 3, &[1, 2, 3]).unwrap();
        assert_eq!(endpoints[0].take(0, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn receiving_from_departed_rank_fails() {
        let mut endpoints = LocalUniverse::new(2).unwrap().endpoints();
        let b = endpoints.pop().unwrap();
        let a = endpoints.pop().unwrap();
        a.post(1, 1, b"last words").unwrap();
        drop(a);
        assert_eq!(b.take(0, 1).unwrap(), b"last words");
        assert!(matches!(b.take(0, 1), Err(Error::CommunicationFailure(_))));
        assert!(matches!(b.post(0, 1, b"x"), Err(Error::CommunicationFailure(_))));
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        let endpoints = LocalUniverse::new(2).unwrap().endpoints();
        assert!(matches!(endpoints[0].post(5, 0, b""), Err(Error::InvalidRank(5))));
    }

    #[test]
    fn run_collects_results_in_rank_order() {
        let ranks = LocalUniverse::run(4, |world| world.rank() * 10).unwrap();
        assert_eq!(ranks, vec![0, 10, 20, 30]);
    }
}
