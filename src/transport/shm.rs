//! Ranks as OS processes sharing one memory segment.
//!
//! Rank 0 creates a POSIX shared-memory segment, then re-executes the current
//! binary with the same arguments to start ranks 1..n. Children find the
//! segment through an environment variable and claim a rank by swapping their
//! pid into an empty slot of the pid table.
//!
//! Every ordered pair of ranks owns one frame slot. A message larger than a
//! frame is streamed through the slot frame by frame, so `post` blocks while
//! the receiver drains it; [`Transport::sendrecv`] interleaves both directions
//! so two ranks exchanging large faces with each other never wait on each
//! other.
//!
//! Because a slot holds one message at a time, the receiver must take messages
//! from each peer in the order they were posted. A frame with an unexpected
//! tag is reported as an error rather than waited past.
//!
//! # Layout
//!
//! ```text
//! | SegmentHeader | slot(0→0) | slot(0→1) | ... | slot(n-1→n-1) |
//! slot = | FrameHeader | FRAME_CAPACITY bytes |
//! ```

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

static SEGMENTS: AtomicUsize = AtomicUsize::new(0);

use log::debug;
use shared_memory::{Shmem, ShmemConf};

use super::Transport;
use crate::error::{Error, Result};
use crate::world::World;

/// Upper bound on ranks; the pid and flag tables are fixed-size.
pub const MAX_RANKS: usize = 32;
const FRAME_CAPACITY: usize = 256 * 1024;
const SEGMENT_ENV: &str = "GRAYSCOTT_SHM_SEGMENT";
const SPINS_BEFORE_YIELD: u32 = 1 << 10;

#[repr(C)]
struct SegmentHeader {
    size: AtomicUsize,
    pids: [AtomicUsize; MAX_RANKS],
    ready: [AtomicBool; MAX_RANKS],
    finished: [AtomicBool; MAX_RANKS],
}

#[repr(C)]
struct FrameHeader {
    full: AtomicBool,
    last: AtomicBool,
    tag: AtomicI32,
    len: AtomicUsize,
}

const SLOT_SIZE: usize = std::mem::size_of::<FrameHeader>() + FRAME_CAPACITY;

fn segment_size(size: usize) -> usize {
    std::mem::size_of::<SegmentHeader>() + size * size * SLOT_SIZE
}

fn slot_offset(size: usize, src: usize, dst: usize) -> usize {
    std::mem::size_of::<SegmentHeader>() + (src * size + dst) * SLOT_SIZE
}

/// Splits a payload into frames; an empty payload is still one frame.
fn frames(payload: &[u8]) -> Vec<&[u8]> {
    if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(FRAME_CAPACITY).collect()
    }
}

/// Busy-waits on `ready`, yielding to the scheduler now and then.
fn spin_until(mut ready: impl FnMut() -> Result<bool>) -> Result<()> {
    let mut spins = 0u32;
    while !ready()? {
        spins = spins.wrapping_add(1);
        if spins % SPINS_BEFORE_YIELD == 0 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
    Ok(())
}

/// Entry point of the multi-process launcher.
pub struct ShmUniverse;

impl ShmUniverse {
    /// Joins (or, in the launching process, creates) a universe of `size`
    /// processes and returns this process' [`World`].
    ///
    /// The launching process becomes rank 0 and does not return until every
    /// child has claimed a rank.
    pub fn init(size: usize) -> Result<World> {
        if size == 0 {
            return Err(Error::config("Size must be positive"));
        }
        if size > MAX_RANKS {
            return Err(Error::config(format!(
                "At most {MAX_RANKS} processes are supported, got {size}"
            )));
        }
        let endpoint = match std::env::var_os(SEGMENT_ENV) {
            Some(path) => ShmEndpoint::join(size, PathBuf::from(path))?,
            None => ShmEndpoint::launch(size)?,
        };
        Ok(World::new(Box::new(endpoint)))
    }

    /// True in processes started by the launcher.
    pub fn is_child() -> bool {
        std::env::var_os(SEGMENT_ENV).is_some()
    }
}

pub struct ShmEndpoint {
    rank: usize,
    size: usize,
    shmem: Shmem,
    children: Vec<Child>,
}

impl ShmEndpoint {
    fn launch(size: usize) -> Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "grayscott-{}-{}.shm",
            std::process::id(),
            SEGMENTS.fetch_add(1, Ordering::SeqCst)
        ));
        debug!("Creating shared memory of size {} at {:?}", segment_size(size), path);

        let shmem = ShmemConf::new()
            .size(segment_size(size))
            .flink(&path)
            .create()
            .map_err(|e| Error::SharedMemoryError(e.to_string()))?;

        let mut endpoint = Self {
            rank: 0,
            size,
            shmem,
            children: Vec::with_capacity(size.saturating_sub(1)),
        };
        let header = endpoint.header();
        header.size.store(size, Ordering::SeqCst);
        header.pids[0].store(std::process::id() as usize, Ordering::SeqCst);
        header.ready[0].store(true, Ordering::SeqCst);

        let exe = std::env::current_exe()?;
        for _ in 1..size {
            let child = Command::new(&exe)
                .args(std::env::args_os().skip(1))
                .env(SEGMENT_ENV, &path)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| Error::ProcessError(e.to_string()))?;
            endpoint.children.push(child);
        }

        debug!("Parent process initialized as rank 0");
        endpoint.wait_all_ready()?;
        Ok(endpoint)
    }

    fn join(size: usize, path: PathBuf) -> Result<Self> {
        debug!("Spawned process joining {:?}", path);
        let shmem = ShmemConf::new()
            .flink(&path)
            .open()
            .map_err(|e| Error::SharedMemoryError(e.to_string()))?;
        if shmem.len() < segment_size(size) {
            return Err(Error::SharedMemoryError(format!(
                "segment holds {} bytes, {size} ranks need {}",
                shmem.len(),
                segment_size(size)
            )));
        }

        let mut endpoint = Self {
            rank: 0,
            size,
            shmem,
            children: Vec::new(),
        };
        let header = endpoint.header();
        let launched = header.size.load(Ordering::SeqCst);
        if launched != size {
            return Err(Error::config(format!(
                "launcher started {launched} ranks but this process expects {size}"
            )));
        }

        let pid = std::process::id() as usize;
        let rank = (1..size)
            .find(|&r| {
                header.pids[r]
                    .compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            })
            .ok_or_else(|| Error::ProcessError(format!("No available ranks for process {pid}")))?;
        header.ready[rank].store(true, Ordering::SeqCst);
        endpoint.rank = rank;

        debug!("Process {} initialized as rank {}", pid, rank);
        endpoint.wait_all_ready()?;
        Ok(endpoint)
    }

    fn header(&self) -> &SegmentHeader {
        // The segment starts with a SegmentHeader; zeroed memory is a valid
        // value for every atomic in it.
        unsafe { &*(self.shmem.as_ptr() as *const SegmentHeader) }
    }

    fn slot(&self, src: usize, dst: usize) -> (&FrameHeader, *mut u8) {
        unsafe {
            let base = self.shmem.as_ptr().add(slot_offset(self.size, src, dst));
            let frame = &*(base as *const FrameHeader);
            (frame, base.add(std::mem::size_of::<FrameHeader>()))
        }
    }

    fn wait_all_ready(&self) -> Result<()> {
        let header = self.header();
        spin_until(|| Ok((0..self.size).all(|r| header.ready[r].load(Ordering::SeqCst))))
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.size {
            return Err(Error::InvalidRank(rank));
        }
        Ok(())
    }

    /// Fails if `peer` has left while we still expect to talk to it.
    fn check_alive(&self, peer: usize) -> Result<()> {
        if peer != self.rank && self.header().finished[peer].load(Ordering::SeqCst) {
            return Err(Error::comm(format!(
                "rank {peer} has shut down while rank {} waits on it",
                self.rank
            )));
        }
        Ok(())
    }

    fn try_write_frame(&self, dest: usize, tag: i32, chunk: &[u8], last: bool) -> Result<bool> {
        let (frame, data) = self.slot(self.rank, dest);
        if frame.full.load(Ordering::SeqCst) {
            self.check_alive(dest)?;
            return Ok(false);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(chunk.as_ptr(), data, chunk.len());
        }
        frame.tag.store(tag, Ordering::SeqCst);
        frame.len.store(chunk.len(), Ordering::SeqCst);
        frame.last.store(last, Ordering::SeqCst);
        frame.full.store(true, Ordering::SeqCst);
        Ok(true)
    }

    /// Appends the next frame from `source` to `out`; returns whether it was
    /// the last one, or `None` if nothing is waiting yet.
    fn try_read_frame(&self, source: usize, tag: i32, out: &mut Vec<u8>) -> Result<Option<bool>> {
        let (frame, data) = self.slot(source, self.rank);
        if !frame.full.load(Ordering::SeqCst) {
            self.check_alive(source)?;
            return Ok(None);
        }
        let pending = frame.tag.load(Ordering::SeqCst);
        if pending != tag {
            return Err(Error::comm(format!(
                "rank {} expects tag {tag} from rank {source}, but tag {pending} was posted first",
                self.rank
            )));
        }
        let len = frame.len.load(Ordering::SeqCst);
        if len > FRAME_CAPACITY {
            return Err(Error::comm(format!("corrupt frame of {len} bytes from rank {source}")));
        }
        let last = frame.last.load(Ordering::SeqCst);
        out.extend_from_slice(unsafe { std::slice::from_raw_parts(data, len) });
        frame.full.store(false, Ordering::SeqCst);
        Ok(Some(last))
    }
}

impl Transport for ShmEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn post(&self, dest: usize, tag: i32, payload: &[u8]) -> Result<()> {
        self.check_rank(dest)?;
        debug!("Rank {} sending to rank {} with tag {}", self.rank, dest, tag);
        let frames = frames(payload);
        let count = frames.len();
        for (i, chunk) in frames.into_iter().enumerate() {
            spin_until(|| self.try_write_frame(dest, tag, chunk, i + 1 == count))?;
        }
        Ok(())
    }

    fn take(&self, source: usize, tag: i32) -> Result<Vec<u8>> {
        self.check_rank(source)?;
        debug!("Rank {} receiving from rank {} with tag {}", self.rank, source, tag);
        let mut out = Vec::new();
        let mut done = false;
        while !done {
            spin_until(|| match self.try_read_frame(source, tag, &mut out)? {
                Some(last) => {
                    done = last;
                    Ok(true)
                }
                None => Ok(false),
            })?;
        }
        Ok(out)
    }

    fn sendrecv(
        &self,
        dest: Option<usize>,
        payload: &[u8],
        source: Option<usize>,
        tag: i32,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(dest) = dest {
            self.check_rank(dest)?;
        }
        if let Some(source) = source {
            self.check_rank(source)?;
        }
        let outgoing = frames(payload);
        let mut sent = if dest.is_some() { 0 } else { outgoing.len() };
        let mut received = source.map(|_| Vec::new());
        let mut receiving = source.is_some();

        spin_until(|| {
            if let Some(dest) = dest {
                if sent < outgoing.len()
                    && self.try_write_frame(dest, tag, outgoing[sent], sent + 1 == outgoing.len())?
                {
                    sent += 1;
                }
            }
            if let (Some(source), Some(buf)) = (source, received.as_mut()) {
                if receiving {
                    if let Some(last) = self.try_read_frame(source, tag, buf)? {
                        receiving = !last;
                    }
                }
            }
            Ok(sent == outgoing.len() && !receiving)
        })?;
        Ok(received)
    }

    fn finalize(&mut self) -> Result<()> {
        let header = self.header();
        header.finished[self.rank].store(true, Ordering::SeqCst);
        spin_until(|| Ok((0..self.size).all(|r| header.finished[r].load(Ordering::SeqCst))))?;

        if self.rank == 0 {
            debug!("Parent process waiting for children to finish");
            for mut child in self.children.drain(..) {
                let status = child.wait()?;
                if !status.success() {
                    return Err(Error::ProcessError(format!(
                        "child process {} exited with {status}",
                        child.id()
                    )));
                }
            }
        }
        debug!("Process {} finished", self.rank);
        Ok(())
    }
}

impl Drop for ShmEndpoint {
    fn drop(&mut self) {
        // Peers still waiting on this rank must see that it is gone.
        self.header().finished[self.rank].store(true, Ordering::SeqCst);
        for mut child in self.children.drain(..) {
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_do_not_overlap() {
        let size = 4;
        let header = std::mem::size_of::<SegmentHeader>();
        assert_eq!(slot_offset(size, 0, 0), header);
        assert_eq!(slot_offset(size, 0, 1) - slot_offset(size, 0, 0), SLOT_SIZE);
        assert_eq!(slot_offset(size, 3, 3) + SLOT_SIZE, segment_size(size));
        assert_eq!(SLOT_SIZE % std::mem::align_of::<FrameHeader>(), 0);
        assert_eq!(header % std::mem::align_of::<FrameHeader>(), 0);
    }

    #[test]
    fn large_payloads_are_framed() {
        assert_eq!(frames(&[]).len(), 1);
        let payload = vec![7u8; FRAME_CAPACITY * 2 + 5];
        let parts = frames(&payload);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 5);
    }

    #[test]
    fn rank_limit_is_enforced() {
        assert!(matches!(
            ShmUniverse::init(MAX_RANKS + 1),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(ShmUniverse::init(0), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn streams_a_multi_frame_message_to_itself() {
        let mut endpoint = ShmEndpoint::launch(1).unwrap();
        assert_eq!((endpoint.rank(), endpoint.size()), (0, 1));

        let payload: Vec<u8> = (0..FRAME_CAPACITY * 2 + 17).map(|i| (i % 251) as u8).collect();
        let got = endpoint
            .sendrecv(Some(0), &payload, Some(0), 9)
            .unwrap()
            .unwrap();
        assert_eq!(got, payload);

        // Single-frame messages fit the slot without a waiting receiver.
        endpoint.post(0, 3, b"first").unwrap();
        assert_eq!(endpoint.take(0, 3).unwrap(), b"first");
        endpoint.post(0, 4, &[]).unwrap();
        assert!(endpoint.take(0, 4).unwrap().is_empty());

        assert_eq!(endpoint.sendrecv(None, &[], None, 1).unwrap(), None);
        endpoint.finalize().unwrap();
    }

    #[test]
    fn out_of_order_take_is_an_error() {
        let endpoint = ShmEndpoint::launch(1).unwrap();
        endpoint.post(0, 5, b"five").unwrap();
        assert!(matches!(endpoint.take(0, 6), Err(Error::CommunicationFailure(_))));
        // The message that was posted first is still there.
        assert_eq!(endpoint.take(0, 5).unwrap(), b"five");
    }

    #[test]
    fn world_collectives_over_one_process() {
        let world = World::new(Box::new(ShmEndpoint::launch(1).unwrap()));
        world.barrier().unwrap();
        assert_eq!(world.broadcast(&41u64, 0).unwrap(), 41);
        assert_eq!(world.all_reduce_sum(2.5).unwrap(), 2.5);
        world.finalize().unwrap();
    }
}
