use std::io;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crossbeam_channel::{bounded, Receiver, Sender};
use fluxline_protocol::{Measurement, ProtocolError};

/// Returns the default sub-buffer count: `max(6, ceil(1.7 × CPUs))`.
pub(crate) fn default_slot_count() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    ((cpus as f64 * 1.7).ceil() as usize).max(6)
}

/// A bank of independent sub-buffers that spreads concurrent writers out to
/// reduce contention on append, while preserving a single drain point.
///
/// Each sub-buffer is a byte buffer behind its own mutex. A bounded channel
/// holds the indices of free sub-buffers; a writer owns a sub-buffer from
/// the moment it receives its index until it returns it. A chain-wide
/// reader-writer gate is held read-side by every writer and write-side by
/// [`flush`][BufferChain::flush], so a flush observes no in-flight writers.
///
/// The aggregate byte counter equals the sum of all sub-buffer lengths
/// whenever no write is in flight.
pub(crate) struct BufferChain {
    slots: Vec<Mutex<Vec<u8>>>,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    size: AtomicUsize,
    gate: RwLock<()>,
}

impl BufferChain {
    /// Creates a chain of `slots` sub-buffers, each preallocated to
    /// `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is zero; a chain with no sub-buffers can never
    /// accept a write.
    pub fn new(slots: usize, capacity: usize) -> Self {
        assert!(slots >= 1, "buffer chain needs at least one sub-buffer");

        let (free_tx, free_rx) = bounded(slots);
        let mut buffers = Vec::with_capacity(slots);
        for idx in 0..slots {
            buffers.push(Mutex::new(Vec::with_capacity(capacity)));
            free_tx.send(idx).expect("free-slot channel holds every index");
        }

        Self {
            slots: buffers,
            free_tx,
            free_rx,
            size: AtomicUsize::new(0),
            gate: RwLock::new(()),
        }
    }

    /// Returns the total number of buffered bytes.
    pub fn len(&self) -> usize {
        let _gate = self.gate.read().unwrap();
        self.size.load(Relaxed)
    }

    /// Acquires a sub-buffer for exclusive writing.
    ///
    /// Blocks while a flush is in progress or all sub-buffers are owned by
    /// other writers. The sub-buffer is returned when the writer drops.
    pub fn take(&self) -> ChainWriter<'_> {
        // Gate first: a writer blocked behind a flush must not be holding a
        // free-slot index while it waits.
        let gate = self.gate.read().unwrap();
        let idx = self.free_rx.recv().expect("free-slot channel never closes");
        let buf = self.slots[idx].lock().unwrap();

        ChainWriter {
            chain: self,
            idx,
            buf: Some(buf),
            _gate: gate,
        }
    }

    /// Appends `data` to one sub-buffer.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut writer = self.take();
        writer.append(data);
        data.len()
    }

    /// Drains every sub-buffer into a single batch, in slot order.
    ///
    /// Takes the chain-wide gate in write mode, so all in-flight writers
    /// have finished and their bytes are included. Returns `None` when
    /// nothing is buffered.
    pub fn flush(&self) -> Option<Vec<u8>> {
        let _gate = self.gate.write().unwrap();

        let mut buffers: Vec<MutexGuard<'_, Vec<u8>>> =
            self.slots.iter().map(|slot| slot.lock().unwrap()).collect();
        let total: usize = buffers.iter().map(|buf| buf.len()).sum();
        if total == 0 {
            return None;
        }

        let mut batch = Vec::with_capacity(total);
        for buf in buffers.iter_mut() {
            batch.extend_from_slice(buf);
            buf.clear();
        }

        self.size.store(0, Relaxed);

        Some(batch)
    }
}

/// Exclusive write access to one sub-buffer of a [`BufferChain`].
///
/// Writes through a single `ChainWriter` stay in order and end up contiguous
/// in the drained batch. The sub-buffer and the chain gate are released
/// exactly once, on drop.
pub struct ChainWriter<'a> {
    chain: &'a BufferChain,
    idx: usize,
    buf: Option<MutexGuard<'a, Vec<u8>>>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl ChainWriter<'_> {
    fn buf(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("sub-buffer held until drop")
    }

    /// Appends raw bytes.
    pub(crate) fn append(&mut self, data: &[u8]) {
        self.buf().extend_from_slice(data);
        self.chain.size.fetch_add(data.len(), Relaxed);
    }

    /// Encodes a measurement straight into the held sub-buffer.
    pub(crate) fn encode_measurement<M>(&mut self, measurement: &M) -> Result<usize, ProtocolError>
    where
        M: Measurement + ?Sized,
    {
        let written = fluxline_protocol::write_measurement(self.buf(), measurement)?;
        self.chain.size.fetch_add(written, Relaxed);
        Ok(written)
    }

    /// Encodes multiple measurements straight into the held sub-buffer,
    /// keeping the whole group contiguous in the next batch.
    pub(crate) fn encode_measurements<I>(&mut self, measurements: I) -> Result<usize, ProtocolError>
    where
        I: IntoIterator,
        I::Item: Measurement,
    {
        let written = fluxline_protocol::write_measurements(self.buf(), measurements)?;
        self.chain.size.fetch_add(written, Relaxed);
        Ok(written)
    }
}

impl io::Write for ChainWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.append(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ChainWriter<'_> {
    fn drop(&mut self) {
        // Release the sub-buffer before publishing its index so the next
        // taker never blocks on our lock.
        self.buf.take();
        let _ = self.chain.free_tx.send(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::thread;

    use super::*;

    #[test]
    fn writes_accumulate_and_flush_drains() {
        let chain = BufferChain::new(4, 64);
        chain.write(b"hello ");
        chain.write(b"world");
        assert_eq!(chain.len(), 11);

        let batch = chain.flush().expect("chain has bytes");
        assert_eq!(batch.len(), 11);
        assert_eq!(chain.len(), 0);
        assert!(chain.flush().is_none());
    }

    #[test]
    fn empty_chain_flushes_to_none() {
        let chain = BufferChain::new(2, 16);
        assert!(chain.flush().is_none());
        assert_eq!(chain.len(), 0);
    }

    #[test]
    fn writer_bytes_stay_contiguous() {
        let chain = BufferChain::new(4, 64);
        {
            let mut writer = chain.take();
            writer.write_all(b"abc").unwrap();
            writer.write_all(b"def").unwrap();
        }
        let batch = chain.flush().unwrap();
        assert_eq!(batch, b"abcdef");
    }

    #[test]
    #[should_panic(expected = "at least one sub-buffer")]
    fn zero_slots_panics() {
        let _ = BufferChain::new(0, 16);
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        const WRITERS: usize = 8;
        const WRITES: usize = 200;
        const CHUNK: &[u8] = b"0123456789";

        let chain = BufferChain::new(4, 256);

        let drained: usize = thread::scope(|s| {
            for _ in 0..WRITERS {
                s.spawn(|| {
                    for _ in 0..WRITES {
                        chain.write(CHUNK);
                    }
                });
            }

            // Drain concurrently with the writers; whatever is left after
            // they finish comes out in a final flush.
            let flusher = s.spawn(|| {
                let mut seen = 0;
                for _ in 0..50 {
                    if let Some(batch) = chain.flush() {
                        seen += batch.len();
                    }
                    thread::yield_now();
                }
                seen
            });

            flusher.join().unwrap()
        }) + chain.flush().map_or(0, |batch| batch.len());

        assert_eq!(drained, WRITERS * WRITES * CHUNK.len());
        assert_eq!(chain.len(), 0);
    }

    #[test]
    fn counter_matches_slot_contents_at_rest() {
        let chain = BufferChain::new(3, 32);
        thread::scope(|s| {
            for _ in 0..6 {
                s.spawn(|| {
                    for _ in 0..100 {
                        chain.write(b"xy");
                    }
                });
            }
        });

        assert_eq!(chain.len(), 6 * 100 * 2);
        assert_eq!(chain.flush().unwrap().len(), 6 * 100 * 2);
    }
}
