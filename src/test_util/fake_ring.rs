use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::super::ring::{BlockState, RingAttachment};
use crate::error::{CaptureError, Result};
use crate::header::HeaderRecord;

struct Counters {
    write_count: u64,
    read_count: u64,
}

/// In-process `RingAttachment` double backed by a plain heap buffer. The
/// write/read counters live behind a `Mutex` shared with any
/// [`DrainHandle`]s so a test can simulate the external reader process
/// draining blocks from a second thread while the engine thread blocks
/// inside `acquire_next_writable_block`.
pub struct FakeRing {
    storage: Arc<Vec<u8>>,
    block_base_addrs: Vec<usize>,
    block_size: u64,
    nbufs: u32,
    counters: Arc<Mutex<Counters>>,
    current_block_index: Option<usize>,
    remaining_writes: Option<u64>,
    attached: bool,
    eod_sent: bool,
    pub last_header: Option<HeaderRecord>,
}

/// A handle the test side uses to simulate the reader process, independent
/// of the `&mut self` the engine holds on its `FakeRing`.
#[derive(Clone)]
pub struct DrainHandle {
    counters: Arc<Mutex<Counters>>,
}

impl DrainHandle {
    pub fn drain_one(&self) {
        let mut c = self.counters.lock().unwrap();
        c.read_count += 1;
    }
}

impl FakeRing {
    pub fn new(nbufs: u32, block_size: u64) -> Self {
        let storage = Arc::new(vec![0u8; nbufs as usize * block_size as usize]);
        let base = storage.as_ptr() as usize;
        let block_base_addrs = (0..nbufs as usize).map(|i| base + i * block_size as usize).collect();
        FakeRing {
            storage,
            block_base_addrs,
            block_size,
            nbufs,
            counters: Arc::new(Mutex::new(Counters {
                write_count: 0,
                read_count: 0,
            })),
            current_block_index: None,
            remaining_writes: None,
            attached: false,
            eod_sent: false,
            last_header: None,
        }
    }

    /// Same blocks, deliberately scattered to a non-contiguous address
    /// order so the memory-registration strategy falls back to per-block
    /// MRs, mirroring concrete scenario 2.
    pub fn new_non_contiguous(nbufs: u32, block_size: u64) -> Self {
        let mut ring = Self::new(nbufs, block_size);
        ring.block_base_addrs.reverse();
        ring
    }

    pub fn drain_handle(&self) -> DrainHandle {
        DrainHandle {
            counters: self.counters.clone(),
        }
    }

    pub fn read_block(&self, index: usize) -> &[u8] {
        let addr = self.block_base_addrs[index];
        let base = self.storage.as_ptr() as usize;
        let offset = addr - base;
        &self.storage[offset..offset + self.block_size as usize]
    }
}

impl RingAttachment for FakeRing {
    fn attach(
        &mut self,
        _key: u32,
        expected_block_bytes: u64,
        _nbufs: u32,
        header: Option<&HeaderRecord>,
    ) -> Result<()> {
        if self.attached {
            return Err(CaptureError::Ring("already attached".into()));
        }
        if expected_block_bytes != self.block_size {
            return Err(CaptureError::Ring(format!(
                "expected block size {expected_block_bytes} does not match ring's {}",
                self.block_size
            )));
        }
        self.attached = true;
        self.last_header = header.cloned();
        Ok(())
    }

    fn block_base_addrs(&self) -> &[usize] {
        &self.block_base_addrs
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn acquire_next_writable_block(&mut self) -> Result<*mut u8> {
        if !self.attached {
            return Err(CaptureError::Ring("not attached".into()));
        }
        loop {
            {
                let c = self.counters.lock().unwrap();
                if c.write_count - c.read_count < self.nbufs as u64 {
                    let index = (c.write_count % self.nbufs as u64) as usize;
                    self.current_block_index = Some(index);
                    self.remaining_writes = None;
                    return Ok(self.block_base_addrs[index] as *mut u8);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn note_batch_written(&mut self, bytes: u64) -> Result<BlockState> {
        if self.current_block_index.is_none() {
            return Err(CaptureError::Ring("no block is current".into()));
        }
        let remaining = self
            .remaining_writes
            .get_or_insert_with(|| (self.block_size / bytes).max(1));
        *remaining -= 1;
        if *remaining == 0 {
            Ok(BlockState::Full)
        } else {
            Ok(BlockState::Partial)
        }
    }

    fn publish(&mut self, _bytes_written: u64) -> Result<()> {
        if self.current_block_index.is_none() {
            return Err(CaptureError::Ring("publish with no current block".into()));
        }
        self.counters.lock().unwrap().write_count += 1;
        self.current_block_index = None;
        self.remaining_writes = None;
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        let c = self.counters.lock().unwrap();
        c.write_count.saturating_sub(c.read_count).min(self.nbufs as u64) * self.block_size
    }

    fn free_bytes(&self) -> u64 {
        (self.nbufs as u64 * self.block_size).saturating_sub(self.used_bytes())
    }

    fn send_eod_and_disconnect(&mut self) -> Result<()> {
        if self.eod_sent {
            return Ok(());
        }
        self.attached = false;
        self.eod_sent = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_blocks_until_drained() {
        let mut ring = FakeRing::new(2, 1024);
        ring.attach(0, 1024, 2, None).unwrap();
        let drain = ring.drain_handle();

        ring.acquire_next_writable_block().unwrap();
        ring.note_batch_written(1024).unwrap();
        ring.publish(1024).unwrap();
        ring.acquire_next_writable_block().unwrap();
        ring.note_batch_written(1024).unwrap();
        ring.publish(1024).unwrap();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drain.drain_one();
        });

        // Ring is full (2 blocks published, 0 drained): this call must
        // block until the spawned thread drains one.
        let started = std::time::Instant::now();
        ring.acquire_next_writable_block().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(15));

        handle.join().unwrap();
    }

    #[test]
    fn test_non_contiguous_reverses_block_order() {
        let contiguous = FakeRing::new(4, 256);
        let scattered = FakeRing::new_non_contiguous(4, 256);
        assert_ne!(contiguous.block_base_addrs(), scattered.block_base_addrs());
    }
}
