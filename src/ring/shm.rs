//! SysV shared-memory + semaphore backed [`RingAttachment`].
//!
//! No crate in the dependency graph speaks the PSRDADA on-disk ring
//! protocol (it is, by design, an external library's format), so this
//! attaches via the same raw-`libc` convention [`crate::hugepage`] already
//! uses for `mmap`: `shmget`/`shmat`/`shmdt` for the segment, `semget`/
//! `semop` for the free/filled-block counters that provide backpressure.
//!
//! Segment layout, front to back: one [`RingControl`] header, the
//! `HEADER_SIZE`-byte header sub-buffer, then `nbufs` contiguous blocks of
//! `expected_block_bytes` each.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use nix::libc;

use super::{BlockState, RingAttachment};
use crate::error::CaptureError;
use crate::error::Result;
use crate::header::{HeaderRecord, HEADER_SIZE};

const SEM_FREE: u16 = 0;
const SEM_FILLED: u16 = 1;
const SEM_WRITER_LOCK: u16 = 2;

const EOD_WAIT: std::time::Duration = std::time::Duration::from_secs(2);

#[repr(C)]
struct RingControl {
    write_count: AtomicU64,
    read_count: AtomicU64,
    eod: AtomicU32,
    _reserved: u32,
}

pub struct ShmRing {
    key: u32,
    shmid: i32,
    semid: i32,
    base: *mut u8,
    segment_len: usize,
    nbufs: u32,
    block_size: u64,
    block_base_addrs: Vec<usize>,
    /// Countdown toward the current block's `writes_per_block`, the exact
    /// number of batches that fill one block (`block_size / batch_bytes`,
    /// floored -- any remainder is the pre-zeroed tail). `None` until the
    /// first `note_batch_written` call on a freshly acquired block
    /// establishes `writes_per_block` from the batch size it's given.
    remaining_writes: Option<u64>,
    current_block_index: Option<usize>,
    attached: bool,
    eod_sent: bool,
}

// Safety: the raw pointer into the shared segment is only dereferenced by
// the single capture worker that owns this value; the reader process on
// the other end synchronizes through the ring's own semaphores.
unsafe impl Send for ShmRing {}

impl ShmRing {
    pub fn new() -> Self {
        ShmRing {
            key: 0,
            shmid: -1,
            semid: -1,
            base: std::ptr::null_mut(),
            segment_len: 0,
            nbufs: 0,
            block_size: 0,
            block_base_addrs: Vec::new(),
            remaining_writes: None,
            current_block_index: None,
            attached: false,
            eod_sent: false,
        }
    }

    fn control(&self) -> &RingControl {
        unsafe { &*(self.base as *const RingControl) }
    }

    fn header_sub_buffer(&self) -> *mut u8 {
        unsafe { self.base.add(std::mem::size_of::<RingControl>()) }
    }

    fn blocks_base(&self) -> *mut u8 {
        unsafe { self.header_sub_buffer().add(HEADER_SIZE) }
    }

    fn semop_one(&self, sem_num: u16, op: i16) -> Result<()> {
        let mut sops = [libc::sembuf {
            sem_num,
            sem_op: op,
            sem_flg: 0,
        }];
        let rc = unsafe { libc::semop(self.semid, sops.as_mut_ptr(), 1) };
        if rc != 0 {
            return Err(CaptureError::Ring(format!(
                "semop(sem={sem_num}, op={op}) failed"
            )));
        }
        Ok(())
    }
}

impl Default for ShmRing {
    fn default() -> Self {
        Self::new()
    }
}

impl RingAttachment for ShmRing {
    fn attach(
        &mut self,
        key: u32,
        expected_block_bytes: u64,
        nbufs: u32,
        header: Option<&HeaderRecord>,
    ) -> Result<()> {
        if self.attached {
            return Err(CaptureError::Ring("already attached".into()));
        }

        let segment_len = std::mem::size_of::<RingControl>()
            + HEADER_SIZE
            + (nbufs as usize) * (expected_block_bytes as usize);

        let shmid = unsafe { libc::shmget(key as i32, segment_len, 0o600) };
        if shmid < 0 {
            return Err(CaptureError::Ring(format!(
                "ring with key {key:#x} does not exist"
            )));
        }

        let semid = unsafe { libc::semget(key as i32, 3, 0o600) };
        if semid < 0 {
            return Err(CaptureError::Ring(format!(
                "no semaphore set for ring key {key:#x}"
            )));
        }

        // Writer-lock: a binary semaphore decremented to 0 by the first
        // writer; a second attacher blocks forever, so try a non-blocking
        // decrement and fail fast instead.
        let mut sops = [libc::sembuf {
            sem_num: SEM_WRITER_LOCK,
            sem_op: -1,
            sem_flg: libc::IPC_NOWAIT as i16,
        }];
        if unsafe { libc::semop(semid, sops.as_mut_ptr(), 1) } != 0 {
            return Err(CaptureError::Ring(
                "writer lock already held by another process".into(),
            ));
        }

        let base = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if base == usize::MAX as *mut libc::c_void {
            return Err(CaptureError::Ring("shmat failed".into()));
        }
        let base = base as *mut u8;

        self.key = key;
        self.shmid = shmid;
        self.semid = semid;
        self.base = base;
        self.segment_len = segment_len;
        self.nbufs = nbufs;
        self.block_size = expected_block_bytes;
        self.block_base_addrs = (0..nbufs as usize)
            .map(|i| unsafe { self.blocks_base().add(i * expected_block_bytes as usize) as usize })
            .collect();
        self.attached = true;

        if let Some(record) = header {
            let mut buf = [0u8; HEADER_SIZE];
            record.write_to(&mut buf)?;
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), self.header_sub_buffer(), HEADER_SIZE);
            }
        }

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
        // Blocks here (backpressure) when the ring is full.
        self.semop_one(SEM_FREE, -1)?;

        let write_count = self.control().write_count.load(Ordering::Acquire);
        let index = (write_count % self.nbufs as u64) as usize;
        self.current_block_index = Some(index);
        self.remaining_writes = None;
        Ok(self.block_base_addrs[index] as *mut u8)
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

    fn publish(&mut self, bytes_written: u64) -> Result<()> {
        if self.current_block_index.is_none() {
            return Err(CaptureError::Ring("publish with no current block".into()));
        }
        let _ = bytes_written;
        self.control().write_count.fetch_add(1, Ordering::AcqRel);
        self.semop_one(SEM_FILLED, 1)?;
        self.current_block_index = None;
        self.remaining_writes = None;
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        let write_count = self.control().write_count.load(Ordering::Acquire);
        let read_count = self.control().read_count.load(Ordering::Acquire);
        let used = write_count.saturating_sub(read_count).min(self.nbufs as u64);
        used * self.block_size
    }

    fn free_bytes(&self) -> u64 {
        (self.nbufs as u64 * self.block_size).saturating_sub(self.used_bytes())
    }

    fn send_eod_and_disconnect(&mut self) -> Result<()> {
        if self.eod_sent {
            return Ok(());
        }
        if !self.attached {
            self.eod_sent = true;
            return Ok(());
        }

        self.control().eod.store(1, Ordering::Release);
        std::thread::sleep(EOD_WAIT);

        // Writer-lock release: hand the binary semaphore back.
        self.semop_one(SEM_WRITER_LOCK, 1)?;

        unsafe {
            libc::shmdt(self.base as *const libc::c_void);
        }
        self.attached = false;
        self.eod_sent = true;
        Ok(())
    }
}

impl Drop for ShmRing {
    fn drop(&mut self) {
        if self.attached {
            let _ = self.send_eod_and_disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_key() -> u32 {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(0x5a5a_0000);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    fn provision(key: u32, nbufs: u32, block_bytes: u64) {
        let segment_len = std::mem::size_of::<RingControl>()
            + HEADER_SIZE
            + (nbufs as usize) * (block_bytes as usize);
        unsafe {
            let shmid = libc::shmget(key as i32, segment_len, libc::IPC_CREAT | 0o600);
            assert!(shmid >= 0, "test setup: shmget failed");
            let semid = libc::semget(key as i32, 3, libc::IPC_CREAT | 0o600);
            assert!(semid >= 0, "test setup: semget failed");
            libc::semctl(semid, SEM_FREE as i32, libc::SETVAL, nbufs as i32);
            libc::semctl(semid, SEM_FILLED as i32, libc::SETVAL, 0);
            libc::semctl(semid, SEM_WRITER_LOCK as i32, libc::SETVAL, 1);
        }
    }

    fn teardown(key: u32, nbufs: u32, block_bytes: u64) {
        let segment_len = std::mem::size_of::<RingControl>()
            + HEADER_SIZE
            + (nbufs as usize) * (block_bytes as usize);
        unsafe {
            let shmid = libc::shmget(key as i32, segment_len, 0o600);
            if shmid >= 0 {
                libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut());
            }
            let semid = libc::semget(key as i32, 3, 0o600);
            if semid >= 0 {
                libc::semctl(semid, 0, libc::IPC_RMID);
            }
        }
    }

    #[test]
    fn test_attach_acquire_publish_round_trip() {
        let key = unique_key();
        provision(key, 4, 4096);

        let mut ring = ShmRing::new();
        ring.attach(key, 4096, 4, None).unwrap();

        let ptr = ring.acquire_next_writable_block().unwrap();
        assert!(!ptr.is_null());
        let state = ring.note_batch_written(4096).unwrap();
        assert_eq!(state, BlockState::Full);
        ring.publish(4096).unwrap();
        assert_eq!(ring.used_bytes(), 4096);

        teardown(key, 4, 4096);
    }

    #[test]
    fn test_single_block_round_trips_twice() {
        let key = unique_key();
        provision(key, 1, 1024);

        let mut ring = ShmRing::new();
        ring.attach(key, 1024, 1, None).unwrap();

        ring.acquire_next_writable_block().unwrap();
        ring.note_batch_written(1024).unwrap();
        ring.publish(1024).unwrap();

        // Simulate the external reader draining the one block.
        ring.control().read_count.fetch_add(1, Ordering::AcqRel);
        ring.semop_one(SEM_FREE, 1).unwrap();

        let ptr = ring.acquire_next_writable_block().unwrap();
        assert!(!ptr.is_null());

        teardown(key, 1, 1024);
    }

    #[test]
    fn test_send_eod_and_disconnect_is_idempotent() {
        let key = unique_key();
        provision(key, 2, 1024);

        let mut ring = ShmRing::new();
        ring.attach(key, 1024, 2, None).unwrap();
        ring.send_eod_and_disconnect().unwrap();
        ring.send_eod_and_disconnect().unwrap();

        teardown(key, 2, 1024);
    }

    #[test]
    fn test_publish_without_current_block_fails() {
        let key = unique_key();
        provision(key, 2, 1024);

        let mut ring = ShmRing::new();
        ring.attach(key, 1024, 2, None).unwrap();
        assert!(ring.publish(1024).is_err());

        teardown(key, 2, 1024);
    }
}
