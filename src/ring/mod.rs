//! Shared-memory ring producer: the operations this crate consumes from an
//! externally provisioned producer/consumer ring ("data HDU"). The ring's
//! on-disk layout and semaphore protocol belong to the external library
//! that created the segment; this module only attaches to it.
//!
//! Collapses the source's four independent callbacks (`acquire`, `publish`,
//! `decrement_write_count`, `is_block_full`) into one trait, and its
//! `decrement`/`is_full` pair into a single [`RingAttachment::note_batch_written`]
//! returning [`BlockState`]. Grounded on `psrdada_ringbuf.cpp`.

pub mod shm;

use crate::error::Result;
use crate::header::HeaderRecord;

/// Whether the current block still has room, or just became full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Partial,
    Full,
}

/// An *attachment* to an externally owned ring, not the ring itself: this
/// process never creates or destroys the shared-memory segment, only
/// attaches, writes, and detaches.
pub trait RingAttachment {
    /// Attach to the ring identified by `key`, take the writer lock, and
    /// optionally write one header record into the header sub-buffer.
    /// Fails if already attached, if the ring does not exist, or if the
    /// writer lock is already held.
    fn attach(
        &mut self,
        key: u32,
        expected_block_bytes: u64,
        nbufs: u32,
        header: Option<&HeaderRecord>,
    ) -> Result<()>;

    /// Base addresses of all `N` blocks, in ring order. Used by the
    /// memory-registration strategy to test contiguity.
    fn block_base_addrs(&self) -> &[usize];

    /// Bytes per block, queried once after attach.
    fn block_size(&self) -> u64;

    /// Block until a free block is available, then return its base
    /// pointer. Cooperates with the ring's own semaphore; this is the
    /// engine's only blocking call.
    fn acquire_next_writable_block(&mut self) -> Result<*mut u8>;

    /// Record that `bytes` more were written into the current block
    /// (normally `B * pkt_size`), and report whether the block is now
    /// full. Collapses the source's separate decrement/is-full callbacks.
    fn note_batch_written(&mut self, bytes: u64) -> Result<BlockState>;

    /// Mark the current block filled with exactly `bytes_written` bytes.
    /// Fails if no block is current.
    fn publish(&mut self, bytes_written: u64) -> Result<()>;

    fn used_bytes(&self) -> u64;
    fn free_bytes(&self) -> u64;

    /// Signal end-of-data, wait briefly for the reader to react, release
    /// the writer lock, disconnect (without destroying the segment), and
    /// destroy the local handle. Idempotent after first success.
    fn send_eod_and_disconnect(&mut self) -> Result<()>;
}
