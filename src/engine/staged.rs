//! Staged-copy receive loop (spec.md 4.3.1): the NIC DMAs into a pinned
//! staging buffer, and the worker copies completed batches into the
//! current ring block.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::batch::BandwidthSampler;
use crate::config::ReceiveParams;
use crate::error::Result;
use crate::hugepage::StagingBuffer;
use crate::ring::{BlockState, RingAttachment};
use crate::verbs::{MrHandle, NicResource, SlotHandle};

pub struct StagedLoopReport {
    pub packets_captured: u64,
    pub blocks_published: u64,
}

/// Runs until `cancel` is observed set. Preconditions (caller's
/// responsibility): `staging` registered as `mr`, all `W` receive WRs
/// already posted by the caller with SGEs bound to staging slots.
pub fn run(
    nic: &mut dyn NicResource,
    ring: &mut dyn RingAttachment,
    staging: &StagingBuffer,
    mr: MrHandle,
    params: &ReceiveParams,
    cancel: &AtomicBool,
) -> Result<StagedLoopReport> {
    let _ = mr;
    let b = params.send_n;
    let pkt_size = params.pkt_size;
    let need = (b * pkt_size) as u64;
    let poll_n = 8usize;

    let mut packets_captured = 0u64;
    let mut blocks_published = 0u64;
    let mut bandwidth = BandwidthSampler::new(pkt_size);

    let mut block_write_cursor: *mut u8 = std::ptr::null_mut();
    let mut backlog: VecDeque<crate::verbs::Completion> = VecDeque::new();

    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }

        if block_write_cursor.is_null() {
            block_write_cursor = ring.acquire_next_writable_block()?;
        }

        let completions = nic.poll_cq(poll_n)?;
        bandwidth.record(completions.len() as u64);
        backlog.extend(completions);

        if backlog.len() >= b {
            let batch: Vec<_> = backlog.drain(..b).collect();

            // Strict wr_id-indexed copy: each completion names its own
            // staging slot; never assume the batch arrived as a
            // contiguous run starting at the first completion's wr_id.
            for completion in &batch {
                let src = staging.slot_ptr(completion.slot.index(), pkt_size);
                unsafe {
                    std::ptr::copy_nonoverlapping(src, block_write_cursor, pkt_size);
                    block_write_cursor = block_write_cursor.add(pkt_size);
                }
            }

            let state = ring.note_batch_written(need)?;
            packets_captured += b as u64;

            let slots: Vec<SlotHandle> = batch.iter().map(|c| c.slot).collect();
            nic.post_recv(&slots)?;

            if state == BlockState::Full {
                ring.publish(ring.block_size())?;
                blocks_published += 1;
                block_write_cursor = std::ptr::null_mut();
                debug!(blocks_published, "published ring block");
            }
        }
    }

    Ok(StagedLoopReport {
        packets_captured,
        blocks_published,
    })
}
