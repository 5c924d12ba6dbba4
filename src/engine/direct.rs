//! DirectToRing receive loop (spec.md 4.3.2): the NIC DMAs straight into
//! the current ring block, bypassing the staging buffer entirely.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::batch::BandwidthSampler;
use crate::config::ReceiveParams;
use crate::error::Result;
use crate::ring::RingAttachment;
use crate::verbs::{MrHandle, NicResource, SlotHandle};

pub struct DirectLoopReport {
    pub packets_captured: u64,
    pub blocks_published: u64,
}

/// Runs until `cancel` is observed set. Preconditions: a single whole-ring
/// MR (`mr`) exists; unlike the staged path, WRs are posted per block
/// rather than once at startup.
pub fn run(
    nic: &mut dyn NicResource,
    ring: &mut dyn RingAttachment,
    mr: MrHandle,
    params: &ReceiveParams,
    cancel: &AtomicBool,
) -> Result<DirectLoopReport> {
    let b = params.send_n;
    let pkt_size = params.pkt_size;
    let poll_n = 8usize;

    let mut packets_captured = 0u64;
    let mut blocks_published = 0u64;
    let mut bandwidth = BandwidthSampler::new(pkt_size);

    let slots: Vec<SlotHandle> = (0..b).map(SlotHandle::new).collect();
    let mut recv_ready = false;
    let mut completed = 0usize;

    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }

        if !recv_ready {
            let block_ptr = ring.acquire_next_writable_block()?;
            for (i, &slot) in slots.iter().enumerate() {
                let addr = unsafe { block_ptr.add(i * pkt_size) };
                nic.bind_recv_sge(slot, addr, pkt_size, mr);
            }
            nic.post_recv(&slots)?;
            recv_ready = true;
        }

        let completions = nic.poll_cq(poll_n)?;
        bandwidth.record(completions.len() as u64);
        completed += completions.len();

        if completed >= b {
            ring.note_batch_written((completed * pkt_size) as u64)?;
            ring.publish(ring.block_size())?;
            packets_captured += completed as u64;
            completed = 0;
            recv_ready = false;
            blocks_published += 1;
            debug!(blocks_published, "published ring block (DirectToRing)");
        }
    }

    Ok(DirectLoopReport {
        packets_captured,
        blocks_published,
    })
}
