//! Transmit loop (spec.md 4.3.3): symmetric to the receive paths, but the
//! engine fills WR payloads itself via a caller-provided callback instead
//! of receiving them from the NIC, and throttles on send completions
//! rather than polling for new data.

use std::sync::atomic::{AtomicBool, Ordering};

use super::batch::BandwidthSampler;
use crate::config::ReceiveParams;
use crate::error::Result;
use crate::hugepage::StagingBuffer;
use crate::verbs::{MrHandle, NicResource, SlotHandle};

pub struct SendLoopReport {
    pub packets_sent: u64,
}

/// `fill` is called once per slot before its batch is posted, and writes
/// exactly `pkt_size` bytes of payload into the given slice.
pub fn run(
    nic: &mut dyn NicResource,
    staging: &StagingBuffer,
    mr: MrHandle,
    params: &ReceiveParams,
    cancel: &AtomicBool,
    mut fill: impl FnMut(SlotHandle, &mut [u8]),
) -> Result<SendLoopReport> {
    let b = params.send_n;
    let pkt_size = params.pkt_size;
    let poll_n = 8usize;
    let mut bandwidth = BandwidthSampler::new(pkt_size);
    let mut packets_sent = 0u64;

    let slots: Vec<SlotHandle> = (0..b).map(SlotHandle::new).collect();
    for &slot in &slots {
        let addr = staging.slot_ptr(slot.index(), pkt_size);
        nic.bind_send_sge(slot, addr, pkt_size, mr);
    }

    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }

        for &slot in &slots {
            let addr = staging.slot_ptr(slot.index(), pkt_size);
            let payload = unsafe { std::slice::from_raw_parts_mut(addr, pkt_size) };
            fill(slot, payload);
        }
        nic.post_send(&slots)?;

        let mut outstanding = b;
        while outstanding > 0 {
            if cancel.load(Ordering::Acquire) {
                break;
            }
            let completions = nic.poll_cq(poll_n.min(outstanding))?;
            bandwidth.record(completions.len() as u64);
            outstanding -= completions.len();
            packets_sent += completions.len() as u64;
        }
    }

    Ok(SendLoopReport { packets_sent })
}
