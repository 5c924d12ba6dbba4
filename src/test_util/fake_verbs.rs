use std::collections::VecDeque;

use crate::error::{CaptureError, Result};
use crate::verbs::{Completion, FlowSteeringOutcome, FlowTuple, MrHandle, NicResource, QpState, SlotHandle};

#[derive(Clone, Copy)]
struct SgeBinding {
    addr: *mut u8,
    len: usize,
    lkey: u32,
}

/// In-memory `NicResource` double. Tests drive it by calling
/// [`FakeNic::complete`] to enqueue the completions `poll_cq` will return,
/// rather than a real NIC DMA engine delivering them.
pub struct FakeNic {
    state: QpState,
    recv_sge: Vec<Option<SgeBinding>>,
    send_sge: Vec<Option<SgeBinding>>,
    next_lkey: u32,
    pending: VecDeque<Completion>,
    pub force_flow_steering_promiscuous: bool,
    pub force_poll_cq_error: bool,
    pub posted_recv_slots: Vec<SlotHandle>,
    pub posted_send_slots: Vec<SlotHandle>,
}

// Safety: raw SGE pointers are only ever dereferenced by the test thread
// driving this fake, mirroring how the real NIC handle is used by exactly
// one capture worker thread.
unsafe impl Send for FakeNic {}

impl FakeNic {
    pub fn new() -> Self {
        FakeNic {
            state: QpState::Reset,
            recv_sge: Vec::new(),
            send_sge: Vec::new(),
            next_lkey: 1,
            pending: VecDeque::new(),
            force_flow_steering_promiscuous: false,
            force_poll_cq_error: false,
            posted_recv_slots: Vec::new(),
            posted_send_slots: Vec::new(),
        }
    }

    /// Simulate the NIC having written `payload` into the slot's bound SGE
    /// address and completed the WR. Panics if the slot was never bound.
    pub fn complete(&mut self, slot: SlotHandle, payload: &[u8]) {
        let binding = self.recv_sge[slot.index()].expect("slot not bound");
        assert!(payload.len() <= binding.len, "payload larger than bound SGE");
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), binding.addr, payload.len());
        }
        self.pending.push_back(Completion {
            slot,
            byte_len: payload.len() as u32,
            success: true,
        });
    }

    /// Same, but out of wr_id order relative to any completions already
    /// queued, and all delivered as one burst visible to the next
    /// `poll_cq` call -- used to exercise the out-of-order completion
    /// handling spec.md's open question resolves.
    pub fn complete_out_of_order(&mut self, slots_and_payloads: &[(SlotHandle, &[u8])]) {
        for (slot, payload) in slots_and_payloads {
            self.complete(*slot, payload);
        }
    }
}

impl Default for FakeNic {
    fn default() -> Self {
        Self::new()
    }
}

impl NicResource for FakeNic {
    fn bring_up(&mut self, send_wr_count: usize, recv_wr_count: usize, _nsge: u32) -> Result<()> {
        self.recv_sge = vec![None; recv_wr_count];
        self.send_sge = vec![None; send_wr_count];
        self.state = QpState::Rts;
        Ok(())
    }

    fn register_memory(&mut self, addr: *mut u8, len: usize, slot_size: usize) -> Result<MrHandle> {
        if slot_size != 0 && len % slot_size != 0 {
            return Err(CaptureError::Registration(format!(
                "region length {len} is not a multiple of slot size {slot_size}"
            )));
        }
        let lkey = self.next_lkey;
        self.next_lkey += 1;
        Ok(MrHandle {
            lkey,
            addr: addr as usize,
            len,
        })
    }

    fn deregister_memory(&mut self, _mr: MrHandle) -> Result<()> {
        Ok(())
    }

    fn create_flow_steering(&mut self, _tuple: FlowTuple) -> Result<FlowSteeringOutcome> {
        if self.force_flow_steering_promiscuous {
            Ok(FlowSteeringOutcome::Promiscuous)
        } else {
            Ok(FlowSteeringOutcome::Steered)
        }
    }

    fn post_recv(&mut self, slots: &[SlotHandle]) -> Result<()> {
        self.posted_recv_slots.extend_from_slice(slots);
        Ok(())
    }

    fn bind_recv_sge(&mut self, slot: SlotHandle, addr: *mut u8, len: usize, mr: MrHandle) {
        self.recv_sge[slot.index()] = Some(SgeBinding {
            addr,
            len,
            lkey: mr.lkey,
        });
    }

    fn post_send(&mut self, slots: &[SlotHandle]) -> Result<()> {
        self.posted_send_slots.extend_from_slice(slots);
        for &slot in slots {
            self.pending.push_back(Completion {
                slot,
                byte_len: self.send_sge[slot.index()].map(|b| b.len).unwrap_or(0) as u32,
                success: true,
            });
        }
        Ok(())
    }

    fn bind_send_sge(&mut self, slot: SlotHandle, addr: *mut u8, len: usize, mr: MrHandle) {
        self.send_sge[slot.index()] = Some(SgeBinding {
            addr,
            len,
            lkey: mr.lkey,
        });
    }

    fn poll_cq(&mut self, max: usize) -> Result<Vec<Completion>> {
        if self.force_poll_cq_error {
            return Err(CaptureError::Verbs("simulated ibv_poll_cq failure".into()));
        }
        let n = max.min(self.pending.len());
        Ok(self.pending.drain(..n).collect())
    }

    fn qp_state(&self) -> QpState {
        self.state
    }
}
