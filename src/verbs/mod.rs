//! NIC verbs layer: device open, PD/CQ/QP lifecycle, memory registration,
//! flow steering, and CQ polling, collapsed into one trait the receive
//! engine is generic over.
//!
//! Grounded on `ibv_utils.cpp`'s `open_ib_device`/`create_ib_res`/
//! `init_ib_res`/`register_memory`/`create_flow`/`destroy_ib_res` sequence;
//! the FFI surface itself is provided by `rdma-sys`.

pub mod real;
pub mod types;

use crate::error::Result;
pub use types::{Completion, FlowSteeringOutcome, FlowTuple, MrHandle, QpState, SlotHandle};

/// Everything the receive/transmit engine needs from the NIC. A single
/// trait in place of the original four independent entry points
/// (`open_ib_device`, `create_ib_res`/`init_ib_res`, `register_memory`,
/// `create_flow`), so the engine can run against a fake in tests without
/// touching real hardware.
pub trait NicResource {
    /// Allocate PD/CQ/QP sized for `send_wr_count`/`recv_wr_count` outstanding
    /// work requests with `nsge` SGEs each, and bring the QP up through
    /// `RESET -> INIT -> RTR -> RTS`. Any transition failure, or a QP query
    /// that doesn't confirm RTS afterward, is startup-fatal.
    fn bring_up(&mut self, send_wr_count: usize, recv_wr_count: usize, nsge: u32) -> Result<()>;

    /// Register `[addr, addr+len)` as one MR with local-write access.
    /// `slot_size` is the SGE granularity used to validate `len` divides
    /// evenly (spec invariant: `len / slot_size` must equal the WR count
    /// this region was sized for).
    fn register_memory(&mut self, addr: *mut u8, len: usize, slot_size: usize) -> Result<MrHandle>;

    /// Deregister a previously registered MR. Must be called before the QP
    /// is destroyed (QP destruction references MRs).
    fn deregister_memory(&mut self, mr: MrHandle) -> Result<()>;

    /// Attempt to install the 3-layer exact-match flow-steering rule.
    /// Failure degrades to promiscuous mode rather than failing startup.
    fn create_flow_steering(&mut self, tuple: FlowTuple) -> Result<FlowSteeringOutcome>;

    /// Post `count` receive WRs, each pointing at the SGE slot the caller
    /// bound beforehand via `bind_recv_sge`.
    fn post_recv(&mut self, slots: &[SlotHandle]) -> Result<()>;

    /// (Re-)point the SGE for `slot` at `(addr, len, mr)`. Used both at
    /// startup (staged mode: every slot bound once to the staging buffer)
    /// and per-acquisition in DirectToRing mode (slots re-pointed at the
    /// newly acquired block).
    fn bind_recv_sge(&mut self, slot: SlotHandle, addr: *mut u8, len: usize, mr: MrHandle);

    /// Post `count` signaled send WRs for the transmit loop, each pointing
    /// at the SGE slot bound via `bind_send_sge`.
    fn post_send(&mut self, slots: &[SlotHandle]) -> Result<()>;

    fn bind_send_sge(&mut self, slot: SlotHandle, addr: *mut u8, len: usize, mr: MrHandle);

    /// Poll up to `max` completions (burst size `poll_n`). Returns fewer
    /// than `max` if fewer are ready; never blocks.
    fn poll_cq(&mut self, max: usize) -> Result<Vec<Completion>>;

    fn qp_state(&self) -> QpState;
}
