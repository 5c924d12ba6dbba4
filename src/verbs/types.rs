//! Thin value types over the libibverbs surface this crate consumes.
//! Grounded on the `Wc`/`WcStatus` wrapping convention used for `rdma-sys`
//! bindings in the broader ecosystem (`repr(transparent)` wrapper +
//! accessor methods rather than touching the raw FFI struct fields
//! directly at call sites).

use rdma_sys::ibv_wc;

/// The flow-steering match tuple: Ethernet type = IPv4, src/dst MAC,
/// src/dst IPv4, src/dst UDP port, all masked to exact match.
#[derive(Debug, Clone, Copy)]
pub struct FlowTuple {
    pub smac: [u8; 6],
    pub dmac: [u8; 6],
    pub sip: std::net::Ipv4Addr,
    pub dip: std::net::Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
}

/// Outcome of a `create_flow_steering` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSteeringOutcome {
    /// Flow created: only matching packets reach the QP.
    Steered,
    /// Flow creation failed; the QP receives every packet on the port and
    /// the caller is responsible for discarding the rest.
    Promiscuous,
}

/// `RESET -> INIT -> RTR -> RTS`, verified at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
}

/// One CQ completion. `slot` carries the wr_id back as an opaque handle
/// rather than a bare integer, per the "manual WR indexing" design note:
/// it still is the verbs-level wr_id underneath, but callers index SGE
/// pools through `SlotHandle` instead of raw arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub slot: SlotHandle,
    pub byte_len: u32,
    pub success: bool,
}

impl Completion {
    pub(crate) fn from_wc(wc: &ibv_wc) -> Self {
        Completion {
            slot: SlotHandle(wc.wr_id),
            byte_len: wc.byte_len,
            success: wc.status == rdma_sys::ibv_wc_status::IBV_WC_SUCCESS,
        }
    }
}

/// Opaque handle identifying one posted-WR slot (and, by convention, the
/// SGE pool index it was bound to at post time). Never constructed from a
/// bare integer outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotHandle(pub(crate) u64);

impl SlotHandle {
    pub fn new(index: usize) -> Self {
        SlotHandle(index as u64)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A registered memory region, identified by its verbs lkey.
#[derive(Debug, Clone, Copy)]
pub struct MrHandle {
    pub lkey: u32,
    pub addr: usize,
    pub len: usize,
}
