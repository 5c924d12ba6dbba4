//! `rdma-sys`-backed implementation of [`super::NicResource`].
//!
//! Mirrors `ibv_utils.cpp`: one PD/CQ/QP per device, a flat SGE/WR pool
//! indexed by slot, QP bring-up through the four-state machine with a
//! port-active check ahead of it, and the three-spec raw-Ethernet flow
//! attribute for UDP flow steering.

use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::ptr;

use rdma_sys::*;
use tracing::{info, warn};

use super::types::{Completion, FlowSteeringOutcome, FlowTuple, MrHandle, QpState, SlotHandle};
use super::NicResource;
use crate::error::CaptureError;
use crate::error::Result;

#[repr(C)]
struct RawEthFlowAttr {
    attr: ibv_flow_attr,
    spec_eth: ibv_flow_spec_eth,
    spec_ipv4: ibv_flow_spec_ipv4,
    spec_udp: ibv_flow_spec_tcp_udp,
}

pub struct RealNic {
    context: *mut ibv_context,
    pd: *mut ibv_pd,
    cq: *mut ibv_cq,
    qp: *mut ibv_qp,
    flow: *mut ibv_flow,
    sge: Vec<ibv_sge>,
    nsge: u32,
    state: QpState,
    mrs: HashMap<u32, *mut ibv_mr>,
}

// Safety: all verbs handles below are only ever touched from the single
// capture worker thread that owns this value; `Send` lets that thread be
// spawned with the handle moved in.
unsafe impl Send for RealNic {}

impl RealNic {
    pub fn open(device_index: u32) -> Result<Self> {
        unsafe {
            let mut num_devices = 0i32;
            let devices = ibv_get_device_list(&mut num_devices);
            if devices.is_null() {
                return Err(CaptureError::Verbs("failed to get IB device list".into()));
            }
            if device_index as i32 >= num_devices {
                ibv_free_device_list(devices);
                return Err(CaptureError::Verbs(format!(
                    "invalid device index {device_index} ({num_devices} devices present)"
                )));
            }
            let dev = *devices.add(device_index as usize);
            let context = ibv_open_device(dev);
            ibv_free_device_list(devices);
            if context.is_null() {
                return Err(CaptureError::Verbs("failed to open IB device".into()));
            }

            let pd = ibv_alloc_pd(context);
            if pd.is_null() {
                return Err(CaptureError::Verbs("failed to allocate PD".into()));
            }

            Ok(RealNic {
                context,
                pd,
                cq: ptr::null_mut(),
                qp: ptr::null_mut(),
                flow: ptr::null_mut(),
                sge: Vec::new(),
                nsge: 0,
                state: QpState::Reset,
                mrs: HashMap::new(),
            })
        }
    }
}

impl NicResource for RealNic {
    fn bring_up(&mut self, send_wr_count: usize, recv_wr_count: usize, nsge: u32) -> Result<()> {
        unsafe {
            let wr_num = send_wr_count.max(recv_wr_count);
            self.cq = ibv_create_cq(self.context, wr_num as i32, ptr::null_mut(), ptr::null_mut(), 0);
            if self.cq.is_null() {
                return Err(CaptureError::Verbs("failed to create CQ".into()));
            }

            let mut qp_init_attr: ibv_qp_init_attr = std::mem::zeroed();
            qp_init_attr.send_cq = self.cq;
            qp_init_attr.recv_cq = self.cq;
            qp_init_attr.qp_type = ibv_qp_type::IBV_QPT_RAW_PACKET;
            qp_init_attr.cap.max_send_wr = send_wr_count as u32;
            qp_init_attr.cap.max_recv_wr = recv_wr_count as u32;
            qp_init_attr.cap.max_send_sge = nsge;
            qp_init_attr.cap.max_recv_sge = nsge;

            self.qp = ibv_create_qp(self.pd, &mut qp_init_attr);
            if self.qp.is_null() {
                return Err(CaptureError::Verbs("failed to create QP".into()));
            }

            self.nsge = nsge;
            self.sge = vec![std::mem::zeroed::<ibv_sge>(); wr_num * nsge as usize];

            let mut port_attr: ibv_port_attr = std::mem::zeroed();
            if ibv_query_port(self.context, 1, &mut port_attr) == 0
                && port_attr.state != ibv_port_state::IBV_PORT_ACTIVE
            {
                warn!("port 1 is not ACTIVE; flow steering will likely fail");
            }

            let mut attr: ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
            attr.port_num = 1;
            let mask = ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_PORT;
            if ibv_modify_qp(self.qp, &mut attr, mask.0 as i32) != 0 {
                return Err(CaptureError::Verbs("QP transition RESET -> INIT failed".into()));
            }
            self.state = QpState::Init;
            info!(state = "INIT", "QP state transition");

            let mut attr: ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            if ibv_modify_qp(self.qp, &mut attr, ibv_qp_attr_mask::IBV_QP_STATE.0 as i32) != 0 {
                return Err(CaptureError::Verbs("QP transition INIT -> RTR failed".into()));
            }
            self.state = QpState::Rtr;
            info!(state = "RTR", "QP state transition");

            let mut attr: ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            if ibv_modify_qp(self.qp, &mut attr, ibv_qp_attr_mask::IBV_QP_STATE.0 as i32) != 0 {
                return Err(CaptureError::Verbs("QP transition RTR -> RTS failed".into()));
            }
            self.state = QpState::Rts;

            let mut qp_attr: ibv_qp_attr = std::mem::zeroed();
            let mut qp_init_attr_query: ibv_qp_init_attr = std::mem::zeroed();
            if ibv_query_qp(
                self.qp,
                &mut qp_attr,
                ibv_qp_attr_mask::IBV_QP_STATE.0 as i32,
                &mut qp_init_attr_query,
            ) != 0
                || qp_attr.qp_state != ibv_qp_state::IBV_QPS_RTS
            {
                return Err(CaptureError::Verbs("QP did not confirm RTS after bring-up".into()));
            }
            info!(state = "RTS", "QP bring-up complete");
        }
        Ok(())
    }

    fn register_memory(&mut self, addr: *mut u8, len: usize, slot_size: usize) -> Result<MrHandle> {
        if slot_size != 0 && len % slot_size != 0 {
            return Err(CaptureError::Registration(format!(
                "region length {len} is not a multiple of slot size {slot_size}"
            )));
        }
        unsafe {
            let mr = ibv_reg_mr(self.pd, addr as *mut _, len, ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as i32);
            if mr.is_null() {
                return Err(CaptureError::Registration("ibv_reg_mr failed".into()));
            }
            let handle = MrHandle {
                lkey: (*mr).lkey,
                addr: addr as usize,
                len,
            };
            self.mrs.insert(handle.lkey, mr);
            Ok(handle)
        }
    }

    fn deregister_memory(&mut self, mr: MrHandle) -> Result<()> {
        match self.mrs.remove(&mr.lkey) {
            Some(ptr) => unsafe {
                if ibv_dereg_mr(ptr) != 0 {
                    return Err(CaptureError::Registration("ibv_dereg_mr failed".into()));
                }
                Ok(())
            },
            None => Err(CaptureError::Registration(format!(
                "deregister_memory: unknown lkey {}",
                mr.lkey
            ))),
        }
    }

    fn create_flow_steering(&mut self, tuple: FlowTuple) -> Result<FlowSteeringOutcome> {
        unsafe {
            let mut flow_attr: RawEthFlowAttr = std::mem::zeroed();
            flow_attr.attr.type_ = ibv_flow_attr_type::IBV_FLOW_ATTR_NORMAL;
            flow_attr.attr.size = std::mem::size_of::<RawEthFlowAttr>() as u16;
            flow_attr.attr.num_of_specs = 3;
            flow_attr.attr.port = 1;

            flow_attr.spec_eth.type_ = ibv_flow_spec_type::IBV_FLOW_SPEC_ETH;
            flow_attr.spec_eth.size = std::mem::size_of::<ibv_flow_spec_eth>() as u16;
            flow_attr.spec_eth.val.dst_mac = tuple.dmac;
            flow_attr.spec_eth.val.src_mac = tuple.smac;
            flow_attr.spec_eth.mask.dst_mac = [0xff; 6];
            flow_attr.spec_eth.mask.src_mac = [0xff; 6];

            flow_attr.spec_ipv4.type_ = ibv_flow_spec_type::IBV_FLOW_SPEC_IPV4;
            flow_attr.spec_ipv4.size = std::mem::size_of::<ibv_flow_spec_ipv4>() as u16;
            flow_attr.spec_ipv4.val.src_ip = u32::from(tuple.sip).to_be();
            flow_attr.spec_ipv4.val.dst_ip = u32::from(tuple.dip).to_be();
            flow_attr.spec_ipv4.mask.src_ip = u32::MAX;
            flow_attr.spec_ipv4.mask.dst_ip = u32::MAX;

            flow_attr.spec_udp.type_ = ibv_flow_spec_type::IBV_FLOW_SPEC_UDP;
            flow_attr.spec_udp.size = std::mem::size_of::<ibv_flow_spec_tcp_udp>() as u16;
            flow_attr.spec_udp.val.src_port = tuple.sport.to_be();
            flow_attr.spec_udp.val.dst_port = tuple.dport.to_be();
            flow_attr.spec_udp.mask.src_port = 0xffff;
            flow_attr.spec_udp.mask.dst_port = 0xffff;

            let flow = ibv_create_flow(self.qp, &mut flow_attr.attr);
            if flow.is_null() {
                warn!("flow creation failed (errno likely EINVAL); falling back to promiscuous");
                return Ok(FlowSteeringOutcome::Promiscuous);
            }
            self.flow = flow;
            Ok(FlowSteeringOutcome::Steered)
        }
    }

    fn post_recv(&mut self, slots: &[SlotHandle]) -> Result<()> {
        unsafe {
            for &slot in slots {
                let idx = slot.index();
                let mut wr: ibv_recv_wr = std::mem::zeroed();
                wr.wr_id = slot.0;
                wr.sg_list = &mut self.sge[idx * self.nsge as usize];
                wr.num_sge = 1;
                let mut bad_wr: *mut ibv_recv_wr = ptr::null_mut();
                if ibv_post_recv(self.qp, &mut wr, &mut bad_wr) != 0 {
                    return Err(CaptureError::Verbs("ibv_post_recv failed".into()));
                }
            }
        }
        Ok(())
    }

    fn bind_recv_sge(&mut self, slot: SlotHandle, addr: *mut u8, len: usize, mr: MrHandle) {
        let idx = slot.index() * self.nsge as usize;
        self.sge[idx].addr = addr as u64;
        self.sge[idx].length = len as u32;
        self.sge[idx].lkey = mr.lkey;
    }

    fn post_send(&mut self, slots: &[SlotHandle]) -> Result<()> {
        unsafe {
            for &slot in slots {
                let idx = slot.index();
                let mut wr: ibv_send_wr = std::mem::zeroed();
                wr.wr_id = slot.0;
                wr.sg_list = &mut self.sge[idx * self.nsge as usize];
                wr.num_sge = 1;
                wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
                wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
                let mut bad_wr: *mut ibv_send_wr = ptr::null_mut();
                if ibv_post_send(self.qp, &mut wr, &mut bad_wr) != 0 {
                    return Err(CaptureError::Verbs("ibv_post_send failed".into()));
                }
            }
        }
        Ok(())
    }

    fn bind_send_sge(&mut self, slot: SlotHandle, addr: *mut u8, len: usize, mr: MrHandle) {
        self.bind_recv_sge(slot, addr, len, mr);
    }

    fn poll_cq(&mut self, max: usize) -> Result<Vec<Completion>> {
        let mut wc: Vec<MaybeUninit<ibv_wc>> = Vec::with_capacity(max);
        unsafe {
            wc.set_len(max);
            let n = ibv_poll_cq(self.cq, max as i32, wc.as_mut_ptr() as *mut ibv_wc);
            if n < 0 {
                return Err(CaptureError::Verbs("ibv_poll_cq returned negative".into()));
            }
            let mut out = Vec::with_capacity(n as usize);
            for entry in wc.iter().take(n as usize) {
                out.push(Completion::from_wc(entry.assume_init_ref()));
            }
            Ok(out)
        }
    }

    fn qp_state(&self) -> QpState {
        self.state
    }
}

impl Drop for RealNic {
    fn drop(&mut self) {
        unsafe {
            for (_, mr) in self.mrs.drain() {
                ibv_dereg_mr(mr);
            }
            if !self.flow.is_null() {
                ibv_destroy_flow(self.flow);
            }
            if !self.qp.is_null() {
                ibv_destroy_qp(self.qp);
            }
            if !self.cq.is_null() {
                ibv_destroy_cq(self.cq);
            }
            if !self.pd.is_null() {
                ibv_dealloc_pd(self.pd);
            }
            if !self.context.is_null() {
                ibv_close_device(self.context);
            }
        }
    }
}
