//! The concurrent receive engine: batched work-request scheduling, the two
//! receive paths, and the shutdown/EOD handshake. `start()` launches the
//! single capture worker thread; `stop()` (or `Drop`) cancels it, joins,
//! and reports what it accomplished.
//!
//! Grounded on `dataplane/worker.rs`'s `WorkerHandle`/`spawn_worker`
//! pattern: a shared `AtomicBool` cancellation flag, a named
//! `thread::Builder` spawn, and a `Drop` impl that stops the worker.

pub mod batch;
pub mod direct;
pub mod send;
pub mod staged;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::config::{Mode, ReceiveParams};
use crate::error::{CaptureError, Result};
use crate::header::HeaderRecord;
use crate::hugepage::StagingBuffer;
use crate::ring::RingAttachment;
use crate::verbs::{FlowSteeringOutcome, FlowTuple, NicResource};

use batch::{register_ring, unregister_all, MrStrategy};

/// What the capture worker accomplished by the time it stopped, whether by
/// cancellation or by hitting a runtime-fatal condition.
#[derive(Debug)]
pub struct EngineReport {
    pub packets_captured: u64,
    pub blocks_published: u64,
    pub outcome: EngineOutcome,
}

#[derive(Debug)]
pub enum EngineOutcome {
    Cancelled,
    Fatal(CaptureError),
}

/// Handle to the running capture worker. `stop()` cancels it and blocks
/// until it has joined, mirroring `WorkerHandle::stop`/`join`.
pub struct EngineHandle {
    thread: Option<JoinHandle<EngineReport>>,
    cancel: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Cancel the worker and wait for it to join. Calling this twice is
    /// safe; the second call returns a synthetic cancelled report.
    pub fn stop(&mut self) -> EngineReport {
        self.cancel.store(true, Ordering::Release);
        match self.thread.take() {
            Some(handle) => handle.join().unwrap_or(EngineReport {
                packets_captured: 0,
                blocks_published: 0,
                outcome: EngineOutcome::Fatal(CaptureError::Verbs(
                    "capture worker thread panicked".into(),
                )),
            }),
            None => EngineReport {
                packets_captured: 0,
                blocks_published: 0,
                outcome: EngineOutcome::Cancelled,
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
    }
}

/// Performs all startup-fatal/startup-degraded setup (QP bring-up, flow
/// steering, memory registration, initial WR posting, tail-zeroing) and
/// spawns the capture worker. `nic` and `ring` are consumed by the worker
/// thread for its lifetime.
pub fn start(
    mut nic: Box<dyn NicResource + Send>,
    mut ring: Box<dyn RingAttachment + Send>,
    params: ReceiveParams,
    header: Option<HeaderRecord>,
) -> Result<EngineHandle> {
    let w = params.work_request_count();
    nic.bring_up(w, w, params.nsge)?;

    let tuple = FlowTuple {
        smac: params.smac,
        dmac: params.dmac,
        sip: params.sip,
        dip: params.dip,
        sport: params.sport,
        dport: params.dport,
    };
    match nic.create_flow_steering(tuple)? {
        FlowSteeringOutcome::Steered => info!("flow steering installed"),
        FlowSteeringOutcome::Promiscuous => {
            warn!("flow steering creation failed; continuing in promiscuous mode")
        }
    }

    ring.attach(params.ring_key, expected_block_bytes(&params), params.nbufs, header.as_ref())?;

    let block_size = ring.block_size();
    let need = (params.send_n * params.pkt_size) as u64;
    let tail = if need == 0 { 0 } else { block_size % need };
    if tail != 0 {
        warn!(
            block_size,
            need, tail, "block_size is not a multiple of send_n * pkt_size; zeroing block tails"
        );
        zero_block_tails(ring.as_ref(), tail);
    }

    let mut mr_strategy = register_ring(nic.as_mut(), ring.as_ref())?;
    let direct_to_ring = params.direct_to_ring && !mr_strategy.forces_staged_copy();
    if params.direct_to_ring && !direct_to_ring {
        warn!("per-block MR fallback forces staged-copy mode; DirectToRing disabled");
    }

    let staging = if direct_to_ring {
        None
    } else {
        let buf = StagingBuffer::new(w * params.pkt_size, params.gpu_id).ok_or_else(|| {
            CaptureError::Registration("failed to allocate staging buffer".into())
        })?;
        Some(buf)
    };

    let staging_mr = if let Some(buf) = &staging {
        Some(nic.register_memory(buf.ptr(), buf.size(), params.pkt_size)?)
    } else {
        None
    };

    if let (Some(buf), Some(mr)) = (&staging, &staging_mr) {
        let slots: Vec<_> = (0..w).map(crate::verbs::SlotHandle::new).collect();
        for &slot in &slots {
            let addr = buf.slot_ptr(slot.index(), params.pkt_size);
            nic.bind_recv_sge(slot, addr, params.pkt_size, *mr);
        }
        nic.post_recv(&slots)?;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_for_worker = cancel.clone();
    let mode = params.mode;
    let cpu_id = params.cpu_id;

    let builder = thread::Builder::new().name("rocedada-capture".into());
    let thread = builder
        .spawn(move || {
            if let Some(core) = cpu_id {
                if let Err(e) = pin_current_thread(core) {
                    warn!(core, error = %e, "failed to pin capture worker to CPU core");
                }
            }
            let result = run_worker(
                nic,
                ring,
                staging,
                staging_mr,
                mr_strategy_take(&mut mr_strategy),
                params,
                mode,
                &cancel_for_worker,
            );
            match result {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "capture worker exited with a fatal error");
                    EngineReport {
                        packets_captured: 0,
                        blocks_published: 0,
                        outcome: EngineOutcome::Fatal(e),
                    }
                }
            }
        })?;

    Ok(EngineHandle {
        thread: Some(thread),
        cancel,
    })
}

fn expected_block_bytes(params: &ReceiveParams) -> u64 {
    (params.send_n * params.pkt_size) as u64
}

/// Pins the calling thread to `core`, mirroring `pthread_setaffinity_np`
/// being called from the capture thread itself when `bind_cpu_id >= 0`.
fn pin_current_thread(core: u32) -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(core as usize)
        .map_err(|e| CaptureError::Verbs(format!("invalid CPU core {core}: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)
        .map_err(|e| CaptureError::Verbs(format!("sched_setaffinity failed: {e}")))
}

/// Zeroes the trailing `tail` bytes of every ring block once, up front,
/// so a short final batch in a block never leaves stale data from a
/// previous session visible past the last full write.
fn zero_block_tails(ring: &dyn RingAttachment, tail: u64) {
    let block_size = ring.block_size();
    for &addr in ring.block_base_addrs() {
        let start = block_size.saturating_sub(tail) as usize;
        unsafe {
            let ptr = (addr as *mut u8).add(start);
            std::ptr::write_bytes(ptr, 0, tail as usize);
        }
    }
}

/// `MrStrategy` doesn't implement `Clone`/`Copy` (an `MrHandle` is cheap to
/// copy but `PerBlock`'s `Vec` isn't meant to be duplicated); this takes
/// ownership out of the caller's slot so it can be moved into the worker
/// closure without fighting the borrow checker over a field capture.
fn mr_strategy_take(slot: &mut MrStrategy) -> MrStrategy {
    std::mem::replace(slot, MrStrategy::PerBlock(Vec::new()))
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    mut nic: Box<dyn NicResource + Send>,
    mut ring: Box<dyn RingAttachment + Send>,
    staging: Option<StagingBuffer>,
    staging_mr: Option<crate::verbs::MrHandle>,
    mr_strategy: MrStrategy,
    params: ReceiveParams,
    mode: Mode,
    cancel: &AtomicBool,
) -> Result<EngineReport> {
    let report = match mode {
        Mode::Send => {
            let staging = staging.ok_or_else(|| {
                CaptureError::Registration("send mode requires a staging buffer".into())
            })?;
            let mr = staging_mr
                .ok_or_else(|| CaptureError::Registration("send mode requires a staging MR".into()))?;
            let mut counter = 0u8;
            let result = send::run(nic.as_mut(), &staging, mr, &params, cancel, |_slot, payload| {
                payload.fill(counter);
                counter = counter.wrapping_add(1);
            })?;
            EngineReport {
                packets_captured: result.packets_sent,
                blocks_published: 0,
                outcome: EngineOutcome::Cancelled,
            }
        }
        Mode::Receive if staging.is_some() => {
            let staging = staging.unwrap();
            let mr = staging_mr
                .ok_or_else(|| CaptureError::Registration("staged mode requires a staging MR".into()))?;
            let result = staged::run(nic.as_mut(), ring.as_mut(), &staging, mr, &params, cancel)?;
            EngineReport {
                packets_captured: result.packets_captured,
                blocks_published: result.blocks_published,
                outcome: EngineOutcome::Cancelled,
            }
        }
        Mode::Receive => {
            let mr = match &mr_strategy {
                MrStrategy::WholeRing(mr) => *mr,
                MrStrategy::PerBlock(_) => {
                    return Err(CaptureError::Registration(
                        "DirectToRing requires a single whole-ring MR".into(),
                    ))
                }
            };
            let result = direct::run(nic.as_mut(), ring.as_mut(), mr, &params, cancel)?;
            EngineReport {
                packets_captured: result.packets_captured,
                blocks_published: result.blocks_published,
                outcome: EngineOutcome::Cancelled,
            }
        }
    };

    unregister_all(nic.as_mut(), mr_strategy)?;
    ring.send_eod_and_disconnect()?;
    drop(nic);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeNic, FakeRing};

    fn test_params(direct_to_ring: bool) -> ReceiveParams {
        ReceiveParams {
            mode: Mode::Receive,
            device_index: 0,
            smac: [0; 6],
            dmac: [0; 6],
            sip: "10.0.0.1".parse().unwrap(),
            dip: "10.0.0.2".parse().unwrap(),
            sport: 4791,
            dport: 4791,
            pkt_size: 1024,
            send_n: 8,
            nsge: 4,
            ring_key: 0,
            gpu_id: None,
            cpu_id: None,
            nbufs: 4,
            file_bytes: 0,
            dump_dir: None,
            dump_header: None,
            debug: false,
            direct_to_ring,
        }
    }

    #[test]
    fn test_staged_capture_round_trip_publishes_one_block() {
        let nic = Box::new(FakeNic::new());
        let block_bytes = 8 * 1024; // send_n * pkt_size == block_size
        let ring = Box::new(FakeRing::new(4, block_bytes as u64));

        let params = test_params(false);
        let mut handle = start(nic, ring, params, None).unwrap();

        // Let the worker post its initial WRs, then the test stands in for
        // the NIC by completing them -- but FakeNic state lives inside the
        // worker thread now, so this test only exercises that start/stop
        // round-trips cleanly without a hardware completion source.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let report = handle.stop();
        assert!(matches!(report.outcome, EngineOutcome::Cancelled));
    }

    #[test]
    fn test_direct_to_ring_with_non_contiguous_ring_forces_staged() {
        let nic = Box::new(FakeNic::new());
        let ring = Box::new(FakeRing::new_non_contiguous(4, 8192));
        let params = test_params(true);
        let mut handle = start(nic, ring, params, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let _ = handle.stop();
    }
}
