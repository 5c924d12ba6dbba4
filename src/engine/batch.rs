//! Shared pieces of the batched completion loop: the bandwidth sampler
//! (spec.md 4.3.1's "every ~1s" accounting) and the memory-region
//! registration strategy (spec.md 4.2).

use std::time::{Duration, Instant};

use tracing::info;

use crate::error::Result;
use crate::ring::RingAttachment;
use crate::verbs::{MrHandle, NicResource};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Emits one `info!` bandwidth line roughly every second, computed from the
/// completions observed and the configured packet size.
pub struct BandwidthSampler {
    pkt_size: usize,
    window_completions: u64,
    window_start: Instant,
}

impl BandwidthSampler {
    pub fn new(pkt_size: usize) -> Self {
        BandwidthSampler {
            pkt_size,
            window_completions: 0,
            window_start: Instant::now(),
        }
    }

    pub fn record(&mut self, completions: u64) {
        self.window_completions += completions;
        let elapsed = self.window_start.elapsed();
        if elapsed >= SAMPLE_INTERVAL {
            let bits = self.window_completions * self.pkt_size as u64 * 8;
            let gbps = bits as f64 / elapsed.as_nanos() as f64;
            info!(
                gbps = gbps,
                pkts = self.window_completions,
                elapsed_ms = elapsed.as_millis() as u64,
                "capture bandwidth sample"
            );
            self.window_completions = 0;
            self.window_start = Instant::now();
        }
    }
}

/// Result of [`register_ring`]: either one MR spanning the whole ring, or
/// one MR per block when the ring's blocks are not virtually contiguous.
pub enum MrStrategy {
    WholeRing(MrHandle),
    PerBlock(Vec<MrHandle>),
}

impl MrStrategy {
    pub fn forces_staged_copy(&self) -> bool {
        matches!(self, MrStrategy::PerBlock(_))
    }
}

/// `register_ring` from spec.md 4.2: enumerate block addresses, test
/// contiguity, register one MR over the whole span if contiguous,
/// otherwise register each block individually and signal the fallback.
pub fn register_ring(nic: &mut dyn NicResource, ring: &dyn RingAttachment) -> Result<MrStrategy> {
    let addrs = ring.block_base_addrs();
    let block_size = ring.block_size() as usize;

    let contiguous = addrs
        .iter()
        .enumerate()
        .all(|(i, &addr)| addr == addrs[0] + i * block_size);

    if contiguous {
        let mr = nic.register_memory(addrs[0] as *mut u8, addrs.len() * block_size, block_size)?;
        Ok(MrStrategy::WholeRing(mr))
    } else {
        let mut mrs = Vec::with_capacity(addrs.len());
        for &addr in addrs {
            mrs.push(nic.register_memory(addr as *mut u8, block_size, block_size)?);
        }
        Ok(MrStrategy::PerBlock(mrs))
    }
}

/// Reverses `register_ring`'s registrations in LIFO order. Must run before
/// the QP is destroyed.
pub fn unregister_all(nic: &mut dyn NicResource, strategy: MrStrategy) -> Result<()> {
    match strategy {
        MrStrategy::WholeRing(mr) => nic.deregister_memory(mr),
        MrStrategy::PerBlock(mrs) => {
            for mr in mrs.into_iter().rev() {
                nic.deregister_memory(mr)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeNic, FakeRing};

    #[test]
    fn test_register_ring_contiguous_yields_whole_ring_mr() {
        let mut nic = FakeNic::new();
        let mut ring = FakeRing::new(4, 4096);
        ring.attach(0, 4096, 4, None).unwrap();
        let strategy = register_ring(&mut nic, &ring).unwrap();
        assert!(!strategy.forces_staged_copy());
    }

    #[test]
    fn test_register_ring_non_contiguous_falls_back_to_per_block() {
        let mut nic = FakeNic::new();
        let mut ring = FakeRing::new_non_contiguous(4, 4096);
        ring.attach(0, 4096, 4, None).unwrap();
        let strategy = register_ring(&mut nic, &ring).unwrap();
        assert!(strategy.forces_staged_copy());
    }
}
