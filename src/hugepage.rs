//! Host-memory staging buffer backing the engine's staged-copy receive path.
//!
//! A single contiguous, optionally page-locked region of `W * pkt_size`
//! bytes, allocated once and registered as one NIC memory region for the
//! lifetime of the receive engine. GPU-resident placement (`gpu_id`) is
//! recorded but the actual device allocation is left to the GPUDirect
//! library, which is an external collaborator this crate does not vendor.

use nix::libc;
use std::ptr;

pub struct StagingBuffer {
    ptr: *mut u8,
    size: usize,
    gpu_id: Option<u32>,
}

// Safety: the pointer is only handed out through `ptr()`/`size()`; the
// buffer is written solely by the capture worker that owns this value.
unsafe impl Send for StagingBuffer {}

impl StagingBuffer {
    /// Allocate `size` bytes of host memory, locking it resident
    /// (`MAP_LOCKED`) so the NIC's DMA engine never faults on it mid-flight.
    /// `gpu_id` is threaded through for callers that intend to hand the
    /// pointer to a GPUDirect registration path instead; this allocator
    /// always backs it with host memory.
    pub fn new(size: usize, gpu_id: Option<u32>) -> Option<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_LOCKED,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return None;
        }

        Some(Self {
            ptr: ptr as *mut u8,
            size,
            gpu_id,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn gpu_id(&self) -> Option<u32> {
        self.gpu_id
    }

    /// Base address of SGE slot `index`, each `slot_size` bytes wide.
    pub fn slot_ptr(&self, index: usize, slot_size: usize) -> *mut u8 {
        debug_assert!((index + 1) * slot_size <= self.size);
        unsafe { self.ptr.add(index * slot_size) }
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_ptr_is_offset_by_slot_size() {
        let buf = StagingBuffer::new(4096, None).unwrap();
        let base = buf.ptr() as usize;
        assert_eq!(buf.slot_ptr(0, 512) as usize, base);
        assert_eq!(buf.slot_ptr(3, 512) as usize, base + 3 * 512);
    }

    #[test]
    fn test_gpu_id_is_carried_but_not_required() {
        let buf = StagingBuffer::new(4096, Some(2)).unwrap();
        assert_eq!(buf.gpu_id(), Some(2));
        let buf = StagingBuffer::new(4096, None).unwrap();
        assert_eq!(buf.gpu_id(), None);
    }
}
