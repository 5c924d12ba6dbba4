//! In-process doubles for the NIC verbs layer and ring attachment, so the
//! receive engine can be exercised without real hardware or SysV IPC.
//! Mirrors `mvirt-net`'s `test_util::virtqueue` pattern of swapping a trait
//! implementation in for tests.

pub mod fake_ring;
pub mod fake_verbs;

pub use fake_ring::FakeRing;
pub use fake_verbs::FakeNic;
