//! Integration tests against the fake NIC/ring backends, covering the
//! concrete scenarios and boundary behaviors this crate commits to.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use rocedada::cli::RawArgs;
use rocedada::config::ReceiveParams;
use rocedada::engine::batch::{register_ring, MrStrategy};
use rocedada::error::CaptureError;
use rocedada::ring::RingAttachment;
use rocedada::test_util::{FakeNic, FakeRing};

fn raw_args() -> RawArgs {
    RawArgs {
        device: 0,
        smac: "52:54:00:12:34:56".into(),
        dmac: "52:54:00:12:34:57".into(),
        sip: "10.0.0.1".into(),
        dip: "10.0.0.2".into(),
        sport: 4791,
        dport: 4791,
        pkt_size: 8192,
        send_n: 2048,
        nsge: 4,
        key: "1234abcd".into(),
        gpu: None,
        cpu: None,
        nbufs: 8,
        file_bytes: 0,
        dump_dir: None as Option<PathBuf>,
        dump_header: None,
        debug: false,
        direct_to_ring: true,
        send: false,
    }
}

// Scenario 1: single-MR fast path. A contiguous ring of 8x16MiB blocks with
// block_size == B * pkt_size should register as one whole-ring MR and allow
// DirectToRing.
#[test]
fn scenario_single_mr_fast_path() {
    let mut nic = FakeNic::new();
    let mut ring = FakeRing::new(8, 2048 * 8192);
    ring.attach(0, 2048 * 8192, 8, None).unwrap();

    let strategy = register_ring(&mut nic, &ring).unwrap();
    assert!(!strategy.forces_staged_copy());
    assert!(matches!(strategy, MrStrategy::WholeRing(_)));
}

// Scenario 2: per-block fallback. Same geometry, non-contiguous ring:
// whole-ring registration isn't possible, so per-block MRs are used and
// DirectToRing is disabled (forces staged-copy).
#[test]
fn scenario_per_block_fallback_forces_staged_copy() {
    let mut nic = FakeNic::new();
    let mut ring = FakeRing::new_non_contiguous(8, 2048 * 8192);
    ring.attach(0, 2048 * 8192, 8, None).unwrap();

    let strategy = register_ring(&mut nic, &ring).unwrap();
    assert!(strategy.forces_staged_copy());
    match strategy {
        MrStrategy::PerBlock(mrs) => {
            assert_eq!(mrs.len(), 8);
            // Invariant 5: each block's registration is distinct, so the
            // lkey bound to block i's SGEs can only ever be block_mrs[i]'s.
            let mut lkeys: Vec<u32> = mrs.iter().map(|m| m.lkey).collect();
            lkeys.sort_unstable();
            lkeys.dedup();
            assert_eq!(lkeys.len(), 8);
        }
        MrStrategy::WholeRing(_) => panic!("expected per-block fallback"),
    }
}

// Scenario 3: backpressure. With ring capacity N blocks all published and
// undrained, acquiring the next block must block until a reader drains one.
#[test]
fn scenario_backpressure_blocks_until_reader_drains() {
    let mut ring = FakeRing::new(2, 4096);
    ring.attach(0, 4096, 2, None).unwrap();

    for _ in 0..2 {
        ring.acquire_next_writable_block().unwrap();
        ring.note_batch_written(4096).unwrap();
        ring.publish(4096).unwrap();
    }

    let drain = ring.drain_handle();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(30));
        drain.drain_one();
    });

    let started = std::time::Instant::now();
    ring.acquire_next_writable_block().unwrap();
    assert!(started.elapsed() >= std::time::Duration::from_millis(20));

    handle.join().unwrap();
}

// Scenario 4: flow-steering refusal still yields a usable engine, just in
// promiscuous mode instead of steered.
#[test]
fn scenario_flow_steering_refusal_falls_back_to_promiscuous() {
    let mut nic = FakeNic::new();
    nic.force_flow_steering_promiscuous = true;

    let tuple = rocedada::verbs::FlowTuple {
        smac: [0; 6],
        dmac: [0; 6],
        sip: "10.0.0.1".parse().unwrap(),
        dip: "10.0.0.2".parse().unwrap(),
        sport: 4791,
        dport: 4791,
    };
    use rocedada::verbs::NicResource;
    let outcome = nic.create_flow_steering(tuple).unwrap();
    assert_eq!(outcome, rocedada::verbs::FlowSteeringOutcome::Promiscuous);
}

// Scenario 6 / boundary behavior: send_n < 8 is startup-fatal with a message
// naming send_n specifically.
#[test]
fn scenario_validation_rejects_send_n_below_eight() {
    let mut args = raw_args();
    args.send_n = 4;
    let err = ReceiveParams::try_from(args).unwrap_err();
    assert!(matches!(err, CaptureError::Validation(msg) if msg.contains("send_n < 8")));
}

// Invariant 4: after send_eod_and_disconnect, no further ring operations
// succeed, and a second call is a no-op that still reports success.
#[test]
fn invariant_no_ring_ops_succeed_after_eod() {
    let mut ring = FakeRing::new(2, 1024);
    ring.attach(0, 1024, 2, None).unwrap();

    ring.send_eod_and_disconnect().unwrap();
    assert!(ring.acquire_next_writable_block().is_err());
    ring.send_eod_and_disconnect().unwrap(); // idempotent
}

// Invariant 1 + round-trip: a fully-written block reports exactly
// block_size bytes filled, and publish/acquire round-trips through the
// byte-accounting state machine correctly.
#[test]
fn invariant_published_block_accounts_for_exactly_block_size_bytes() {
    let mut ring = FakeRing::new(4, 8192);
    ring.attach(0, 8192, 4, None).unwrap();

    ring.acquire_next_writable_block().unwrap();
    let state = ring.note_batch_written(4096).unwrap();
    assert_eq!(state, rocedada::ring::BlockState::Partial);
    let state = ring.note_batch_written(4096).unwrap();
    assert_eq!(state, rocedada::ring::BlockState::Full);
    ring.publish(8192).unwrap();
    assert_eq!(ring.used_bytes(), 8192);
}

// Boundary behavior: a ring with exactly one block still round-trips --
// acquire, one batch, publish, then acquire the same block again once the
// reader has drained it.
#[test]
fn boundary_single_block_ring_round_trips() {
    let mut ring = FakeRing::new(1, 1024);
    ring.attach(0, 1024, 1, None).unwrap();

    ring.acquire_next_writable_block().unwrap();
    ring.note_batch_written(1024).unwrap();
    ring.publish(1024).unwrap();

    let drain = ring.drain_handle();
    drain.drain_one();

    let ptr = ring.acquire_next_writable_block().unwrap();
    assert!(!ptr.is_null());
}
