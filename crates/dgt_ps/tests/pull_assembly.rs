//! End-to-end request lifecycle over the in-process transport: response
//! counting, pre-credited empty slices, pull assembly, and callback
//! delivery.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dgt_core::types::f32_bytes;
use dgt_ps::{DgtConfig, PullBuffer};

use common::{cluster, default_channels};

/// First key owned by the second server under an even two-way split.
fn second_half_key() -> u64 {
    u64::MAX / 2 + 5
}

#[test]
fn pull_assembles_across_servers_in_key_order() {
    let cluster = cluster(2, DgtConfig::default(), default_channels());
    let worker = &cluster.worker;

    let far = second_half_key();
    let keys = [1u64, 3, far];
    let ts = worker
        .push(&keys, &f32_bytes(&[10.0, 30.0, 50.0]), &[], 0, None, 0)
        .unwrap();
    worker.wait(ts);

    let fired = Arc::new(AtomicUsize::new(0));
    let dst = PullBuffer::with_lens();
    let cb: dgt_ps::Callback = {
        let fired = Arc::clone(&fired);
        Box::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    let ts = worker.pull(&keys, &dst, 0, Some(cb), 0).unwrap();
    worker.wait(ts);

    assert_eq!(dst.vals_f32(), vec![10.0, 30.0, 50.0]);
    assert_eq!(dst.lens(), Some(vec![1, 1, 1]));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Waiting again on a completed request returns immediately and the
    // callback stays fired-once.
    worker.wait(ts);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn empty_slices_are_pre_credited() {
    let cluster = cluster(2, DgtConfig::default(), default_channels());
    let worker = &cluster.worker;

    // Both keys live on the first server; the second server never sees the
    // request and its response is credited up front.
    let ts = worker
        .push(&[2, 4], &f32_bytes(&[1.0, 2.0]), &[], 0, None, 0)
        .unwrap();
    worker.wait(ts);

    let dst = PullBuffer::new();
    let ts = worker.pull(&[2, 4], &dst, 0, None, 0).unwrap();
    worker.wait(ts);
    assert_eq!(dst.vals_f32(), vec![1.0, 2.0]);
}

#[test]
fn empty_request_completes_on_the_spot() {
    let cluster = cluster(2, DgtConfig::default(), default_channels());
    let fired = Arc::new(AtomicUsize::new(0));
    let dst = PullBuffer::new();
    let cb: dgt_ps::Callback = {
        let fired = Arc::clone(&fired);
        Box::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    let ts = cluster.worker.pull(&[], &dst, 0, Some(cb), 0).unwrap();
    cluster.worker.wait(ts);
    assert!(dst.vals().is_empty());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn push_pull_returns_the_accumulated_values() {
    let cluster = cluster(2, DgtConfig::default(), default_channels());
    let worker = &cluster.worker;

    let keys = [4u64, second_half_key()];
    let ts = worker
        .push(&keys, &f32_bytes(&[1.0, 2.0]), &[], 0, None, 0)
        .unwrap();
    worker.wait(ts);

    let dst = PullBuffer::new();
    let ts = worker
        .push_pull(&keys, &f32_bytes(&[0.5, 0.25]), &[], &dst, 0, None, 0)
        .unwrap();
    worker.wait(ts);
    assert_eq!(dst.vals_f32(), vec![1.5, 2.25]);
}

#[test]
fn push_callback_fires_after_all_acks() {
    let cluster = cluster(3, DgtConfig::default(), default_channels());
    let fired = Arc::new(AtomicUsize::new(0));
    let cb: dgt_ps::Callback = {
        let fired = Arc::clone(&fired);
        Box::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    let far = second_half_key();
    let ts = cluster
        .worker
        .push(&[1, far], &f32_bytes(&[1.0, 1.0]), &[], 0, Some(cb), 0)
        .unwrap();
    cluster.worker.wait(ts);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn store_state_reflects_repeated_pushes() {
    let cluster = cluster(1, DgtConfig::default(), default_channels());
    let worker = &cluster.worker;

    for _ in 0..3 {
        let ts = worker
            .push(&[7], &f32_bytes(&[2.0, 3.0]), &[], 0, None, 0)
            .unwrap();
        worker.wait(ts);
    }
    assert_eq!(cluster.stores[0].get(7), Some(vec![6.0, 9.0]));
}
