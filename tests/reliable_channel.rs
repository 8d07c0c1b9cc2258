//! Reliable channel behavior under adverse delivery.
//!
//! Exercises the ordering, exactly-once, ack-convergence, and departure
//! properties against the in-memory hub, including hand-crafted control
//! frames for the precise gap/duplicate/ack scenarios.

mod common;

use common::{connect, fast_protocol, wait_for_peers, wait_until, wait_until_for};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_proto::{ControlMeta, PeerId};
use tandemd::connection::{Connection, Target};
use tandemd::reliable::ReliableChannel;
use tandemd::transport::memory::{FaultPlan, MemoryHub};

const ACTION: &str = "data";

fn collect(channel: &ReliableChannel) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    channel.on_receive(move |data, _, _| sink.lock().push(data.to_vec()));
    received
}

/// Send a hand-crafted sequenced data frame outside any controller.
async fn craft_data(conn: &Connection, to: &PeerId, gsn: u64, sid: &str, payload: &[u8]) {
    let ctrl = ControlMeta::Data {
        gsn,
        sid: sid.to_string(),
        meta: None,
    };
    conn.action(ACTION)
        .unwrap()
        .send(
            payload.to_vec(),
            Target::Peer(to.clone()),
            Some(ctrl.to_value()),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn ordering_survives_reorder_loss_and_duplication() {
    let hub = MemoryHub::new();
    let a = connect(&hub, "a").await;
    let b = connect(&hub, "b").await;
    wait_for_peers(&a, 1).await;

    let tx = ReliableChannel::with_config(&a, ACTION, fast_protocol()).unwrap();
    let rx = ReliableChannel::with_config(&b, ACTION, fast_protocol()).unwrap();
    let received = collect(&rx);

    hub.set_faults(FaultPlan {
        drop_rate: 0.2,
        duplicate_rate: 0.3,
        max_delay: Some(Duration::from_millis(30)),
    });

    let count = 30u8;
    for i in 0..count {
        tx.send(b.self_id(), vec![i], None).await.unwrap();
    }

    wait_until_for(
        "all messages applied despite faults",
        Duration::from_secs(15),
        &mut || received.lock().len() == count as usize,
    )
    .await;

    let got = received.lock();
    let expected: Vec<Vec<u8>> = (0..count).map(|i| vec![i]).collect();
    assert_eq!(*got, expected, "strictly increasing order, no duplicates");

    // With no further loss the sender's outstanding set drains too.
    hub.set_faults(FaultPlan::default());
    drop(got);
    wait_until_for("outstanding drained", Duration::from_secs(10), &mut || {
        tx.outstanding_to(b.self_id()) == 0
    })
    .await;
}

#[tokio::test]
async fn scenario_a_gap_blocks_then_drains_in_order() {
    let hub = MemoryHub::new();
    let a = connect(&hub, "a").await;
    let b = connect(&hub, "b").await;
    wait_for_peers(&a, 1).await;

    let rx = ReliableChannel::with_config(&b, ACTION, fast_protocol()).unwrap();
    let received = collect(&rx);
    let a_id = a.self_id().clone();

    // Transport delivers 2, 3, 1.
    craft_data(&a, b.self_id(), 2, "sess", b"two").await;
    craft_data(&a, b.self_id(), 3, "sess", b"three").await;

    wait_until("both buffered behind the gap", || {
        rx.buffered_from(&a_id) == 2
    })
    .await;
    assert!(received.lock().is_empty(), "nothing applied before the gap fills");
    assert_eq!(rx.applied_cursor(&a_id), 0);

    craft_data(&a, b.self_id(), 1, "sess", b"one").await;

    wait_until("gap filled drains all three", || received.lock().len() == 3).await;
    assert_eq!(
        *received.lock(),
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
    assert_eq!(rx.applied_cursor(&a_id), 3);
    assert_eq!(rx.buffered_from(&a_id), 0);
}

#[tokio::test]
async fn scenario_b_duplicates_apply_once() {
    let hub = MemoryHub::new();
    let a = connect(&hub, "a").await;
    let b = connect(&hub, "b").await;
    wait_for_peers(&a, 1).await;

    let rx = ReliableChannel::with_config(&b, ACTION, fast_protocol()).unwrap();
    let received = collect(&rx);
    let a_id = a.self_id().clone();

    craft_data(&a, b.self_id(), 1, "sess", b"first").await;
    for _ in 0..3 {
        craft_data(&a, b.self_id(), 2, "sess", b"second").await;
    }
    craft_data(&a, b.self_id(), 3, "sess", b"third").await;

    wait_until("sequence applied", || rx.applied_cursor(&a_id) == 3).await;
    // Give any stray duplicate time to surface, then assert exactly once.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *received.lock(),
        vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
    );
}

#[tokio::test]
async fn scenario_c_ack_stops_resend_of_buffered_but_not_missing() {
    let hub = MemoryHub::new();
    let a = connect(&hub, "a").await;
    let b = connect(&hub, "b").await;
    wait_for_peers(&a, 1).await;

    let tx = ReliableChannel::with_config(&a, ACTION, fast_protocol()).unwrap();

    // b records raw sequenced frames instead of running a controller.
    let seen: Arc<Mutex<Vec<(u64, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    b.action(ACTION).unwrap().on_receive(move |_, _, meta| {
        if let Some(ControlMeta::Data { gsn, sid, .. }) = ControlMeta::from_metadata(meta) {
            sink.lock().push((gsn, sid));
        }
    });

    for i in 1u8..=6 {
        tx.send(b.self_id(), vec![i], None).await.unwrap();
    }
    wait_until("b saw all six", || {
        let seen = seen.lock();
        (1..=6).all(|g| seen.iter().any(|(gsn, _)| *gsn == g))
    })
    .await;
    let session = seen.lock()[0].1.clone();

    // b has applied 1..=3 and holds 5 and 6 behind the missing 4.
    let ack = ControlMeta::Ack {
        applied: 3,
        received: vec![5, 6],
        sid: session,
    };
    b.action(ACTION)
        .unwrap()
        .send(
            Bytes::new(),
            Target::Peer(a.self_id().clone()),
            Some(ack.to_value()),
        )
        .await
        .unwrap();

    wait_until("only gsn 4 remains outstanding", || {
        tx.outstanding_to(b.self_id()) == 1
    })
    .await;

    // Let any retransmission already in flight drain before observing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Across several resend windows, 4 keeps coming and 5/6 never do.
    seen.lock().clear();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let seen = seen.lock();
    assert!(
        seen.iter().any(|(gsn, _)| *gsn == 4),
        "the missing gsn keeps being resent"
    );
    assert!(
        seen.iter().all(|(gsn, _)| *gsn == 4),
        "acked and explicitly-received gsns are not resent, got {seen:?}"
    );
}

#[tokio::test]
async fn ack_convergence_after_burst() {
    let hub = MemoryHub::new();
    let a = connect(&hub, "a").await;
    let b = connect(&hub, "b").await;
    wait_for_peers(&a, 1).await;

    let config = fast_protocol();
    let tx = ReliableChannel::with_config(&a, ACTION, config.clone()).unwrap();
    let rx = ReliableChannel::with_config(&b, ACTION, config.clone()).unwrap();
    let received = collect(&rx);

    for i in 0u8..20 {
        tx.send(b.self_id(), vec![i], None).await.unwrap();
    }
    let burst_done = Instant::now();

    wait_until("burst applied", || received.lock().len() == 20).await;
    wait_until("outstanding empty", || tx.outstanding_to(b.self_id()) == 0).await;

    // Within roughly resend timeout + ack debounce of the last send
    // (generous slack for scheduling).
    assert!(
        burst_done.elapsed()
            < config.resend_timeout() + config.ack_debounce() + Duration::from_millis(900),
        "outstanding took too long to drain: {:?}",
        burst_done.elapsed()
    );
}

#[tokio::test]
async fn departure_discards_state_and_stops_retransmission() {
    let hub = MemoryHub::new();
    let a = connect(&hub, "a").await;
    let b = connect(&hub, "b").await;
    wait_for_peers(&a, 1).await;

    let tx = ReliableChannel::with_config(&a, ACTION, fast_protocol()).unwrap();
    let b_id = b.self_id().clone();

    // No controller on b, so nothing is ever acked and retransmission runs.
    tx.send(&b_id, vec![1u8], None).await.unwrap();
    tx.send(&b_id, vec![2u8], None).await.unwrap();
    assert_eq!(tx.outstanding_to(&b_id), 2);

    hub.disconnect(&b_id);
    wait_until("state discarded on departure", || !tx.has_state_for(&b_id)).await;

    // A peer rejoining under the same id sees no stale retransmissions.
    let b2 = connect(&hub, "b").await;
    let frames: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&frames);
    b2.action(ACTION)
        .unwrap()
        .on_receive(move |_, _, _| *sink.lock() += 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*frames.lock(), 0, "no retry survives departure");
}

#[tokio::test]
async fn unreliable_actions_bypass_sequencing() {
    let hub = MemoryHub::new();
    let a = connect(&hub, "a").await;
    let b = connect(&hub, "b").await;
    wait_for_peers(&a, 1).await;

    let hits: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&hits);
    b.action("raw")
        .unwrap()
        .on_receive(move |_, _, _| *sink.lock() += 1);

    // Every delivery duplicated: a plain action hands both copies to the
    // subscriber. Callers opting out of reliability must tolerate this.
    hub.set_faults(FaultPlan {
        duplicate_rate: 1.0,
        ..FaultPlan::default()
    });
    a.action("raw")
        .unwrap()
        .send(vec![7u8], Target::Broadcast, None)
        .await
        .unwrap();

    wait_until("both copies delivered", || *hits.lock() == 2).await;
}
