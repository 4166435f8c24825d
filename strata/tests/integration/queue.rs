use std::sync::Arc;

use tokio::sync::oneshot;

use strata::errors::RequestError;
use strata::network::connection::{ConnectionConfig, ConnectionEvents};
use strata::network::Host;
use strata::{EventLoopGroup, RequestQueueManager};
use strata_cql::frame::response::{result, Response};

use crate::utils::*;

/// 8 producer threads, 1000 requests each, one queue: nothing is lost
/// (every item resolves exactly once) and the loop sees far fewer wakeups
/// than writes.
#[tokio::test]
async fn concurrent_producers_coalesce_wakeups() {
    setup_tracing();
    let (listener, addr) = bind_node().await;

    let node = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        serve_handshake(&mut stream).await.unwrap();
        while let Ok(frame) = read_request_frame(&mut stream).await {
            let write = write_response_frame(
                &mut stream,
                OPCODE_RESULT,
                frame.stream,
                &forged_result_void_body(),
            )
            .await;
            if write.is_err() {
                break;
            }
        }
    });

    let group = EventLoopGroup::new(1).unwrap();
    let manager = Arc::new(RequestQueueManager::new(&group, 16 * 1024));

    let (connected_tx, connected_rx) = oneshot::channel();
    let events = ConnectionEvents {
        connected: Some(connected_tx),
        ..Default::default()
    };
    let connection = group
        .connect(Host::new(addr), ConnectionConfig::default(), events)
        .await
        .unwrap();
    connected_rx.await.unwrap().unwrap();

    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 1000;

    let (results_tx, results_rx) = std::sync::mpsc::channel();
    for _ in 0..PRODUCERS {
        let manager = manager.clone();
        let connection = connection.clone();
        let results_tx = results_tx.clone();
        std::thread::spawn(move || {
            let mut receivers = Vec::with_capacity(PER_PRODUCER);
            for _ in 0..PER_PRODUCER {
                let (tx, rx) = oneshot::channel();
                assert!(manager.write(&connection, make_query("SELECT coalesced"), tx));
                receivers.push(rx);
            }
            results_tx.send(receivers).unwrap();
        });
    }
    drop(results_tx);

    // Producers only touch the ring, so collecting their receivers cannot
    // block on the node.
    let mut receivers = Vec::with_capacity(PRODUCERS * PER_PRODUCER);
    for _ in 0..PRODUCERS {
        receivers.extend(results_rx.recv().unwrap());
    }

    let mut completed = 0usize;
    let mut saturated = 0usize;
    for rx in receivers {
        match rx.await.unwrap() {
            Ok(Response::Result(result::Result::Void)) => completed += 1,
            Err(RequestError::NoStreamsAvailable) => saturated += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(completed + saturated, PRODUCERS * PER_PRODUCER);
    assert!(completed > 0, "no request ever completed");

    let wakeups = manager.get(connection.event_loop()).wakeup_count();
    assert!(wakeups >= 1);
    assert!(
        (wakeups as usize) < PRODUCERS * PER_PRODUCER,
        "wakeups were not coalesced: {wakeups}"
    );

    connection.close();
    manager.close_handles();
    node.await.unwrap();
    group.shutdown();
}

/// Writes after close_handles are refused; items already queued resolve
/// instead of being dropped.
#[tokio::test]
async fn close_handles_applies_backpressure() {
    setup_tracing();
    let group = EventLoopGroup::new(2).unwrap();
    let manager = RequestQueueManager::new(&group, 64);

    // An address nobody answers on: the connection never becomes Ready,
    // so queued items resolve with ConnectionClosed when drained.
    let (listener, addr) = bind_node().await;
    drop(listener);

    let (connected_tx, _connected_rx) = oneshot::channel();
    let events = ConnectionEvents {
        connected: Some(connected_tx),
        ..Default::default()
    };
    let connection = group
        .connect(Host::new(addr), ConnectionConfig::default(), events)
        .await
        .unwrap();

    let queue = manager.get(connection.event_loop());
    let (tx, rx) = oneshot::channel();
    assert!(queue.write(&connection, make_query("SELECT 1"), tx));
    assert!(matches!(
        rx.await.unwrap(),
        Err(RequestError::ConnectionClosed)
    ));

    manager.close_handles();
    let (tx, _rx) = oneshot::channel();
    assert!(!queue.write(&connection, make_query("SELECT 2"), tx));

    group.shutdown();
}
