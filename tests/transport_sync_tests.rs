use serde_json::Value;
use stagelink::agent::TransportAgent;
use stagelink::clock::{ClockSource, SoftwareClock, TransportState};
use stagelink::coordinator::TransportCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

async fn spawn_agent(node_id: &str) -> (Arc<SoftwareClock>, u16) {
    let clock = Arc::new(SoftwareClock::new(48_000));
    let agent = TransportAgent::bind(
        "127.0.0.1:0",
        node_id.to_string(),
        Arc::clone(&clock) as Arc<dyn ClockSource>,
    )
    .await
    .unwrap();
    let port = agent.local_addr().port();
    let handle = agent.spawn();
    // Keep the loops alive for the whole test.
    std::mem::forget(handle);
    (clock, port)
}

#[tokio::test]
async fn scheduled_start_waits_for_the_target_instant() {
    let (clock, port) = spawn_agent("sync-a").await;

    let coordinator = TransportCoordinator::bind().await.unwrap();
    coordinator.add_agent("127.0.0.1", Some(port), None);
    assert_eq!(coordinator.start_all(0.5).await, 1);

    // Well before the target: still stopped.
    sleep(Duration::from_millis(150)).await;
    let (state, _) = clock.query().unwrap();
    assert_eq!(state, TransportState::Stopped);

    // Well after the target: rolling.
    sleep(Duration::from_millis(600)).await;
    let (state, frame) = clock.query().unwrap();
    assert_eq!(state, TransportState::Rolling);
    assert!(frame > 0);
}

#[tokio::test]
async fn locate_and_start_lands_on_the_requested_frame() {
    let (clock, port) = spawn_agent("sync-b").await;

    let coordinator = TransportCoordinator::bind().await.unwrap();
    coordinator.add_agent("127.0.0.1", Some(port), None);
    assert_eq!(coordinator.locate_and_start_all(96_000, 0.2).await, 1);

    sleep(Duration::from_millis(500)).await;
    let (state, frame) = clock.query().unwrap();
    assert_eq!(state, TransportState::Rolling);
    assert!(frame >= 96_000);
    // ~0.3s rolling at 48kHz; nowhere near a second's worth of frames.
    assert!(frame < 96_000 + 48_000);
}

#[tokio::test]
async fn locate_without_start_stays_stopped() {
    let (clock, port) = spawn_agent("sync-c").await;

    let coordinator = TransportCoordinator::bind().await.unwrap();
    coordinator.add_agent("127.0.0.1", Some(port), None);
    assert_eq!(coordinator.locate_all(12_345).await, 1);

    sleep(Duration::from_millis(200)).await;
    let (state, frame) = clock.query().unwrap();
    assert_eq!(state, TransportState::Stopped);
    assert_eq!(frame, 12_345);
}

#[tokio::test]
async fn immediate_stop_carries_no_timestamp_argument() {
    // A raw socket standing in for an agent, to inspect the wire form.
    let fake_agent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = fake_agent.local_addr().unwrap().port();

    let coordinator = TransportCoordinator::bind().await.unwrap();
    coordinator.add_agent("127.0.0.1", Some(port), None);

    assert_eq!(coordinator.stop_all(0.0).await, 1);
    let mut buf = [0u8; 1024];
    let (len, _) = timeout(Duration::from_secs(2), fake_agent.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let message: Value = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(message["address"], "/transport/stop");
    assert_eq!(message["args"].as_array().unwrap().len(), 0);

    assert_eq!(coordinator.stop_all(0.5).await, 1);
    let (len, _) = timeout(Duration::from_secs(2), fake_agent.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let message: Value = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(message["address"], "/transport/stop");
    let args = message["args"].as_array().unwrap();
    assert_eq!(args.len(), 1);
    assert!(args[0].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn query_replies_are_attributed_by_node_identity() {
    let (clock, port) = spawn_agent("studio-node").await;
    clock.start().unwrap();

    let coordinator = TransportCoordinator::bind().await.unwrap();
    coordinator.add_agent("127.0.0.1", Some(port), None);
    assert_eq!(coordinator.query_all().await, 1);

    // Replies arrive asynchronously; poll the roster until the listener has
    // applied one.
    let mut attributed = None;
    for _ in 0..40 {
        sleep(Duration::from_millis(50)).await;
        let agents = coordinator.agents();
        if agents[0].last_state.is_some() {
            attributed = Some(agents[0].clone());
            break;
        }
    }

    let agent = attributed.expect("no state reply within the window");
    assert_eq!(agent.node_id.as_deref(), Some("studio-node"));
    assert!(agent.reachable);
    assert_eq!(agent.last_state.unwrap().state, TransportState::Rolling);
}

#[tokio::test]
async fn malformed_datagrams_do_not_kill_the_agent() {
    let (clock, port) = spawn_agent("sync-d").await;

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = format!("127.0.0.1:{}", port);
    sender.send_to(b"not json at all", &target).await.unwrap();
    sender
        .send_to(br#"{"address": "/transport/warp", "args": []}"#, &target)
        .await
        .unwrap();

    // A valid command after the garbage still executes.
    let coordinator = TransportCoordinator::bind().await.unwrap();
    coordinator.add_agent("127.0.0.1", Some(port), None);
    coordinator.start_all(0.05).await;

    sleep(Duration::from_millis(300)).await;
    let (state, _) = clock.query().unwrap();
    assert_eq!(state, TransportState::Rolling);
}
