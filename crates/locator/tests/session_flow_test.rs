// End-to-end flows over the in-memory transport with simulated ranging

use locator::{
    ConnectionState, CoordinatorOptions, MemoryTransport, OverlayFeed, SessionCoordinator,
    SessionSnapshot, SimulatedRanging,
};
use std::time::Duration;
use tokio::sync::broadcast;

const UPDATE_INTERVAL: Duration = Duration::from_millis(10);

fn coordinator(transport: MemoryTransport) -> SessionCoordinator {
    SessionCoordinator::new(
        Box::new(transport),
        Box::new(SimulatedRanging::with_settings(true, UPDATE_INTERVAL)),
        CoordinatorOptions::default(),
    )
}

async fn states_until_ranging(rx: &mut broadcast::Receiver<SessionSnapshot>) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    loop {
        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("device did not reach ranging in time")
            .expect("transition stream closed");
        let reached = snapshot.state == ConnectionState::Ranging;
        states.push(snapshot.state);
        if reached {
            return states;
        }
    }
}

#[tokio::test]
async fn test_two_devices_reach_ranging() {
    let (alpha_transport, beta_transport) = MemoryTransport::pair("alpha", "beta");
    let beta = coordinator(beta_transport);
    let alpha = coordinator(alpha_transport);

    let mut beta_rx = beta.transitions();
    let mut alpha_rx = alpha.transitions();

    beta.start().unwrap();
    alpha.start().unwrap();

    let expected = vec![
        ConnectionState::AdvertisingBrowsing,
        ConnectionState::Connecting,
        ConnectionState::TransportConnected,
        ConnectionState::TokenExchanged,
        ConnectionState::Ranging,
    ];
    assert_eq!(states_until_ranging(&mut alpha_rx).await, expected);
    assert_eq!(states_until_ranging(&mut beta_rx).await, expected);

    // Simulated samples start flowing once configured
    let mut alpha_watch = alpha.subscribe();
    let measured = tokio::time::timeout(
        Duration::from_secs(5),
        alpha_watch.wait_for(|s| s.distance().is_some() && s.direction().is_some()),
    )
    .await
    .expect("no measurement in time")
    .unwrap()
    .clone();

    let distance = measured.distance().unwrap();
    assert!((1.5..=2.5).contains(&distance));
    assert_eq!(measured.peer.unwrap().display_name(), "beta");

    // The fixed-rate feed yields a placement in front of the user
    let mut feed = OverlayFeed::new(alpha.subscribe());
    let frame = feed.next_frame().await;
    let placement = frame.placement.expect("placement while ranging");
    assert!(placement.position.z < 0.0);

    alpha.stop().unwrap();
    beta.stop().unwrap();
    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn test_peer_stopping_does_not_end_ranging() {
    let (alpha_transport, beta_transport) = MemoryTransport::pair("alpha", "beta");
    let beta = coordinator(beta_transport);
    let alpha = coordinator(alpha_transport);
    let mut alpha_rx = alpha.transitions();

    beta.start().unwrap();
    alpha.start().unwrap();
    states_until_ranging(&mut alpha_rx).await;

    // Only a ranging removal ends the session, not the transport link going away
    beta.stop().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alpha.snapshot().state, ConnectionState::Ranging);

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_invitation_returns_to_searching() {
    let (alpha_transport, beta_transport) = MemoryTransport::pair("alpha", "beta");
    beta_transport.set_accepts_invitations(false);

    let beta = coordinator(beta_transport);
    let alpha = coordinator(alpha_transport);
    let mut alpha_rx = alpha.transitions();

    beta.start().unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    alpha.start().unwrap();

    let mut states = Vec::new();
    for _ in 0..3 {
        states.push(alpha_rx.recv().await.unwrap());
    }

    assert_eq!(states[0].state, ConnectionState::AdvertisingBrowsing);
    assert_eq!(states[1].state, ConnectionState::Connecting);
    assert_eq!(states[2].state, ConnectionState::AdvertisingBrowsing);
    assert!(states[2].status.contains("Searching"));
    assert!(states[2].error_message.is_none());

    alpha.shutdown().await;
    beta.shutdown().await;
}
