//! NATS room broker integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_nats --features nats -- --ignored --nocapture
//!
//! These tests spin up NATS with its monitoring endpoint enabled.

use std::sync::Arc;
use std::time::Duration;

use hypercards::auth::{prepare, PrepareOptions, DEFAULT_CALL_DEADLINE, USER_ID_HEADER};
use hypercards::bus::{publish_event, Broker, BrokerSession, NatsBroker};
use hypercards::config::NatsConfig;
use hypercards::event::{Event, Payload};
use hypercards::handlers::{Relay, RelayState};
use hypercards::routing::{EventKind, RoutingKey};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tonic::metadata::MetadataMap;

/// Start NATS container with monitoring on 8222.
async fn start_nats() -> (testcontainers::ContainerAsync<GenericImage>, NatsConfig) {
    let image = GenericImage::new("nats", "2.10")
        .with_exposed_port(4222.tcp())
        .with_exposed_port(8222.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "Listening for client connections",
        ))
        .with_cmd(vec!["-m", "8222"]);

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start NATS container");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");
    let port = container
        .get_host_port_ipv4(4222)
        .await
        .expect("Failed to get mapped port");
    let monitor_port = container
        .get_host_port_ipv4(8222)
        .await
        .expect("Failed to get mapped monitor port");

    let config = NatsConfig {
        host: host.to_string(),
        port,
        monitor_url: format!("http://{}:{}", host, monitor_port),
        ..Default::default()
    };
    println!("NATS available at: {}", config.server_address());

    (container, config)
}

fn room(prefix: &str) -> String {
    format!("{}{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_subject_wildcards_per_room() {
    let (_container, config) = start_nats().await;
    let broker = NatsBroker::connect(&config).await.expect("Failed to connect");
    let room_id = room("r");

    let mut session = broker.session().await.unwrap();
    let mut subscription = session
        .subscribe(&RoutingKey::room_pattern(&room_id), "alice")
        .await
        .unwrap();

    publish_event(
        session.as_mut(),
        &Event::now("bob", "other", Payload::UserJoinedRoom),
    )
    .await
    .unwrap();
    publish_event(
        session.as_mut(),
        &Event::now("bob", &room_id, Payload::UserJoinedRoom),
    )
    .await
    .unwrap();

    let delivery = timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("No delivery")
        .expect("Subscription ended");
    assert_eq!(
        delivery.topic,
        RoutingKey::event(&room_id, "bob", EventKind::UserJoinedRoom).encode()
    );

    subscription.cancel();
    session.close().await;
    broker.close().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_membership_counts_room_subscriptions() {
    let (_container, config) = start_nats().await;
    let broker = NatsBroker::connect(&config).await.expect("Failed to connect");
    let room_id = room("m");
    let pattern = RoutingKey::room_pattern(&room_id);

    assert_eq!(broker.subscriber_count(&pattern).await.unwrap(), Some(0));

    let mut session = broker.session().await.unwrap();
    let _alice = session.subscribe(&pattern, "alice").await.unwrap();
    let _bob = session.subscribe(&pattern, "bob").await.unwrap();
    let _elsewhere = session
        .subscribe(&RoutingKey::room_pattern("elsewhere"), "carol")
        .await
        .unwrap();

    // Subscriptions reach the server asynchronously
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(broker.subscriber_count(&pattern).await.unwrap(), Some(2));
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_relay_over_nats() {
    let (_container, config) = start_nats().await;
    let broker: Arc<dyn Broker> =
        Arc::new(NatsBroker::connect(&config).await.expect("Failed to connect"));
    let room_id = room("e");

    let mut metadata = MetadataMap::new();
    metadata.insert(USER_ID_HEADER, "alice".parse().unwrap());
    let scope = prepare(&metadata, PrepareOptions::streaming(), DEFAULT_CALL_DEADLINE).unwrap();

    let relay = Relay::open(broker.clone(), &scope, &room_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (tx, mut rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(relay.run(tx, shutdown_rx));

    let count = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(count.event_users_in_the_room, Some(1));

    let mut bob = broker.session().await.unwrap();
    publish_event(
        bob.as_mut(),
        &Event::now("bob", &room_id, Payload::UserJoinedRoom),
    )
    .await
    .unwrap();

    let joined = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(joined.event_user_joined_the_room);
    assert_eq!(joined.by_user_id, "bob");

    shutdown_tx.send(true).unwrap();
    let report = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(report.state, RelayState::Closed);
}
