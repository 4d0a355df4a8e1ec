//! hypercards-grpc: whiteboard and screen-sharing gRPC service
//!
//! ## Architecture
//! ```text
//! [Client] --SendEvent--> [hypercards-grpc] --publish--> [Broker: hc.wb.1.evt.{room}.{user}.{kind}]
//!    ^                          |                               |
//!    |                          | RecvEvents (room pattern)     |
//!    +-------- stream ----------+<------------------------------+
//! ```
//!
//! ## Configuration
//! - `hypercards.yaml` / `config.yaml`, or the file named by HYPERCARDS_CONFIG
//! - HYPERCARDS__SECTION__KEY environment overrides
//! - Legacy flat variables: PORT, NATS_HOST, RABBITMQ_HOST, REDIS_HOST, ...
//! - HYPERCARDS_LOG: tracing filter (default: info)

use std::net::SocketAddr;

use tokio::sync::watch;
use tonic::transport::Server;
use tonic_health::server::health_reporter;
use tracing::{error, info, warn};

use hypercards::bus::init_broker;
use hypercards::cache::init_cache;
use hypercards::config::Config;
use hypercards::handlers::{ScreenSharingService, WhiteboardService};
use hypercards::proto::screen_sharing_server::ScreenSharingServer;
use hypercards::proto::whiteboard_server::WhiteboardServer;
use hypercards::routing;
use hypercards::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting hypercards-grpc service");

    let config = Config::load(None).and_then(|c| c.validate().map(|_| c)).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    // A codec that cannot round-trip its own keys would misroute every event
    routing::verify_samples().map_err(|e| {
        error!(error = %e, "Routing key self-test failed");
        e
    })?;

    let broker = init_broker(&config.broker).await.map_err(|e| {
        error!(error = %e, "Failed to initialize broker");
        e
    })?;
    let cache = init_cache(&config.cache).await.map_err(|e| {
        error!(error = %e, "Failed to initialize screen cache");
        e
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let whiteboard = WhiteboardService::new(broker.clone(), &config.server, shutdown_rx);
    let screen_sharing = ScreenSharingService::new(cache, &config.server, &config.cache);

    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<WhiteboardServer<WhiteboardService>>()
        .await;
    health_reporter
        .set_serving::<ScreenSharingServer<ScreenSharingService>>()
        .await;

    let addr: SocketAddr = config.server.bind_address().parse()?;
    info!(
        address = %addr,
        broker = ?config.broker.broker_type,
        cache = ?config.cache.cache_type,
        status_events = ?config.server.status_events,
        "hypercards-grpc listening"
    );

    Server::builder()
        .add_service(health_service)
        .add_service(WhiteboardServer::new(whiteboard))
        .add_service(ScreenSharingServer::new(screen_sharing))
        .serve_with_shutdown(addr, async {
            shutdown_signal().await;
            // Every live relay leaves its room before the broker goes away
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Err(e) = broker.close().await {
        warn!(error = %e, "Broker close failed");
    }
    info!("hypercards-grpc stopped");
    Ok(())
}
