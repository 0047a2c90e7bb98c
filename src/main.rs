use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};

use doniai_presence::config::PresenceConfig;
use doniai_presence::handlers;
use doniai_presence::healthcheck;
use doniai_presence::presence::PresencePipeline;
use doniai_presence::security::SecurityConfig;
use doniai_presence::state::AppState;
use doniai_presence::store::connect_store;

#[tokio::main]
async fn main() {
    let config = PresenceConfig::from_env();

    // Healthcheck mode: exit 0 if server is running (port in use), exit 1 if not
    if std::env::args().any(|a| a == "--healthcheck") {
        let port = config.socket_addr().map(|a| a.port()).unwrap_or(8080);
        std::process::exit(healthcheck::exit_code(port));
    }

    env_logger::init();

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(2);
    }
    let addr: SocketAddr = config.socket_addr().expect("validated above");

    let store = connect_store(&config).await;
    let store_backend = store.backend_name();
    let pipeline = PresencePipeline::spawn(&config, store);
    info!(
        "Presence pipeline started (batch {} / {:?}, sweep every {:?}, window {:?})",
        config.batch_size, config.flush_interval, config.sweep_interval, config.liveness_window
    );

    let state = Arc::new(AppState::new(&pipeline, store_backend));
    let security = SecurityConfig::from_env();
    let app = handlers::router(state, &security);

    let listener = tokio::net::TcpListener::bind(&addr).await.expect("bind");
    info!("Presence service listening on http://{}", addr);
    info!("Online count: http://{}/api/online/count", addr);
    info!("Health check: http://{}/health", addr);

    let graceful = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown requested; draining presence pipeline");
        });

    if let Err(e) = graceful.await {
        error!("Server error: {}", e);
    }

    let totals = pipeline.shutdown().await;
    info!(
        "Presence pipeline drained: {} flushes, {} persisted, {} failed",
        totals.flushes, totals.persisted, totals.failed
    );
}
