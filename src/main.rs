//! # Voice Shopper Transport - Reference Server
//!
//! Runs the voice session transport as a standalone server:
//!
//! ## Endpoints:
//! - `GET /ws` - WebSocket upgrade for the voice transport
//! - `POST /api/v1/sessions` - create a session
//! - `GET /api/v1/sessions/{id}` - inspect a session
//! - `POST /api/v1/sessions/{id}/end` - end a session
//! - `GET /health`, `GET /api/v1/health` - health check
//! - `GET /metrics`, `GET /api/v1/metrics` - transport metrics
//!
//! Sessions are kept in the in-memory store and audio flows through the
//! pipeline backend named in the configuration.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_shopper_transport::config::AppConfig;
use voice_shopper_transport::pipeline::{build_backend, InferencePipeline};
use voice_shopper_transport::session::{InMemorySessionStore, LifecycleManager};
use voice_shopper_transport::state::AppState;
use voice_shopper_transport::{handlers, health, websocket};

/// Set once a shutdown signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-shopper-transport v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        pipeline = %config.pipeline.backend,
        "configuration loaded"
    );

    let app_state = AppState::new(config.clone());
    let lifecycle = web::Data::new(LifecycleManager::new(Arc::new(InMemorySessionStore::new())));
    let pipeline: Arc<dyn InferencePipeline> = build_backend(&config.pipeline.backend)?;
    let pipeline_data: web::Data<dyn InferencePipeline> = web::Data::from(pipeline);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(lifecycle.clone())
            .app_data(pipeline_data.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/ws", web::get().to(websocket::voice_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::transport_metrics))
                    .route("/sessions", web::post().to(handlers::create_session))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}/end", web::post().to(handlers::end_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::transport_metrics))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_shopper_transport=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Listen for SIGTERM/SIGINT and flip the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
