//! Courier Server - Main entry point.
//!
//! This binary starts the Courier chat server with:
//! - Structured JSON logging
//! - Signing keys loaded from the configured secret store
//! - The ingress worker pool and the egress broker consumer
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`courier_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! COURIER_SECRETS_DIR=/run/secrets \
//! COURIER_JWT_PRIVATE_KEY_SECRET=jwt-private \
//! COURIER_JWT_PUBLIC_KEY_SECRET=jwt-public \
//! COURIER_SEED_PATH=seed.json \
//! PORT=8080 \
//! cargo run --release --bin courier-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use courier_server::broker::{InMemoryBroker, CHAT_QUEUE};
use courier_server::config::Config;
use courier_server::dispatch::EgressConsumer;
use courier_server::pool::WorkerPool;
use courier_server::routes::{create_router, AppState};
use courier_server::secrets::provider_from_source;
use courier_server::store::{SeedData, Stores};
use courier_server::token::TokenService;
use courier_server::totp::TotpService;

/// How long the egress consumer may take to stop after shutdown.
const EGRESS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  COURIER_JWT_PRIVATE_KEY_SECRET - Secret name of the PEM signing key");
            eprintln!("  COURIER_JWT_PUBLIC_KEY_SECRET  - Secret name of the PEM verification key");
            eprintln!("  COURIER_SECRETS_DIR            - Directory holding secrets, or");
            eprintln!("  COURIER_SECRETS_URL            - Base URL of the secrets service");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                   - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG               - Log level filter (default: info)");
            eprintln!("  COURIER_SECRETS_TOKEN  - Bearer token for the secrets service");
            eprintln!("  COURIER_TOKEN_TTL_SECS - Session token lifetime (default: 3600, max: 31536000)");
            eprintln!("  COURIER_TOTP_ISSUER    - Issuer shown in authenticator apps");
            eprintln!("  COURIER_WORKERS_CORE   - Core ingress workers (default: 10)");
            eprintln!("  COURIER_WORKERS_MAX    - Maximum ingress workers (default: 50)");
            eprintln!("  COURIER_WORKER_QUEUE   - Ingress queue capacity (default: 100)");
            eprintln!("  COURIER_SEED_PATH      - JSON file of initial users and conversations");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        token_ttl_secs = config.token_ttl.as_secs(),
        workers_core = config.workers_core,
        workers_max = config.workers_max,
        "Courier server starting"
    );

    let tokens = match load_tokens(&config).await {
        Ok(tokens) => tokens,
        Err(err) => {
            error!(error = %err, "Failed to load token signing keys");
            return ExitCode::from(1);
        }
    };

    let stores = Stores::in_memory();
    if let Some(path) = &config.seed_path {
        let seeded = match SeedData::load(path).await {
            Ok(seed) => seed.apply(&stores, bcrypt::DEFAULT_COST).await,
            Err(err) => Err(err),
        };
        if let Err(err) = seeded {
            error!(error = %err, path = %path.display(), "Failed to apply seed data");
            return ExitCode::from(1);
        }
    }

    let broker = match InMemoryBroker::with_chat_topology() {
        Ok(broker) => Arc::new(broker),
        Err(err) => {
            error!(error = %err, "Failed to declare broker topology");
            return ExitCode::from(1);
        }
    };

    let pool = WorkerPool::new((&config).into());
    let state = AppState::new(
        &stores,
        tokens,
        broker.clone(),
        pool,
        TotpService::new(config.totp_issuer.clone()),
    );

    let consumer = match broker.consume(CHAT_QUEUE) {
        Ok(consumer) => consumer,
        Err(err) => {
            error!(error = %err, queue = CHAT_QUEUE, "Failed to attach egress consumer");
            return ExitCode::from(1);
        }
    };
    let egress = EgressConsumer::new(consumer, state.messages.clone(), state.broadcaster.clone()).spawn();

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port = config.port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutting down gracefully");

    // Unsettled deliveries stay queued; closing stops the consumer loop.
    broker.close();
    if tokio::time::timeout(EGRESS_DRAIN_TIMEOUT, egress).await.is_err() {
        warn!(
            timeout_secs = EGRESS_DRAIN_TIMEOUT.as_secs(),
            "Egress consumer did not stop in time"
        );
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

async fn load_tokens(config: &Config) -> courier_server::error::Result<TokenService> {
    let provider = provider_from_source(&config.secret_source)
        .map_err(|e| courier_server::error::ServerError::secret_access(e.to_string()))?;
    TokenService::from_secrets(
        provider.as_ref(),
        &config.jwt_private_key_secret,
        &config.jwt_public_key_secret,
        config.token_ttl,
    )
    .await
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT or SIGTERM.
///
/// If a handler cannot be installed the failure is logged and that signal
/// is ignored; the other one still triggers shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
