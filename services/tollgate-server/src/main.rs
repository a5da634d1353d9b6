//! Tollgate Identity Provider
//!
//! Serves the authenticator RPC surface (`POST /authenticator.v1/<Method>`)
//! over HTTP for a fleet of services.
//!
//! # Features
//!
//! - Password users with Argon2id credentials
//! - EdDSA tokens with rotating signing keys
//! - PostgreSQL master/replica routing or an in-memory store
//! - Bootstrap users from configuration
//! - Graceful shutdown handling
//!
//! # Usage
//!
//! ```bash
//! # Start with default settings
//! tollgate-server
//!
//! # Start with custom config
//! tollgate-server --config /path/to/config.toml
//!
//! # Start with environment overrides
//! TOLLGATE__SERVER__PORT=9000 tollgate-server
//! ```

mod config;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::rngs::OsRng;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tollgate_auth::{AuthService, CallContext, SigningKeyManager};
use tollgate_db::config::mask_url;
use tollgate_db::{MemoryDb, MultiDb, PgMultiDb};

use crate::config::{Backend, DatabaseSettings, LoggingConfig, ServerConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tollgate - network identity provider
#[derive(Parser, Debug)]
#[command(name = "tollgate-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<String>,

    /// Host to bind to
    #[arg(long, env = "TOLLGATE_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "TOLLGATE_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TOLLGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, env = "TOLLGATE_LOG_FORMAT")]
    log_format: Option<String>,

    /// PostgreSQL connection URL of the master node
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Token issuer
    #[arg(long, env = "TOLLGATE_ISSUER")]
    issuer: Option<String>,
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut server_config = ServerConfig::load(args.config.as_deref())?;
    apply_overrides(&mut server_config, args);

    init_logging(&server_config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Tollgate identity provider"
    );

    if let Err(errors) = server_config.auth.validate() {
        anyhow::bail!("Invalid auth configuration: {}", errors.join("; "));
    }

    let request_timeout = server_config.server.request_timeout();
    let db = init_database(&server_config.database).await?;

    // Tokens can only be issued once a key is active
    let keys = Arc::new(SigningKeyManager::new(db.clone()));
    let kid = keys
        .initialize(&CallContext::with_timeout(request_timeout), &mut OsRng)
        .await?;
    tracing::info!(kid, "Signing key ready");

    let service = Arc::new(AuthService::new(db, keys.clone(), &server_config.auth)?);
    service
        .bootstrap_users(
            &CallContext::with_timeout(request_timeout),
            &server_config.auth.bootstrap,
        )
        .await?;

    let shutdown = CancellationToken::new();
    if let Some(interval) = server_config.keys.rotation_interval {
        tokio::spawn(rotate_keys(
            keys,
            interval,
            request_timeout,
            shutdown.clone(),
        ));
    }

    let app = tollgate_auth::router(service, request_timeout).layer(TraceLayer::new_for_http());

    let addr = server_config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Server listening");

    tokio::spawn(shutdown_signal(shutdown.clone()));
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    });

    let grace = server_config.server.shutdown_timeout();
    tokio::select! {
        result = server.into_future() => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(grace_secs = grace.as_secs(), "In-flight calls abandoned after grace period");
        }
    }

    tracing::info!("Server shutdown complete");

    Ok(())
}

fn apply_overrides(config: &mut ServerConfig, args: Args) {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = args.database_url {
        config.database.master_url = url;
    }
    if let Some(issuer) = args.issuer {
        config.auth.jwt.issuer = issuer;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
}

// =============================================================================
// Initialization Functions
// =============================================================================

/// Initialize tracing/logging
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format.as_str() {
        "json" => subscriber
            .with(fmt::layer().json().with_target(true))
            .try_init()?,
        _ => subscriber
            .with(fmt::layer().pretty().with_target(true))
            .try_init()?,
    }

    Ok(())
}

/// Open the configured storage backend
async fn init_database(settings: &DatabaseSettings) -> anyhow::Result<Arc<dyn MultiDb>> {
    match settings.backend {
        Backend::Memory => {
            tracing::warn!("Using the in-memory store; all data is lost on exit");
            Ok(Arc::new(MemoryDb::new()))
        }
        Backend::Postgres => {
            tracing::info!(
                master = %mask_url(&settings.master_url),
                replicas = settings.replica_urls.len(),
                "Connecting to database..."
            );
            let db = PgMultiDb::connect(&settings.pool_config()).await?;

            if settings.run_migrations {
                db.migrate().await?;
                tracing::info!("Database migrations applied");
            }

            db.health_check().await?;
            tracing::info!("Database health check passed");

            Ok(Arc::new(db))
        }
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

/// Rotate the signing key every `interval` until shutdown
async fn rotate_keys(
    keys: Arc<SigningKeyManager>,
    interval: Duration,
    call_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let ctx = CallContext::with_timeout(call_timeout);
                if let Err(e) = keys.rotate(&ctx, &mut OsRng).await {
                    // The previous key stays active
                    tracing::error!(error = %e, "Scheduled key rotation failed");
                }
            }
        }
    }
    tracing::debug!("Key rotation stopped");
}

// =============================================================================
// Graceful Shutdown
// =============================================================================

/// Wait for Ctrl+C or SIGTERM, then cancel `shutdown`
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    shutdown.cancel();
}

// =============================================================================
// Tests
// =============================================================================
