mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use tidings_api::{AppStateInner, LogMailer};
use tidings_db::Database;
use tidings_gateway::{Broker, Stores, Supervisor};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tidings=debug,tower_http=debug".into()),
        )
        .init();
    install_panic_hook();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    let supervisor = Supervisor::new();
    let broker = Broker::new(
        Stores::from_database(db.clone()),
        supervisor.clone(),
        config.session.clone(),
    );
    let state = Arc::new(AppStateInner {
        db,
        broker,
        mailer: Arc::new(LogMailer),
    });

    let app = tidings_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("tidings listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor.clone()))
        .await?;

    // Upgraded sockets are not tracked by the HTTP server.
    supervisor.shutdown(config.shutdown_timeout).await?;
    info!("bye");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM and tells every session to go away.
async fn shutdown_signal(supervisor: Supervisor) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown requested, closing sessions");
    supervisor.shutdown_token().cancel();
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!(panic = %info, "panic\n{backtrace}");
    }));
}
