use std::fmt::Display;

use soilrepo_gateway::config::GatewayConfig;
use soilrepo_gateway::http::{AppState, routes};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GatewayConfig::load().unwrap_or_else(|err| exit_startup(err));
    let state = AppState::build(config.clone())
        .await
        .unwrap_or_else(|err| exit_startup(err));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .unwrap_or_else(|err| {
            exit_startup(format_args!(
                "ERR_BIND_FAILED cannot bind data api to {}: {}",
                config.bind_addr, err
            ))
        });

    tracing::info!(
        bind_addr = %config.bind_addr,
        api_prefix = %config.api_prefix,
        samples_db = %config.sqlite_path.display(),
        lab_db = %config.lab_db_path.display(),
        canonical = state.has_canonical(),
        max_upload_bytes = config.max_upload_bytes,
        metrics_require_auth = config.metrics_require_auth,
        "soil data api listening"
    );

    let served = axum::serve(listener, routes(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    state.close().await;
    tracing::info!("storage pools closed");

    if let Err(err) = served {
        eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
        std::process::exit(1);
    }
}

fn exit_startup(err: impl Display) -> ! {
    eprintln!("STARTUP_ERROR {}", err);
    std::process::exit(1);
}

/// Ctrl-C everywhere, plus SIGTERM from container runtimes on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(signal = "ctrl_c", "shutdown requested"),
        _ = terminate => tracing::info!(signal = "terminate", "shutdown requested"),
    }
}
