#[cfg(not(any(
    target_env = "musl",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "windows",
    feature = "mimalloc"
)))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::error::Error;
use std::net::SocketAddr;

use lpio::logging::{self, LogConfig};
use lpio::{Hub, HubConfig};
use tokio::signal;
use tracing::{error, info};

const DEFAULT_ADDR: &str = "0.0.0.0:3000";

fn load_config() -> Result<HubConfig, Box<dyn Error>> {
    match std::env::var("LPIO_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            let config = HubConfig::from_json(&raw)?;
            info!(path = %path, "loaded configuration");
            Ok(config)
        }
        Err(_) => Ok(HubConfig::default()),
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to register ctrl-c handler: {}", e);
        }
    };

    #[cfg(unix)]
    let term = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("Failed to register SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = term => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logging::init(&LogConfig::from_env());

    let config = load_config()?;
    let addr: SocketAddr = std::env::var("LPIO_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()?;

    let hub = Hub::new(config);
    let app = lpio::http::router(hub.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "lpio listening");

    let shutdown_hub = hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutting down");
        // Ends every pending long-poll so in-flight requests can complete
        shutdown_hub.destroy();
    })
    .await?;

    info!("{}", hub.metrics().snapshot().to_string_pretty());
    Ok(())
}
