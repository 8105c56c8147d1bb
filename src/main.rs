use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use sidecar_proxy::admin::{setup_admin_router, AdminState};
use sidecar_proxy::config::{load_config, PolicyReloader, ProxyConfig};
use sidecar_proxy::keepalive::{keepalive_policy, refresh_keepalive_policy};
use sidecar_proxy::lifecycle::signals::forward_signals;
use sidecar_proxy::observability::{logging, metrics};
use sidecar_proxy::{PolicyStore, Shutdown, UpstreamPool};

const DEFAULT_CONFIG_PATH: &str = "sidecar.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
    );
    let config = if path.exists() {
        Some(load_config(&path)?)
    } else {
        None
    };
    let from_file = config.is_some();
    let config = config.unwrap_or_default();

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sidecar-proxy starting");
    if from_file {
        tracing::info!(path = ?path, upstreams = config.upstreams.len(), "Configuration loaded");
    } else {
        tracing::warn!(path = ?path, "Config file not found, using defaults");
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    refresh_keepalive_policy(config.keepalive.policy())?;
    let installed = keepalive_policy();
    tracing::info!(
        tick_count_if_fail = installed.tick_count_if_fail,
        tick_count_if_succ = installed.tick_count_if_succ,
        fail_count_to_close = installed.fail_count_to_close,
        fast_fail = installed.fast_fail,
        max_idle_count = installed.max_idle_count,
        "Keepalive policy installed"
    );
    let policy = PolicyStore::global();

    let shutdown = Arc::new(Shutdown::new());
    let pool = Arc::new(UpstreamPool::new(&config, policy.clone()));
    let supervisors = pool.start(&shutdown);

    // dropping the watcher stops reloads
    let _watcher = if from_file {
        match PolicyReloader::new(&path, policy, &config).watch() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::error!(error = %e, "Failed to start config watcher, hot reload disabled");
                None
            }
        }
    } else {
        None
    };

    let admin = if config.admin.enabled {
        Some(tokio::spawn(serve_admin(config.clone(), pool.clone(), shutdown.clone())))
    } else {
        None
    };

    forward_signals(&shutdown).await;

    tracing::info!(live_connections = pool.live_connections(), "Stopping keepalive engines");
    pool.stop_all();
    let drain = futures_util::future::join_all(supervisors);
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("Timed out waiting for slot supervisors");
    }
    if let Some(admin) = admin {
        let _ = admin.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn serve_admin(config: ProxyConfig, pool: Arc<UpstreamPool>, shutdown: Arc<Shutdown>) {
    let listener = match TcpListener::bind(&config.admin.bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %config.admin.bind_address, error = %e, "Failed to bind admin API");
            return;
        }
    };
    tracing::info!(address = %config.admin.bind_address, "Admin API listening");

    let router = setup_admin_router(AdminState::new(pool, &config.admin.api_key));
    let mut stop = shutdown.subscribe();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { stop.wait().await })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "Admin API failed");
    }
}
