pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod manager;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod upstream;

use std::sync::Arc;

use axum::Router;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use config::watcher::ConfigChangeEvent;
use manager::UpstreamManager;
use scheduler::{Scheduler, SchedulerConfig};
use server::ProxyEngine;
use store::kv::KvStore;
use store::Persistence;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcpproxy=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("starting mcpproxy");

    let config_path = config::resolve_config_path();
    let proxy_config = config::load_from(&config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, path = %config_path.display(), "failed to load config, starting with an empty one");
        config::ProxyConfig::default()
    });

    let data_dir = std::path::PathBuf::from(&proxy_config.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let kv = KvStore::open(&data_dir.join("state.db"))?;

    let bus = events::EventBus::new();
    let persistence = Persistence::new(kv, proxy_config.clone(), config_path.clone(), bus);
    persistence.reconcile_kv(&proxy_config)?;

    let scheduler = Scheduler::new(SchedulerConfig::with_workers(proxy_config.max_concurrent_connections));
    let manager = UpstreamManager::new(
        persistence.clone(),
        scheduler.clone(),
        proxy_config.auto_disable_threshold,
        proxy_config.persist_auto_disable_to_config,
    );

    // `reconcile` against an empty baseline marks every configured server as
    // "added", which spawns the initial bring-up wave on its own (§4.1 "Key
    // algorithms"); no separate startup call into the scheduler is needed.
    manager.reconcile(&proxy_config).await?;

    // Feed per-server state churn through the debounced refresh collaborator
    // contract (§4.4) so a reconciliation storm collapses into one log line
    // instead of one per server. Held for the process's lifetime.
    let (refresh_tx, refresh_rx) = tokio::sync::mpsc::channel(64);
    let mut refreshes = events::debounce::spawn_debouncer(refresh_rx);
    let _refresh_subscription = persistence.event_bus().subscribe(
        None,
        Box::new(move |event| {
            if let Some(name) = event.server_name() {
                let _ = refresh_tx.try_send(name.to_string());
            }
        }),
    );
    tokio::spawn(async move {
        while let Some(refresh) = refreshes.recv().await {
            match refresh {
                events::debounce::Refresh::Servers(names) => {
                    tracing::debug!(?names, "debounced server refresh")
                }
                events::debounce::Refresh::FullResync => {
                    tracing::debug!("debounced refresh promoted to full resync")
                }
            }
        }
    });

    let listen_addr = proxy_config.listen_addr.clone();

    let (watch_tx, mut watch_rx) = tokio::sync::mpsc::channel::<ConfigChangeEvent>(8);
    let _watcher = config::watcher::start_watcher(&config_path, watch_tx)?;

    {
        let manager = manager.clone();
        let config_path = config_path.clone();
        tokio::spawn(async move {
            while watch_rx.recv().await.is_some() {
                match config::load_from(&config_path) {
                    Ok(new_config) => {
                        if let Err(e) = manager.reconcile(&new_config).await {
                            tracing::warn!(error = %e, "rejected reloaded config");
                        } else {
                            tracing::info!("applied reloaded config");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to parse reloaded config, keeping previous");
                    }
                }
            }
        });
    }

    let session_manager = LocalSessionManager::default();
    let mcp_manager = manager.clone();
    let mcp_service = StreamableHttpService::new(
        move || Ok(ProxyEngine::new(mcp_manager.clone())),
        session_manager.into(),
        Default::default(),
    );

    let app = Router::new()
        .nest_service("/mcp", mcp_service)
        .merge(control::router(manager));

    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "mcpproxy listening");
    axum::serve(listener, app).await?;

    scheduler.stop();
    Ok(())
}
