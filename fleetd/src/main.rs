//! fleetd - the orchestrator node binary.
//!
//! Wires the RPC server, executor, history store and monitor loop
//! together. Collaborators (KV store, registry, credentials, metric sink)
//! default to the in-process implementations; a clustered deployment
//! swaps them behind the fleet-core traits.

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_core::credentials::{CredentialProvider, MemoryCredentials};
use fleet_core::kv::{KvStore, MemoryKvStore};
use fleet_core::metrics::{MemorySink, MetricSink};
use fleet_core::registry::{MemoryRegistry, ServiceRegistry};
use fleet_core::server::{MemoryCatalog, ServerCatalog};
use fleet_core::{node_id, NodeConfig, Scheduler};
use fleet_exec::executor::{BatchExecutor, Executor};
use fleet_exec::history::HistoryStore;
use fleet_monitor::{MonitorManager, ORCHESTRATOR_SERVICE};
use fleet_rpc::auth::{AuthGate, AuthHandler, HeartbeatHandler, TokenTable};
use fleet_rpc::dispatcher::Dispatcher;
use fleet_rpc::manager::{RpcServer, ServerOptions};
use fleet_rpc::message::{msg_type, service};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = NodeConfig::from_env();
    let node = node_id();
    info!("fleetd starting as {node}");
    info!("  listen: {}", config.listen_addr);
    info!("  auth: {}", config.enable_auth);
    info!("  history: {}", config.history_path);

    // In-process collaborators; clustered deployments implement the
    // fleet-core traits against their real backends.
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let registry = Arc::new(MemoryRegistry::new());
    registry.register(&node, &config.listen_addr);
    let registry: Arc<dyn ServiceRegistry> = registry;
    let sink: Arc<dyn MetricSink> = Arc::new(MemorySink::new());
    let catalog: Arc<dyn ServerCatalog> = Arc::new(MemoryCatalog::new());

    let credentials = Arc::new(MemoryCredentials::new());
    if let (Ok(client_id), Ok(client_secret)) =
        (std::env::var("FLEET_CLIENT_ID"), std::env::var("FLEET_CLIENT_SECRET"))
    {
        credentials.insert_client(&client_id, &client_secret);
    } else if config.enable_auth {
        warn!("auth enabled but FLEET_CLIENT_ID/FLEET_CLIENT_SECRET unset; no client can log in");
    }
    let credentials: Arc<dyn CredentialProvider> = credentials;

    let history = Arc::new(HistoryStore::open(&config.history_path)?);
    let executor = Executor::new(credentials.clone(), Some(history.clone()));

    // RPC surface: heartbeat always, auth gate + login when enabled.
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register(service::SYSTEM, msg_type::HEARTBEAT, Arc::new(HeartbeatHandler));
    let tokens = Arc::new(TokenTable::new());
    if config.enable_auth {
        dispatcher.add_base_handler(Arc::new(AuthGate::new(tokens.clone())));
        dispatcher.register(
            service::SYSTEM,
            msg_type::AUTH,
            Arc::new(AuthHandler::new(tokens.clone(), credentials.clone())),
        );
    }

    let server = RpcServer::new(
        ServerOptions {
            listen_addr: config.listen_addr.clone(),
            max_connections: config.max_connections,
            heartbeat_interval: config.heartbeat_interval(),
            ..ServerOptions::default()
        },
        dispatcher,
    );
    let hook_tokens = tokens.clone();
    server.on_connection_closed(Arc::new(move |conn_id| hook_tokens.remove(conn_id)));
    server.start().await?;

    // Control loops: monitor probes and history cleanup.
    let monitor = MonitorManager::new(
        kv,
        registry,
        sink,
        catalog,
        executor.clone() as Arc<dyn BatchExecutor>,
        node.clone(),
    );
    info!("monitor node registered as {ORCHESTRATOR_SERVICE}/{node}");

    let scheduler = Scheduler::new();
    let probe_monitor = monitor.clone();
    scheduler.schedule("monitor-probe", config.monitor_interval(), move || {
        let monitor = probe_monitor.clone();
        async move {
            monitor.probe_tick().await;
            Ok(())
        }
    });
    let cleanup_history = history.clone();
    let history_ttl = config.history_ttl();
    scheduler.schedule(
        "history-cleanup",
        std::time::Duration::from_secs(3600),
        move || {
            let history = cleanup_history.clone();
            async move {
                match history.cleanup_expired(history_ttl).await {
                    Ok(removed) if removed > 0 => info!("history cleanup removed {removed} rows"),
                    Ok(_) => {}
                    Err(e) => error!("history cleanup: {e}"),
                }
                Ok(())
            }
        },
    );

    info!("fleetd ready");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    scheduler.shutdown().await;
    server.shutdown().await;
    history.close().await;
    Ok(())
}
