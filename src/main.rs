//! GastroLog control-plane node.
//!
//! Assembles the configured store backend, the optional Raft cluster, the
//! auth gate, and the gRPC listener. All knobs come from environment
//! variables — see [`gastrolog::node::NodeOptions`].

use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gastrolog::auth::{AuthGate, AuthLayer, StoreDirectory, TokenService};
use gastrolog::bootstrap::bootstrap;
use gastrolog::error::Error;
use gastrolog::fsm::Fsm;
use gastrolog::node::{BackendKind, NodeOptions};
use gastrolog::raft::{node_id_from_str, start_raft_node, RaftHandle};
use gastrolog::rpc::proto::auth_service_server::AuthServiceServer;
use gastrolog::rpc::proto::cluster_service_server::ClusterServiceServer;
use gastrolog::rpc::proto::config_service_server::ConfigServiceServer;
use gastrolog::rpc::{AuthRpc, ClusterRpc, ConfigRpc};
use gastrolog::store::{
    FileStore, GrpcForwarder, MemoryStore, RaftStore, SqliteStore, Store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let opts = NodeOptions::from_env()?;
    info!(?opts, "starting gastrolog control plane");

    let (store, raft): (Arc<dyn Store>, Option<Arc<RaftHandle>>) = match opts.backend {
        BackendKind::Memory => (Arc::new(MemoryStore::new()), None),
        BackendKind::File => (
            Arc::new(FileStore::open(opts.config_file_path()).await?),
            None,
        ),
        BackendKind::Sqlite => (Arc::new(SqliteStore::open(&opts.data_dir)?), None),
        BackendKind::Raft => {
            let fsm = Arc::new(Fsm::new());

            let peers: Vec<(u64, String)> = opts
                .cluster_nodes
                .iter()
                .map(|addr| (node_id_from_str(addr), addr.clone()))
                .collect();
            let this_id = opts
                .self_addr
                .as_deref()
                .map(node_id_from_str)
                .unwrap_or_else(|| node_id_from_str(&opts.node_id));

            let handle = start_raft_node(fsm, this_id, peers).await?;
            let forwarder = Arc::new(GrpcForwarder::new(handle.clone()));
            let store = RaftStore::new(handle.clone()).with_forwarder(forwarder);
            (Arc::new(store), Some(handle))
        }
    };

    run_bootstrap(store.as_ref(), raft.as_deref(), &opts).await?;

    // The gate's token service is built from the stored settings; before
    // bootstrap has replicated them (a fresh raft follower), an empty
    // secret means every verification fails, which is the fail-closed
    // behavior we want.
    let tokens = match store.load_server_settings().await? {
        Some(settings) => TokenService::from_settings(&settings)?,
        None => {
            warn!("server settings not loaded yet; auth gate will reject all tokens");
            TokenService::new(&[])
        }
    };
    let gate = Arc::new(AuthGate::new(
        tokens,
        Arc::new(StoreDirectory(store.clone())),
    ));

    let addr = opts
        .bind_addr
        .parse()
        .map_err(|e| Error::InvalidArgument(format!("bad GASTROLOG_BIND_ADDR: {e}")))?;
    info!(%addr, "gRPC listener starting");

    Server::builder()
        .layer(AuthLayer::new(gate))
        .add_service(ClusterServiceServer::new(ClusterRpc::new(raft.clone())))
        .add_service(ConfigServiceServer::new(ConfigRpc::new(store.clone())))
        .add_service(AuthServiceServer::new(AuthRpc::new(store)))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    if let Some(handle) = raft {
        handle.shutdown().await;
    }
    Ok(())
}

/// Seed a fresh store. In raft mode only the elected leader seeds, after
/// waiting for the cluster to form; followers replicate the result.
async fn run_bootstrap(
    store: &dyn Store,
    raft: Option<&RaftHandle>,
    opts: &NodeOptions,
) -> anyhow::Result<()> {
    if let Some(handle) = raft {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while handle.raft.metrics().borrow().current_leader.is_none() {
            if tokio::time::Instant::now() >= deadline {
                warn!("no raft leader after 30s; skipping bootstrap for now");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if !handle.is_leader() {
            return Ok(());
        }
    }

    if bootstrap(store, opts.bootstrap).await? {
        info!(mode = ?opts.bootstrap, "seeded fresh configuration store");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("GASTROLOG_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
