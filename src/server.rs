//! Server bootstrap: binds the listener, loads an optional on-disk
//! snapshot, wires up the primary or follower coordinator for the
//! configured role, then accepts connections forever, spawning one task
//! per socket.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::{Role, ServerConfig};
use crate::connection;
use crate::context::ServerContext;
use crate::errors::ServerResult;
use crate::replication::follower;
use crate::replication::offset::OffsetMeter;
use crate::replication::primary::PrimaryCoordinator;
use crate::snapshot;
use crate::store::Store;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let store = Arc::new(Store::new());
    let offset = Arc::new(OffsetMeter::new());

    if let Some(path) = config.snapshot_path() {
        snapshot::load_snapshot_file(&store, &path)?;
    }

    let mut ctx = ServerContext::new(config.clone(), store.clone(), offset.clone());

    match &config.role {
        Role::Primary => {
            let (coordinator, tx) = PrimaryCoordinator::new(offset.clone());
            tokio::spawn(coordinator.run());
            ctx.primary_tx = Some(tx);
            info!(replid = %ctx.replid, "running as primary");
        }
        Role::Replica { host, port } => {
            let host = host.clone();
            let port = *port;
            let primary = format!("{host}:{port}");
            let own_port = config.port;
            let store = store.clone();
            let offset = offset.clone();
            tokio::spawn(async move {
                follower::run(host, port, own_port, store, offset).await;
            });
            info!(%primary, "running as follower");
        }
    }

    let ctx = Arc::new(ctx);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(error = %err, "failed to accept connection");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            connection::handle_connection(stream, ctx).await;
            tracing::debug!(%addr, "connection closed");
        });
    }
}
