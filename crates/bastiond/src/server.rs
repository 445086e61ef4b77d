//! TCP listener and accept loop.
//!
//! `Server::start` binds the listener, spawns the acceptor, and hands back
//! a [`ServerHandle`] the caller (main or a test) uses to find the bound
//! address and to shut the server down. Shutdown broadcasts a
//! `DisconnectResponse` to every live session before the acceptor stops.

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use bastion_core::config::BastionConfig;
use bastion_core::wire::{Envelope, MessageCode};
use bastion_services::{
    EventSink, FileStore, KeyRepository, PendingRelays, ServerEvent, ServerIdentity,
    SessionRegistry,
};

use crate::connection;

/// Everything a connection worker needs, shared behind one Arc.
pub struct ServerState {
    pub config: BastionConfig,
    pub identity: ServerIdentity,
    pub keys: KeyRepository,
    pub registry: SessionRegistry,
    pub store: FileStore,
    pub relays: PendingRelays,
    pub events: Arc<dyn EventSink>,
}

pub struct Server;

impl Server {
    /// Bind, spawn the accept loop, and return the running server's handle.
    pub async fn start(
        config: BastionConfig,
        identity: ServerIdentity,
        events: Arc<dyn EventSink>,
    ) -> anyhow::Result<ServerHandle> {
        let store = FileStore::open(&config.storage.root)
            .with_context(|| format!("opening file store at {}", config.storage.root.display()))?;
        let keys = KeyRepository::new(&config.keys.user_key_dir);
        let bind = format!("{}:{}", config.network.listen_addr, config.network.port);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("binding {bind}"))?;
        let local_addr = listener.local_addr().context("resolving bound address")?;

        let state = Arc::new(ServerState {
            config,
            identity,
            keys,
            registry: SessionRegistry::new(),
            store,
            relays: PendingRelays::new(),
            events,
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        state.events.event(&ServerEvent::Started { addr: local_addr });

        let acceptor = tokio::spawn(accept_loop(
            listener,
            state.clone(),
            shutdown_tx.subscribe(),
        ));

        Ok(ServerHandle {
            local_addr,
            state,
            shutdown_tx,
            acceptor,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    let shutdown = shutdown.resubscribe();
                    tokio::spawn(connection::run(state, stream, peer, shutdown));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            },
            _ = shutdown.recv() => break,
        }
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: std::net::SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
    acceptor: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Stop accepting, tell every session goodbye, and wait for the
    /// acceptor to exit. Connection workers observe the same broadcast
    /// and tear themselves down.
    pub async fn shutdown(self) {
        let goodbye = Envelope::new(
            MessageCode::DisconnectResponse,
            "Disconnect",
            "Server disconnected",
        )
        .encode();
        for (username, sender) in self.state.registry.all_senders() {
            if sender.send(Bytes::from(goodbye.clone())).is_err() {
                info!(%username, "session writer already gone at shutdown");
            }
        }
        let _ = self.shutdown_tx.send(());
        let _ = self.acceptor.await;
        self.state.events.event(&ServerEvent::Stopped);
    }
}
