//! TCP server for echo connections.
//!
//! Accepts connections and runs one server-role `EchoConnection` per
//! accepted stream. The server keeps no per-connection state of its own
//! beyond the shared counters.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionSettings, EchoConnection, Role};
use crate::stats::Counters;

/// Bound listener, not yet accepting
pub struct EchoServer {
    listener: TcpListener,
    settings: ConnectionSettings,
    connection_limit: Arc<Semaphore>,
}

impl EchoServer {
    /// Bind the listening socket. Must be called inside a tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        backlog: i32,
        max_connections: usize,
        settings: ConnectionSettings,
    ) -> io::Result<Self> {
        let listener = TcpListener::from_std(create_listener(addr, backlog)?)?;
        info!(address = %listener.local_addr()?, max_connections, "Server listening");

        Ok(EchoServer {
            listener,
            settings,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
        })
    }

    /// Start accepting connections in the background.
    pub fn serve(self) -> io::Result<ServerHandle> {
        let local_addr = self.listener.local_addr()?;
        let counters = Arc::clone(&self.settings.counters);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let task = tokio::spawn(self.accept_loop(shutdown_rx, closed_tx));

        Ok(ServerHandle {
            local_addr,
            counters,
            shutdown: shutdown_tx,
            closed: closed_rx,
            task,
        })
    }

    async fn accept_loop(
        self,
        mut shutdown: oneshot::Receiver<Duration>,
        closed: watch::Sender<bool>,
    ) {
        let mut connections = JoinSet::new();

        let grace = loop {
            while connections.try_join_next().is_some() {}

            // Wait for a connection slot
            let permit = tokio::select! {
                grace = &mut shutdown => break grace.unwrap_or(Duration::ZERO),
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Duration::ZERO,
                },
            };

            tokio::select! {
                grace = &mut shutdown => break grace.unwrap_or(Duration::ZERO),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let (connection, _completion) =
                            EchoConnection::new(stream, Role::Server, &self.settings);
                        debug!(id = connection.id(), peer = %peer, "New connection");

                        connections.spawn(async move {
                            connection.run().await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        };

        drop(self.listener);
        info!(in_flight = connections.len(), "Server stopped accepting");

        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Aborting connections still open after grace period"
            );
            connections.shutdown().await;
        }

        let _ = closed.send(true);
    }
}

/// Handle to a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    counters: Arc<Counters>,
    shutdown: oneshot::Sender<Duration>,
    closed: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Lifecycle signal that turns `true` once the server has fully stopped.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    /// Stop accepting, give in-flight connections `grace` to finish, then
    /// abort whatever is left and release the listener.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(grace);
        if let Err(e) = self.task.await {
            error!(error = %e, "Server task failed");
        }
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
