//! HTTP server and graceful drain.
//!
//! The server stops accepting connections in two situations:
//!
//! - an OS shutdown signal (**SIGTERM** from an orchestrator, **SIGINT** /
//!   Ctrl-C locally), or
//! - a request fault, through the [`ServerHandle`] given to
//!   [`FaultIsolation`](crate::middleware::FaultIsolation).
//!
//! Either way the reaction is the same drain:
//! 1. Stop calling `listener.accept()`; no new connections are made.
//! 2. Ask every open connection to finish its in-flight requests and close
//!    (keep-alive connections do not linger).
//! 3. Return from [`Server::serve`] once every connection task is done.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::router::Router;

const LISTEN_BACKLOG: u32 = 1024;

/// Narrow, cloneable capability over the server's listener.
///
/// The only thing it can do to the server is stop it accepting new
/// connections; in-flight connections are left to finish.
#[derive(Clone)]
pub struct ServerHandle {
    accepting: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { accepting: Arc::new(tx) }
    }

    /// Stops the listener accepting new connections. Idempotent.
    pub fn stop_accepting(&self) {
        let stopped = self.accepting.send_if_modified(|accepting| std::mem::replace(accepting, false));
        if stopped {
            warn!("listener stopped accepting new connections");
        }
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.borrow()
    }

    /// Resolves once [`stop_accepting`](Self::stop_accepting) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.accepting.subscribe();
        // The sender lives in `self`, so this only errors if it is dropped
        // mid-wait, which cannot happen while we borrow it.
        let _ = rx.wait_for(|accepting| !*accepting).await;
    }
}

/// The HTTP server.
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    handle: ServerHandle,
}

impl Server {
    /// Binds `addr` (`host:port`).
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// ```rust,no_run
    /// # async fn run() -> Result<(), meadowlark::Error> {
    /// let server = meadowlark::Server::bind("0.0.0.0:3000")?;
    /// # Ok(()) }
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        Self::bind_with(addr, false)
    }

    /// Binds `addr` with `SO_REUSEPORT`, so several worker processes can
    /// share the port and the kernel balances connections between them.
    pub fn bind_shared(addr: &str) -> Result<Self, Error> {
        Self::bind_with(addr, true)
    }

    fn bind_with(addr: &str, reuse_port: bool) -> Result<Self, Error> {
        let addr: SocketAddr = addr.parse().map_err(|_| Error::InvalidAddr(addr.to_owned()))?;
        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        socket.set_reuseport(reuse_port)?;
        #[cfg(not(unix))]
        if reuse_port {
            return Err(Error::Worker("shared ports need SO_REUSEPORT (unix only)".to_owned()));
        }
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr, handle: ServerHandle::new() })
    }

    /// The bound address. Useful after binding port `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The capability to stop this server accepting connections.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Starts accepting connections and dispatching them through `router`.
    ///
    /// Returns only after a full drain: a shutdown signal or a fault stopped
    /// the listener and every in-flight connection completed.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        let Self { listener, addr, handle } = self;
        let router = Arc::new(router);

        info!(%addr, "meadowlark listening");

        // JoinSet tracks every spawned connection task so we can wait for
        // them all to finish while draining.
        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let stopped = handle.stopped();
        tokio::pin!(stopped);
        let mut signalled = false;

        loop {
            tokio::select! {
                // Check the stop conditions first so a fault or SIGTERM stops
                // accepting immediately, even if more connections are queued.
                biased;

                () = &mut stopped => {
                    info!(in_flight = tasks.len(), "draining connections");
                    break;
                }

                () = &mut shutdown, if !signalled => {
                    signalled = true;
                    info!("shutdown signal received");
                    handle.stop_accepting();
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let handle = handle.clone();
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| Arc::clone(&router).dispatch(req));

                        // `auto::Builder` handles both HTTP/1.1 and HTTP/2.
                        let builder = ConnBuilder::new(TokioExecutor::new());
                        let conn = builder.serve_connection(io, svc);
                        tokio::pin!(conn);

                        let result = tokio::select! {
                            res = conn.as_mut() => res,
                            () = handle.stopped() => {
                                conn.as_mut().graceful_shutdown();
                                conn.await
                            }
                        };
                        if let Err(e) = result {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        while tasks.join_next().await.is_some() {}

        info!("meadowlark stopped");
        Ok(())
    }
}

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both SIGTERM and SIGINT; elsewhere only Ctrl-C.
/// A signal that cannot be installed is logged and never resolves.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_stops_once() {
        let handle = ServerHandle::new();
        assert!(handle.is_accepting());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.stopped().await })
        };

        handle.stop_accepting();
        handle.stop_accepting();
        assert!(!handle.is_accepting());
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn bind_reports_bad_addresses() {
        assert!(matches!(Server::bind("not an addr"), Err(Error::InvalidAddr(_))));

        let server = Server::bind("127.0.0.1:0").unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shared_binds_can_coexist() {
        let first = Server::bind_shared("127.0.0.1:0").unwrap();
        let addr = first.local_addr().to_string();
        let second = Server::bind_shared(&addr).unwrap();
        assert_eq!(first.local_addr(), second.local_addr());
    }
}
