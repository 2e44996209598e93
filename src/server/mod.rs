//! Thread-based server engine.
//!
//! An accept thread hands new sockets to a pool of upgrade workers through a bounded queue.
//! Upgraded connections go into the [`Registry`] and the poll set; a single readiness thread
//! reads and dispatches them. A keepalive thread pings every connection on an interval.

mod dispatch;
mod keepalive;
mod poll;
mod registry;
mod router;
mod upgrade;

use std::{
    io::Write,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Sender, TrySendError};
pub use dispatch::{BinaryHandler, RemoveHandler};
use dispatch::Dispatcher;
pub use poll::{OsPoller, PollSet};
pub use registry::{ConnId, Connection, Registry};
pub use router::{Request, Response, Router};

use crate::{CloseReason, config::ServerConfig, error::Result, handshake};

pub struct WebSocketServer {
    listener: TcpListener,
    config: ServerConfig,
    router: Router,
    binary: Option<BinaryHandler>,
    on_remove: Option<RemoveHandler>,
}

impl WebSocketServer {
    /// # Errors
    /// Fails if the address cannot be bound.
    pub fn bind(addr: impl ToSocketAddrs, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        tracing::info!(addr = %listener.local_addr()?, "listening");
        Ok(Self {
            listener,
            config,
            router: Router::new(),
            binary: None,
            on_remove: None,
        })
    }

    /// # Errors
    /// Propagates the OS error.
    pub fn local_addr(&self) -> Result<SocketAddr> { Ok(self.listener.local_addr()?) }

    /// Routes Text messages.
    #[must_use]
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Handles Binary messages. Without one, a Binary message closes the connection with 1003.
    #[must_use]
    pub fn on_binary(
        mut self,
        handler: impl Fn(ConnId, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.binary = Some(Box::new(handler));
        self
    }

    /// Called with the connection id and close reason whenever a connection is removed.
    #[must_use]
    pub fn on_remove(mut self, handler: impl Fn(ConnId, Option<CloseReason>) + Send + Sync + 'static) -> Self {
        self.on_remove = Some(Box::new(handler));
        self
    }

    /// Runs until the process exits.
    ///
    /// # Errors
    /// See [`WebSocketServer::spawn`].
    pub fn run(self) -> Result<()> {
        self.spawn()?.join();
        Ok(())
    }

    /// Starts the server threads and returns a handle to stop them.
    ///
    /// # Errors
    /// Fails if the OS poller cannot be created or the listener address is unavailable.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.listener.local_addr()?;
        let poller: Arc<dyn PollSet> = Arc::new(OsPoller::new()?);
        let config = self.config;
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            poller,
            self.router,
            self.binary,
            self.on_remove,
        ));
        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::new();

        let (queue_tx, queue_rx) = crossbeam_channel::bounded(config.upgrade_queue);
        for i in 0..config.upgrade_workers.max(1) {
            let rx = queue_rx.clone();
            let d = Arc::clone(&dispatcher);
            threads.push(
                thread::Builder::new()
                    .name(format!("ws-upgrade-{i}"))
                    .spawn(move || upgrade::worker(&rx, &d))?,
            );
        }
        drop(queue_rx);

        {
            let d = Arc::clone(&dispatcher);
            let running = Arc::clone(&running);
            threads.push(
                thread::Builder::new()
                    .name("ws-poll".into())
                    .spawn(move || poll::readiness_loop(&d, &running))?,
            );
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        if let Some(period) = config.keepalive {
            let d = Arc::clone(&dispatcher);
            threads.push(
                thread::Builder::new()
                    .name("ws-keepalive".into())
                    .spawn(move || keepalive::run(&d, period, &stop_rx))?,
            );
        }

        {
            let running = Arc::clone(&running);
            let listener = self.listener;
            let write_timeout = config.write_timeout;
            threads.push(
                thread::Builder::new()
                    .name("ws-accept".into())
                    .spawn(move || accept_loop(&listener, &queue_tx, &running, write_timeout))?,
            );
        }

        Ok(ServerHandle {
            addr,
            running,
            stop_tx: Some(stop_tx),
            dispatcher,
            threads,
        })
    }
}

// Blocking accept, queueing sockets for the upgrade workers
fn accept_loop(listener: &TcpListener, queue: &Sender<TcpStream>, running: &AtomicBool, write_timeout: Duration) {
    for stream in listener.incoming() {
        if !running.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = ?e, "accept failed");
                continue;
            }
        };
        match queue.try_send(stream) {
            Ok(()) => {}
            Err(TrySendError::Full(mut stream)) => {
                tracing::warn!(peer = ?stream.peer_addr().ok(), "upgrade queue full, rejecting");
                let _ = stream.set_write_timeout(Some(write_timeout));
                let resp = handshake::build_error_response(503, "Service Unavailable", "");
                let _ = stream.write_all(resp.as_bytes());
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    tracing::debug!("accept loop stopped");
}

/// Controls a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    dispatcher: Arc<Dispatcher>,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.addr }

    /// Number of upgraded connections currently registered.
    #[must_use]
    pub fn connections(&self) -> usize { self.dispatcher.registry.len() }

    /// Sends Close 1001 to every connection, stops all threads and waits for them.
    pub fn shutdown(mut self) { self.stop(); }

    /// Blocks until the server threads exit.
    pub fn join(mut self) {
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }

    fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!(addr = %self.addr, "shutting down");

        self.stop_tx.take();
        let _ = self.dispatcher.poller.notify();
        // unblock accept
        let _ = TcpStream::connect(wake_addr(self.addr));

        self.close_all();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        // upgrades that finished while the threads were stopping
        self.close_all();
    }

    fn close_all(&self) {
        for conn in self.dispatcher.registry.snapshot() {
            let _ = conn.close(CloseReason::GoingAway, "server shutting down");
            self.dispatcher.remove(&conn, Some(CloseReason::GoingAway));
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) { self.stop(); }
}

// The listener may be bound to the unspecified address, which can't be connected to
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_addr_replaces_unspecified() {
        let addr: SocketAddr = "0.0.0.0:9001".parse().unwrap();
        assert_eq!(wake_addr(addr), "127.0.0.1:9001".parse().unwrap());
        let addr: SocketAddr = "[::]:9001".parse().unwrap();
        assert_eq!(wake_addr(addr), "[::1]:9001".parse().unwrap());
    }

    #[test]
    fn spawn_and_shutdown() {
        let server = WebSocketServer::bind("127.0.0.1:0", ServerConfig::default()).unwrap();
        let handle = server.spawn().unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert_eq!(handle.connections(), 0);
        handle.shutdown();
    }
}
