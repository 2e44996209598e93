//! Readiness notification and the loop that drives it.

use std::{
    io,
    net::TcpStream,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use polling::{Event, Events, Poller};

use super::{
    dispatch::{Dispatcher, Outcome},
    registry::ConnId,
};

const READ_BUF: usize = 16 * 1024;

/// One-shot read readiness over a set of sockets, keyed by connection id.
///
/// A socket reports at most once per arming; after its event is handled it must be re-armed
/// with [`PollSet::modify`] before it reports again.
pub trait PollSet: Send + Sync {
    fn register(&self, stream: &TcpStream, key: ConnId) -> io::Result<()>;

    /// Re-arms read interest after an event was processed.
    fn modify(&self, stream: &TcpStream, key: ConnId) -> io::Result<()>;

    fn deregister(&self, stream: &TcpStream) -> io::Result<()>;

    /// Blocks until a socket is ready, `notify` is called or `timeout` elapses. Ready keys are
    /// appended to `ready`.
    fn wait(&self, ready: &mut Vec<ConnId>, timeout: Option<Duration>) -> io::Result<usize>;

    /// Wakes a blocked `wait`.
    fn notify(&self) -> io::Result<()>;
}

/// [`PollSet`] backed by epoll, kqueue or IOCP through `polling`.
pub struct OsPoller {
    poller: Poller,
}

impl OsPoller {
    /// # Errors
    /// Fails if the OS poller cannot be created, e.g. out of file descriptors.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
        })
    }
}

impl PollSet for OsPoller {
    fn register(&self, stream: &TcpStream, key: ConnId) -> io::Result<()> {
        // SAFETY: the socket is owned by its `Connection`, which deregisters it before the
        // socket is dropped.
        unsafe { self.poller.add(stream, Event::readable(key)) }
    }

    fn modify(&self, stream: &TcpStream, key: ConnId) -> io::Result<()> {
        self.poller.modify(stream, Event::readable(key))
    }

    fn deregister(&self, stream: &TcpStream) -> io::Result<()> { self.poller.delete(stream) }

    fn wait(&self, ready: &mut Vec<ConnId>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = Events::new();
        let n = self.poller.wait(&mut events, timeout)?;
        ready.extend(events.iter().filter(|e| e.readable).map(|e| e.key));
        Ok(n)
    }

    fn notify(&self) -> io::Result<()> { self.poller.notify() }
}

/// Waits for readiness and dispatches one read per ready connection until `running` clears.
pub(crate) fn readiness_loop(dispatcher: &Dispatcher, running: &AtomicBool) {
    let span = tracing::info_span!("poll", role = "SRV");
    let _enter = span.enter();

    let mut ready = Vec::new();
    let mut buf = vec![0; READ_BUF];
    let timeout = Some(dispatcher.config.poll_timeout);

    while running.load(Ordering::Acquire) {
        ready.clear();
        match dispatcher.poller.wait(&mut ready, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = ?e, "poll failed, stopping readiness loop");
                break;
            }
        }

        for &id in &ready {
            let Some(conn) = dispatcher.registry.get(id) else {
                continue;
            };

            let outcome = match conn.read(&mut buf) {
                Ok(0) => {
                    tracing::info!(id, "TCP FIN");
                    Outcome::Remove(None)
                }
                Ok(n) => {
                    tracing::trace!(id, bytes = n, "read socket");
                    dispatcher.on_bytes(&conn, &buf[..n])
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    Outcome::Open
                }
                Err(e) => {
                    tracing::warn!(id, error = ?e, "reader error");
                    Outcome::Remove(None)
                }
            };

            match outcome {
                Outcome::Open => {
                    if let Err(e) = dispatcher.poller.modify(conn.stream(), id) {
                        tracing::warn!(id, error = ?e, "failed to re-arm connection");
                        dispatcher.remove(&conn, None);
                    }
                }
                Outcome::Remove(reason) => dispatcher.remove(&conn, reason),
            }
        }
    }
    tracing::debug!("readiness loop stopped");
}
