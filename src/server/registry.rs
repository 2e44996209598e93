use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    CloseReason,
    config::ServerConfig,
    error::Result,
    frames::{ControlFrame, DataFrame, FrameCursor, Opcode},
    protocol::Reassembler,
    role::Role,
};

/// Identifies a connection in the registry and in the poll set.
pub type ConnId = usize;

/// Decode progress of one connection, only touched while its event is being handled.
pub(crate) struct ConnState {
    pub(crate) cursor: FrameCursor,
    pub(crate) message: Reassembler,
}

/// An upgraded server-side connection.
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    pub(crate) state: Mutex<ConnState>,
    max_frame_payload: usize,
    close_sent: AtomicBool,
    removed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(id: ConnId, stream: TcpStream, config: &ServerConfig) -> io::Result<Self> {
        stream.set_read_timeout(Some(config.read_timeout))?;
        stream.set_write_timeout(Some(config.write_timeout))?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;

        Ok(Self {
            id,
            peer,
            stream,
            writer: Mutex::new(writer),
            state: Mutex::new(ConnState {
                cursor: FrameCursor::new(config.max_frame_size),
                message: Reassembler::new(config.max_message_size),
            }),
            max_frame_payload: config.max_frame_payload,
            close_sent: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> ConnId { self.id }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr { self.peer }

    pub(crate) fn stream(&self) -> &TcpStream { &self.stream }

    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> { (&self.stream).read(buf) }

    /// Sends a data message, fragmented at the configured frame size.
    pub(crate) fn send(&self, bytes: &[u8], opcode: Opcode) -> Result<()> {
        let chunks = DataFrame::new(bytes, opcode, Role::Server).encode(self.max_frame_payload);
        self.write_chunks(&chunks)
    }

    pub(crate) fn ping(&self, payload: &[u8]) -> Result<()> {
        self.write_chunks(&[ControlFrame::ping(payload, Role::Server).encode()])
    }

    pub(crate) fn pong(&self, payload: &[u8]) -> Result<()> {
        self.write_chunks(&[ControlFrame::pong(payload, Role::Server).encode()])
    }

    /// Sends a Close frame unless one was already sent on this connection.
    pub(crate) fn close(&self, reason: CloseReason, text: &str) -> Result<()> {
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(id = self.id, reason = ?reason, "sending Close");
        self.write_chunks(&[ControlFrame::close_reason(reason, text, Role::Server)])
    }

    // one lock acquisition per message so frames never interleave
    fn write_chunks(&self, chunks: &[Bytes]) -> Result<()> {
        let mut w = self.writer.lock();
        for chunk in chunks {
            w.write_all(chunk)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Marks the connection removed. Only the first caller gets `true`.
    pub(crate) fn mark_removed(&self) -> bool { !self.removed.swap(true, Ordering::AcqRel) }

    pub(crate) fn is_removed(&self) -> bool { self.removed.load(Ordering::Acquire) }

    pub(crate) fn shutdown(&self) { let _ = self.stream.shutdown(Shutdown::Both); }
}

/// Open connections by id.
#[derive(Default)]
pub struct Registry {
    conns: Mutex<HashMap<ConnId, Arc<Connection>>>,
    next_id: AtomicUsize,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    pub(crate) fn next_id(&self) -> ConnId { self.next_id.fetch_add(1, Ordering::Relaxed) + 1 }

    pub(crate) fn insert(&self, conn: Arc<Connection>) { self.conns.lock().insert(conn.id(), conn); }

    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> { self.conns.lock().get(&id).cloned() }

    pub(crate) fn remove(&self, id: ConnId) -> Option<Arc<Connection>> { self.conns.lock().remove(&id) }

    /// Copies the current connections out so they can be used without holding the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> { self.conns.lock().values().cloned().collect() }

    #[must_use]
    pub fn len(&self) -> usize { self.conns.lock().len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.conns.lock().is_empty() }
}
