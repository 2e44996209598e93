use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::Arc,
};

use crossbeam_channel::Receiver;

use super::{
    dispatch::{Dispatcher, Outcome},
    registry::Connection,
};
use crate::{
    error::{Error, HandshakeError, Result},
    handshake::{self, MAX_REQUEST_LEN},
};

/// Upgrades sockets from the accept queue until it is closed.
pub(crate) fn worker(queue: &Receiver<TcpStream>, dispatcher: &Dispatcher) {
    for stream in queue {
        let peer = stream.peer_addr().ok();
        if let Err(e) = upgrade(stream, dispatcher) {
            tracing::warn!(peer = ?peer, error = %e, "upgrade failed");
        }
    }
    tracing::debug!("upgrade worker stopped");
}

/// Reads and answers the opening handshake, then hands the connection to the readiness loop.
pub(crate) fn upgrade(mut stream: TcpStream, dispatcher: &Dispatcher) -> Result<()> {
    let config = &dispatcher.config;
    stream.set_read_timeout(Some(config.handshake_timeout))?;
    stream.set_write_timeout(Some(config.write_timeout))?;

    let (head, leftover) = match read_head(&mut stream) {
        Ok(parts) => parts,
        Err(Error::Handshake(e)) => return reject(&mut stream, e),
        Err(e) => return Err(e),
    };
    let hs = match handshake::parse_request(&head) {
        Ok(hs) => hs,
        Err(e) => return reject(&mut stream, e),
    };

    let protocol = handshake::select_protocol(&hs.protocols, &config.protocols);
    stream.write_all(handshake::build_response(&hs.accept_key(), protocol).as_bytes())?;
    stream.flush()?;

    let id = dispatcher.registry.next_id();
    let conn = Arc::new(Connection::new(id, stream, config)?);
    tracing::info!(id, peer = %conn.peer_addr(), path = hs.path(), protocol = ?protocol, "client connected");

    // frames that arrived together with the request
    if !leftover.is_empty() {
        if let Outcome::Remove(reason) = dispatcher.on_bytes(&conn, &leftover) {
            dispatcher.remove(&conn, reason);
            return Ok(());
        }
    }

    activate(dispatcher, &conn)
}

// The registry entry has to exist before the first readiness event, so it goes in first.
// Keepalive may remove the connection before it is registered, which leaves the socket in the
// poll set; undo the registration in that case.
fn activate(dispatcher: &Dispatcher, conn: &Arc<Connection>) -> Result<()> {
    dispatcher.registry.insert(Arc::clone(conn));
    let registered = dispatcher.poller.register(conn.stream(), conn.id());
    if conn.is_removed() {
        tracing::debug!(id = conn.id(), "removed while registering");
        dispatcher.registry.remove(conn.id());
        if registered.is_ok() {
            let _ = dispatcher.poller.deregister(conn.stream());
        }
        return Ok(());
    }
    if let Err(e) = registered {
        dispatcher.remove(conn, None);
        return Err(e.into());
    }
    Ok(())
}

// Reads up to the blank line, returning the header block and any bytes after it
fn read_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = handshake::find_header_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_REQUEST_LEN {
            return Err(HandshakeError::RequestTooLarge(MAX_REQUEST_LEN).into());
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(HandshakeError::RequestTooShort.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn reject(stream: &mut TcpStream, err: HandshakeError) -> Result<()> {
    tracing::warn!(error = %err, status = err.status().0, "rejecting upgrade");
    stream.write_all(handshake::build_rejection(&err).as_bytes())?;
    stream.flush()?;
    let _ = stream.shutdown(std::net::Shutdown::Both);
    Err(err.into())
}
