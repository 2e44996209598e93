use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::dispatch::Dispatcher;

const KEEPALIVE_PAYLOAD: &[u8] = b"keepalive";

/// Pings every open connection each `period` until `stop` is signalled or dropped.
pub(crate) fn run(dispatcher: &Dispatcher, period: Duration, stop: &Receiver<()>) {
    let span = tracing::info_span!("keepalive", role = "SRV");
    let _enter = span.enter();

    loop {
        match stop.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {
                ping_all(dispatcher);
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("keepalive stopped");
}

/// Sends one Ping to a snapshot of the registry. The registry lock is not held while sending.
pub(crate) fn ping_all(dispatcher: &Dispatcher) -> usize {
    let conns = dispatcher.registry.snapshot();
    tracing::trace!(connections = conns.len(), "keepalive ping");
    let mut sent = 0;
    for conn in conns {
        match conn.ping(KEEPALIVE_PAYLOAD) {
            Ok(()) => sent += 1,
            Err(e) => {
                tracing::warn!(id = conn.id(), error = %e, "keepalive ping failed");
                dispatcher.remove(&conn, None);
            }
        }
    }
    sent
}
