use std::sync::Arc;

use super::{
    poll::PollSet,
    registry::{ConnId, Connection, Registry},
    router::Router,
};
use crate::{
    CloseReason,
    config::ServerConfig,
    error::FrameError,
    frames::{Frame, FrameState, Opcode},
    protocol::{Message, Reassembler},
    role::Role,
};

/// Raw handler for Binary messages. A returned buffer is sent back as Binary.
pub type BinaryHandler = Box<dyn Fn(ConnId, &[u8]) -> Option<Vec<u8>> + Send + Sync>;
/// Called once per connection when it leaves the registry.
pub type RemoveHandler = Box<dyn Fn(ConnId, Option<CloseReason>) + Send + Sync>;

/// What to do with a connection after its bytes were handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Open,
    Remove(Option<CloseReason>),
}

/// State shared by the server threads.
pub(crate) struct Dispatcher {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) poller: Arc<dyn PollSet>,
    router: Router,
    binary: Option<BinaryHandler>,
    on_remove: Option<RemoveHandler>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: ServerConfig,
        poller: Arc<dyn PollSet>,
        router: Router,
        binary: Option<BinaryHandler>,
        on_remove: Option<RemoveHandler>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new()),
            poller,
            router,
            binary,
            on_remove,
        }
    }

    /// Feeds bytes read from `conn` to its cursor and handles every complete frame, in order.
    pub(crate) fn on_bytes(&self, conn: &Connection, bytes: &[u8]) -> Outcome {
        let mut guard = conn.state.lock();
        let state = &mut *guard;
        state.cursor.push_bytes(bytes);
        loop {
            match state.cursor.next_frame() {
                Ok(FrameState::Complete(frame)) => {
                    if let Outcome::Remove(reason) = self.handle_frame(conn, &mut state.message, frame) {
                        return Outcome::Remove(reason);
                    }
                }
                Ok(FrameState::Incomplete) => return Outcome::Open,
                Err(e) => return fail(conn, &e),
            }
        }
    }

    fn handle_frame(&self, conn: &Connection, message: &mut Reassembler, frame: Frame) -> Outcome {
        if let Err(e) = frame.validate(Role::Server.expects_masked(), [false; 3]) {
            return fail(conn, &e);
        }

        match frame.opcode {
            Opcode::Ping => {
                tracing::debug!(id = conn.id(), "received PING, replying with PONG");
                io_outcome(conn, conn.pong(&frame.payload))
            }
            Opcode::Pong => {
                tracing::trace!(id = conn.id(), "received PONG");
                Outcome::Open
            }
            Opcode::Close => {
                let reason = CloseReason::from_code(frame.close_code);
                tracing::info!(id = conn.id(), reason = ?reason, "received Close frame");
                let _ = conn.close(reason, "");
                Outcome::Remove(Some(reason))
            }
            _ => match message.push(frame) {
                Ok(Some(msg)) => self.deliver(conn, msg),
                Ok(None) => Outcome::Open,
                Err(e) => fail(conn, &e),
            },
        }
    }

    fn deliver(&self, conn: &Connection, msg: Message) -> Outcome {
        tracing::debug!(id = conn.id(), len = msg.len(), "message received");
        match msg {
            Message::Text(text) => {
                let resp = self.router.dispatch(&text);
                io_outcome(conn, conn.send(resp.to_string().as_bytes(), Opcode::Text))
            }
            Message::Binary(bytes) => {
                let Some(handler) = &self.binary else {
                    tracing::warn!(id = conn.id(), "binary message without a handler");
                    let _ = conn.close(CloseReason::DataType, "binary messages are not accepted");
                    return Outcome::Remove(Some(CloseReason::DataType));
                };
                match handler(conn.id(), &bytes) {
                    Some(reply) => io_outcome(conn, conn.send(&reply, Opcode::Bin)),
                    None => Outcome::Open,
                }
            }
        }
    }

    /// Deregisters, closes and forgets `conn`. Safe to call more than once.
    pub(crate) fn remove(&self, conn: &Connection, reason: Option<CloseReason>) {
        if !conn.mark_removed() {
            return;
        }
        self.registry.remove(conn.id());
        let _ = self.poller.deregister(conn.stream());
        conn.shutdown();
        tracing::info!(id = conn.id(), peer = %conn.peer_addr(), reason = ?reason, "connection removed");
        if let Some(on_remove) = &self.on_remove {
            on_remove(conn.id(), reason);
        }
    }
}

// Close with the violation's status, then drop the connection
fn fail(conn: &Connection, err: &FrameError) -> Outcome {
    let reason = err.close_reason();
    tracing::warn!(id = conn.id(), error = %err, reason = ?reason, "protocol violation detected, closing");
    let _ = conn.close(reason, &err.to_string());
    Outcome::Remove(Some(reason))
}

fn io_outcome(conn: &Connection, result: crate::Result<()>) -> Outcome {
    match result {
        Ok(()) => Outcome::Open,
        Err(e) => {
            tracing::warn!(id = conn.id(), error = %e, "write failed");
            Outcome::Remove(None)
        }
    }
}
