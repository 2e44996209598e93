use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncWriteExt, WriteHalf},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

use super::{MessageHandler, transport::BoxStream};
use crate::{
    CloseReason,
    config::ClientConfig,
    error::{Error, Result},
    frames::{ControlFrame, DataFrame, Opcode},
    protocol::PingStats,
    role::Role,
};

/// Lifecycle of a client connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl From<u8> for State {
    fn from(b: u8) -> Self {
        match b {
            1 => Self::Connecting,
            2 => Self::Open,
            3 => Self::Closing,
            4 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: State) -> Self { Self(AtomicU8::new(state as u8)) }

    pub(crate) fn load(&self) -> State { self.0.load(Ordering::Acquire).into() }

    pub(crate) fn store(&self, state: State) { self.0.store(state as u8, Ordering::Release); }

    /// Moves `from -> to`, returning false if the state was something else.
    pub(crate) fn transition(&self, from: State, to: State) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Which task asked for the teardown, so it doesn't abort itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    User,
    Reader,
    Keepalive,
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

pub(crate) struct ClientInner {
    writer: tokio::sync::Mutex<WriteHalf<BoxStream>>,
    pub(crate) state: Arc<StateCell>,
    pub(crate) ping_stats: Mutex<PingStats>,
    /// Completed by the read task when the peer answers our Close.
    pub(crate) close_tx: Mutex<Option<oneshot::Sender<CloseReason>>>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) config: ClientConfig,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) protocol: Option<String>,
    tasks: Mutex<Tasks>,
    torn_down: AtomicBool,
}

impl ClientInner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        writer: WriteHalf<BoxStream>,
        state: Arc<StateCell>,
        handler: Arc<dyn MessageHandler>,
        config: ClientConfig,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        protocol: Option<String>,
    ) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            state,
            ping_stats: Mutex::new(PingStats::new()),
            close_tx: Mutex::new(None),
            handler,
            config,
            local_addr,
            peer_addr,
            protocol,
            tasks: Mutex::new(Tasks::default()),
            torn_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_tasks(&self, reader: JoinHandle<()>, keepalive: Option<JoinHandle<()>>) {
        let mut tasks = self.tasks.lock();
        tasks.reader = Some(reader);
        tasks.keepalive = keepalive;
    }

    // send data (bytes) over the websocket
    pub(crate) async fn send(&self, bytes: &[u8], opcode: Opcode) -> Result<()> {
        if self.state.load() != State::Open {
            return Err(Error::Closed);
        }
        let chunks = DataFrame::new(bytes, opcode, Role::Client).encode(self.config.max_frame_payload);
        self.write_chunks(&chunks).await
    }

    // send ping with a fresh nonce
    pub(crate) async fn ping(&self) -> Result<()> {
        let nonce = self.ping_stats.lock().new_ping();
        self.write_once(&ControlFrame::ping(&nonce, Role::Client).encode()).await
    }

    pub(crate) async fn pong(&self, payload: &[u8]) -> Result<()> {
        self.write_once(&ControlFrame::pong(payload, Role::Client).encode()).await
    }

    pub(crate) async fn send_close(&self, reason: CloseReason, text: &str) -> Result<()> {
        self.write_once(&ControlFrame::close_reason(reason, text, Role::Client)).await
    }

    pub(crate) async fn write_once(&self, bytes: &[u8]) -> Result<()> {
        self.write_chunks(std::slice::from_ref(&Bytes::copy_from_slice(bytes))).await
    }

    /// Writes all chunks under one lock acquisition so nothing interleaves with them.
    pub(crate) async fn write_chunks(&self, chunks: &[Bytes]) -> Result<()> {
        let mut ws = self.writer.lock().await;
        timeout(self.config.write_timeout, async {
            for chunk in chunks {
                ws.write_all(chunk).await?;
            }
            ws.flush().await
        })
        .await??;
        Ok(())
    }

    /// Stops the other tasks, shuts the transport down and reports the close.
    /// Only the first caller does anything, so a running teardown is never aborted by a later one.
    pub(crate) async fn teardown(&self, reason: Option<CloseReason>, origin: Origin) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(State::Closed);
        self.abort_tasks(origin);
        // nobody is waiting on a reply anymore
        self.close_tx.lock().take();

        {
            let mut ws = self.writer.lock().await;
            let _ = timeout(self.config.write_timeout, ws.shutdown()).await;
        }

        tracing::info!(peer = %self.peer_addr, reason = ?reason, "connection closed");
        self.handler.on_close(reason).await;
    }

    pub(crate) fn abort_tasks(&self, origin: Origin) {
        let mut tasks = self.tasks.lock();
        if origin != Origin::Reader {
            if let Some(reader) = tasks.reader.take() {
                reader.abort();
            }
        }
        if origin != Origin::Keepalive {
            if let Some(keepalive) = tasks.keepalive.take() {
                keepalive.abort();
            }
        }
    }
}
