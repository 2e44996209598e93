use std::sync::Arc;

use tokio::{
    io::{AsyncReadExt, ReadHalf},
    time::timeout,
};
use tracing::Instrument;

use super::{
    inner::{ClientInner, Origin, State},
    transport::BoxStream,
};
use crate::{
    CloseReason,
    error::{Error, FrameError},
    frames::{Frame, FrameCursor, FrameState, Opcode},
    protocol::{Message, PongError, Reassembler},
    role::Role,
};

const READ_BUF: usize = 16 * 1024;

/// Whether the read loop keeps going after a frame.
enum Flow {
    Continue,
    Stop(Option<CloseReason>),
}

/// Reads until the connection closes, then tears it down.
pub(super) async fn recv_loop(
    inner: Arc<ClientInner>,
    mut reader: ReadHalf<BoxStream>,
    mut cursor: FrameCursor,
) {
    let span = tracing::info_span!("recv", addr = %inner.peer_addr, role = "CLI");
    async move {
        let mut buf = vec![0; READ_BUF];
        let mut reassembler = Reassembler::new(inner.config.max_message_size);

        // bytes that arrived together with the handshake response
        let mut flow = drain(&inner, &mut cursor, &mut reassembler).await;
        while let Flow::Continue = flow {
            let n = match timeout(inner.config.read_timeout, reader.read(&mut buf)).await {
                Err(_) => {
                    tracing::trace!("read deadline expired, still waiting");
                    continue;
                }
                Ok(Ok(0)) => {
                    tracing::info!("TCP FIN");
                    flow = Flow::Stop(None);
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    tracing::warn!(error = ?e, "reader error");
                    inner.handler.on_error(Error::from(e)).await;
                    flow = Flow::Stop(None);
                    break;
                }
            };
            tracing::trace!(bytes = n, "read socket");

            cursor.push_bytes(&buf[..n]);
            flow = drain(&inner, &mut cursor, &mut reassembler).await;
        }

        let reason = match flow {
            Flow::Stop(reason) => reason,
            Flow::Continue => None,
        };
        inner.teardown(reason, Origin::Reader).await;
    }
    .instrument(span)
    .await;
}

// Handle every complete frame in the cursor
async fn drain(inner: &ClientInner, cursor: &mut FrameCursor, reassembler: &mut Reassembler) -> Flow {
    loop {
        match cursor.next_frame() {
            Ok(FrameState::Complete(frame)) => {
                if let Flow::Stop(reason) = handle_frame(inner, frame, reassembler).await {
                    return Flow::Stop(reason);
                }
            }
            // break to read more bytes
            Ok(FrameState::Incomplete) => return Flow::Continue,
            Err(e) => return fail(inner, &e).await,
        }
    }
}

async fn handle_frame(inner: &ClientInner, frame: Frame, reassembler: &mut Reassembler) -> Flow {
    if let Err(e) = frame.validate(Role::Client.expects_masked(), [false; 3]) {
        return fail(inner, &e).await;
    }

    match frame.opcode {
        Opcode::Ping => {
            tracing::debug!("received PING, replying with PONG");
            if let Err(e) = inner.pong(&frame.payload).await {
                tracing::warn!(error = %e, "failed to send pong");
            }
            Flow::Continue
        }
        Opcode::Pong => handle_pong(inner, &frame).await,
        Opcode::Close => handle_close(inner, &frame).await,
        _ => match reassembler.push(frame) {
            Ok(Some(msg)) => deliver(inner, msg).await,
            Ok(None) => Flow::Continue,
            Err(e) => fail(inner, &e).await,
        },
    }
}

// Try to match the payload against our last nonce,
// a pong later than u16::MAX ms closes the connection, anything else is unsolicited
async fn handle_pong(inner: &ClientInner, frame: &Frame) -> Flow {
    tracing::debug!("received PONG");
    let result = inner.ping_stats.lock().on_pong(&frame.payload);
    let latency = match result {
        Ok(latency) => Some(latency),
        Err(PongError::Late(latency)) => {
            tracing::warn!(latency = %latency, "late pong");
            inner.state.store(State::Closing);
            let _ = inner.send_close(CloseReason::Policy, "ping timeout").await;
            return Flow::Stop(Some(CloseReason::Policy));
        }
        Err(PongError::Nonce) => {
            tracing::debug!("unsolicited pong");
            None
        }
    };
    inner.handler.on_pong(frame.payload.to_vec(), latency).await;
    Flow::Continue
}

// If we started the close, hand the reply to the waiter; otherwise echo it back
async fn handle_close(inner: &ClientInner, frame: &Frame) -> Flow {
    let reason = CloseReason::from_code(frame.close_code);
    tracing::info!(reason = ?reason, text = frame.close_text(), "received Close frame");

    let waiter = inner.close_tx.lock().take();
    if let Some(tx) = waiter {
        let _ = tx.send(reason);
    } else if inner.state.transition(State::Open, State::Closing) {
        if let Err(e) = inner.send_close(reason, "").await {
            tracing::warn!(error = %e, "error sending close");
        }
    }
    Flow::Stop(Some(reason))
}

async fn deliver(inner: &ClientInner, msg: Message) -> Flow {
    tracing::debug!(len = msg.len(), "message received");
    let reply = match msg {
        Message::Text(text) => inner.handler.on_text(text).await,
        Message::Binary(bytes) => inner.handler.on_binary(bytes).await,
    };
    if let Some(reply) = reply {
        if let Err(e) = inner.send(reply.as_bytes(), reply.opcode()).await {
            tracing::warn!(error = %e, "failed to send reply");
            inner.handler.on_error(e).await;
        }
    }
    Flow::Continue
}

// Close with the violation's status and stop reading
async fn fail(inner: &ClientInner, err: &FrameError) -> Flow {
    let reason = err.close_reason();
    tracing::warn!(error = %err, reason = ?reason, "protocol violation detected, closing");
    inner.state.store(State::Closing);
    let _ = inner.send_close(reason, &err.to_string()).await;
    inner.handler.on_error(Error::Frame(err.clone())).await;
    Flow::Stop(Some(reason))
}
