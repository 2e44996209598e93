use bytes::Bytes;

use super::{Frame, Opcode, frame::random_mask_key};
use crate::{error::CloseReason, role::Role};

// Separate ControlFrame struct to allow a fast path for sending single frames (Ping, Pong, Close)
// which will have a payload <= 125 bytes and FIN always set.
pub(crate) struct ControlFrame<'a> {
    opcode: Opcode,
    payload: &'a [u8],
    role: Role,
}

impl<'a> ControlFrame<'a> {
    pub(crate) fn ping(payload: &'a [u8], role: Role) -> Self {
        Self {
            opcode: Opcode::Ping,
            payload,
            role,
        }
    }

    pub(crate) fn pong(payload: &'a [u8], role: Role) -> Self {
        Self {
            opcode: Opcode::Pong,
            payload,
            role,
        }
    }

    pub(crate) fn close_reason(reason: CloseReason, text: &str, role: Role) -> Bytes {
        tracing::debug!(reason = ?reason, text, role = role.label(), "encoding CLOSE");
        mask_for(Frame::close(reason, text), role).encode()
    }

    // sets Opcode, FIN, MASK and optionally masks payload
    pub(crate) fn encode(self) -> Bytes {
        let frame = match self.opcode {
            Opcode::Ping => Frame::ping(self.payload),
            _ => Frame::pong(self.payload),
        };
        mask_for(frame, self.role).encode()
    }
}

fn mask_for(frame: Frame, role: Role) -> Frame {
    if role.masks_outgoing() {
        frame.with_mask(random_mask_key())
    } else {
        frame
    }
}
