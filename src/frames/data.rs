use bytes::Bytes;

use super::{Frame, Opcode, frame::random_mask_key};
use crate::role::Role;

// -- SLOW PATH --
// DataFrames may be fragmented or very large hence they need extra processing compared to
// ControlFrames
pub(crate) struct DataFrame<'a> {
    opcode: Opcode,
    payload: &'a [u8],
    role: Role,
}

impl<'a> DataFrame<'a> {
    pub(crate) fn new(payload: &'a [u8], opcode: Opcode, role: Role) -> Self {
        Self {
            opcode,
            payload,
            role,
        }
    }

    /// Splits the payload into frames of at most `max_frame` bytes. An empty payload still
    /// produces one (empty) final frame.
    pub(crate) fn encode(self, max_frame: usize) -> Vec<Bytes> {
        let max_frame = max_frame.max(1);
        if self.payload.is_empty() {
            return vec![self.frame(self.opcode, &[], true)];
        }

        let mut chunks = Vec::with_capacity(self.payload.len().div_ceil(max_frame));
        let mut iter = self.payload.chunks(max_frame).peekable();
        let mut opcode = self.opcode;
        while let Some(chunk) = iter.next() {
            chunks.push(self.frame(opcode, chunk, iter.peek().is_none()));
            opcode = Opcode::Cont;
        }

        tracing::debug!(
            len = self.payload.len(),
            frames = chunks.len(),
            "{} encoded DATA",
            self.role.label()
        );
        chunks
    }

    fn frame(&self, opcode: Opcode, chunk: &[u8], fin: bool) -> Bytes {
        let mut frame = Frame::new(opcode, Bytes::copy_from_slice(chunk)).with_fin(fin);
        if self.role.masks_outgoing() {
            frame = frame.with_mask(random_mask_key());
        }
        frame.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_carry_opcode_then_continuation() {
        let chunks = DataFrame::new(b"Hello, World", Opcode::Text, Role::Server).encode(5);
        let headers: Vec<u8> = chunks.iter().map(|c| c[0]).collect();
        assert_eq!(headers, vec![0x01, 0x00, 0x80]);
        assert_eq!(&chunks[0][2..], b"Hello");
        assert_eq!(&chunks[2][2..], b"ld");
    }

    #[test]
    fn empty_message_is_one_frame() {
        let chunks = DataFrame::new(b"", Opcode::Bin, Role::Client).encode(16);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0][0], 0x82);
        assert_eq!(chunks[0][1], 0x80);
    }
}
