use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BytesMut};

use super::{Frame, Opcode};
use crate::{error::FrameError, protocol::mask_from};

// helper type since decoder errors are always FrameErrors
type Result<T> = std::result::Result<T, FrameError>;

#[derive(Debug)]
pub enum FrameState {
    Complete(Frame),
    Incomplete,
}

/// Resumable frame decoder.
///
/// Holds the bytes of a frame that has not fully arrived yet together with how far decoding
/// got, so it can be stored per connection and fed whatever the socket yields next.
#[derive(Debug)]
pub struct FrameCursor {
    buf: BytesMut,
    state: DecodeState,
    ctx: DecodeContext,
    payload: BytesMut,
    max_payload: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header1,
    Header2,
    ExtendedLen,
    Mask,
    Payload,
}

#[derive(Debug, Default)]
struct DecodeContext {
    b0: u8,
    masked: bool,
    len7: u8,
    payload_len: u64,
    mask_key: [u8; 4],
}

impl FrameCursor {
    #[must_use]
    pub fn new(max_payload: u64) -> Self {
        Self {
            buf: BytesMut::new(),
            state: DecodeState::Header1,
            ctx: DecodeContext::default(),
            payload: BytesMut::new(),
            max_payload,
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }

    /// Appends `bytes` and tries to complete the next frame.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<FrameState> {
        self.push_bytes(bytes);
        self.next_frame()
    }

    /// True when no partial frame is buffered.
    #[must_use]
    pub fn is_idle(&self) -> bool { self.state == DecodeState::Header1 && self.buf.is_empty() }

    pub fn next_frame(&mut self) -> Result<FrameState> {
        match self.advance() {
            Ok(state) => Ok(state),
            Err(e) => {
                // the stream can't be resynchronized, drop everything
                self.buf.clear();
                self.payload.clear();
                self.state = DecodeState::Header1;
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> Result<FrameState> {
        loop {
            let next_state = match self.state {
                DecodeState::Header1 => {
                    if self.buf.is_empty() {
                        return Ok(FrameState::Incomplete);
                    }
                    self.ctx = DecodeContext {
                        b0: self.buf.get_u8(),
                        ..DecodeContext::default()
                    };
                    DecodeState::Header2
                }
                DecodeState::Header2 => {
                    if self.buf.is_empty() {
                        return Ok(FrameState::Incomplete);
                    }
                    self.parse_header2()?
                }
                DecodeState::ExtendedLen => match self.parse_extended_len()? {
                    Some(state) => state,
                    None => return Ok(FrameState::Incomplete),
                },
                DecodeState::Mask => {
                    if self.buf.len() < 4 {
                        return Ok(FrameState::Incomplete);
                    }
                    self.buf.copy_to_slice(&mut self.ctx.mask_key);
                    DecodeState::Payload
                }
                DecodeState::Payload => {
                    if !self.take_payload() {
                        return Ok(FrameState::Incomplete);
                    }
                    self.state = DecodeState::Header1;
                    return Ok(FrameState::Complete(self.finish()));
                }
            };
            tracing::trace!(from = ?self.state, to = ?next_state, "state transition");
            self.state = next_state;
        }
    }

    fn parse_header2(&mut self) -> Result<DecodeState> {
        // 0    | 1 2 3 4 5 6 7
        // Mask | Payload len
        let b = self.buf.get_u8();
        self.ctx.masked = b & 0b1000_0000 > 0;
        self.ctx.len7 = b & 0b0111_1111;
        self.ctx.payload_len = u64::from(self.ctx.len7);

        Ok(if self.ctx.len7 > 125 {
            DecodeState::ExtendedLen
        } else {
            self.after_len()?
        })
    }

    fn parse_extended_len(&mut self) -> Result<Option<DecodeState>> {
        // 126 => 2 bytes extended (u16), 127 => 8 bytes extended (u64)
        let width = if self.ctx.len7 == 126 { 2 } else { 8 };
        if self.buf.len() < width {
            return Ok(None);
        }
        let len_bytes = self.buf.split_to(width);
        self.ctx.payload_len = if width == 2 {
            u64::from(BigEndian::read_u16(&len_bytes))
        } else {
            BigEndian::read_u64(&len_bytes)
        };
        self.after_len().map(Some)
    }

    fn after_len(&mut self) -> Result<DecodeState> {
        // control opcodes have the high bit set, and their payload is never buffered past 125
        if self.ctx.b0 & 0b1000 != 0 && self.ctx.payload_len > 125 {
            return Err(FrameError::ControlTooLong(self.ctx.payload_len));
        }
        if self.ctx.payload_len > self.max_payload {
            tracing::warn!(len = self.ctx.payload_len, max = self.max_payload, "frame exceeded maximum size");
            return Err(FrameError::TooLarge(self.ctx.payload_len));
        }
        // bounded by max_payload above
        #[allow(clippy::cast_possible_truncation)]
        self.payload.reserve(self.ctx.payload_len as usize);
        Ok(if self.ctx.masked {
            DecodeState::Mask
        } else {
            DecodeState::Payload
        })
    }

    // Moves whatever payload bytes are available, unmasking as they arrive.
    // Returns true once the whole payload is in.
    #[allow(clippy::cast_possible_truncation)]
    fn take_payload(&mut self) -> bool {
        let have = self.payload.len();
        let want = self.ctx.payload_len as usize - have;
        let n = want.min(self.buf.len());
        if n > 0 {
            let mut chunk = self.buf.split_to(n);
            if self.ctx.masked {
                mask_from(&mut chunk, self.ctx.mask_key, have);
            }
            self.payload.unsplit(chunk);
        }
        self.payload.len() as u64 == self.ctx.payload_len
    }

    fn finish(&mut self) -> Frame {
        let b0 = self.ctx.b0;
        let opcode = Opcode::from(b0);
        let payload = self.payload.split().freeze();
        let close_code = match (opcode, payload.len()) {
            (Opcode::Close, 0) => 1000,
            // a single byte is rejected by validation
            (Opcode::Close, 1) => 0,
            (Opcode::Close, _) => BigEndian::read_u16(&payload[..2]),
            _ => 0,
        };

        tracing::trace!(
            opcode = ?opcode,
            fin = b0 & 0b1000_0000 > 0,
            payload_len = payload.len(),
            masked = self.ctx.masked,
            "frame decoded"
        );
        Frame {
            fin: b0 & 0b1000_0000 > 0,
            rsv1: b0 & 0b0100_0000 > 0,
            rsv2: b0 & 0b0010_0000 > 0,
            rsv3: b0 & 0b0001_0000 > 0,
            opcode,
            mask_key: self.ctx.masked.then_some(self.ctx.mask_key),
            length: self.ctx.payload_len,
            close_code,
            payload,
        }
    }
}

/// Decodes one frame out of `bytes`, returning it and the bytes that follow it.
pub fn decode(bytes: &[u8], max_payload: u64) -> Result<Option<(Frame, BytesMut)>> {
    let mut cursor = FrameCursor::new(max_payload);
    match cursor.feed(bytes)? {
        FrameState::Complete(frame) => Ok(Some((frame, cursor.buf))),
        FrameState::Incomplete => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use paste::paste;
    use proptest::{collection::vec, prelude::*};

    use super::*;
    use crate::frames::encode;

    const MAX: u64 = 1 << 24;

    fn opcode_strategy() -> impl Strategy<Value = Opcode> {
        prop_oneof![
            Just(Opcode::Text),
            Just(Opcode::Bin),
            Just(Opcode::Cont),
            Just(Opcode::Ping),
            Just(Opcode::Pong),
        ]
    }

    fn round_trip(len: usize, masked: bool) {
        #[allow(clippy::cast_possible_truncation)]
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let bytes = encode(Opcode::Bin, masked, &payload);
        let (frame, rest) = decode(&bytes, MAX).unwrap().expect("complete frame");
        assert!(rest.is_empty());
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Bin);
        assert_eq!(frame.is_masked(), masked);
        assert_eq!(frame.length, len as u64);
        assert_eq!(frame.payload, payload);
    }

    macro_rules! round_trip_sizes {
        ($($len:expr),* $(,)?) => {
            $(paste! {
                #[test] fn [<round_trip_masked_ $len>]() { round_trip($len, true); }
                #[test] fn [<round_trip_unmasked_ $len>]() { round_trip($len, false); }
            })*
        };
    }

    round_trip_sizes!(0, 5, 125, 126, 65535, 65536);

    #[test]
    fn resumes_across_single_byte_feeds() {
        let bytes = Frame::text("Hello, chunked world").with_mask([9, 8, 7, 6]).encode();
        let mut cursor = FrameCursor::new(MAX);
        let (last, head) = bytes.split_last().unwrap();
        for b in head {
            assert!(matches!(cursor.feed(&[*b]), Ok(FrameState::Incomplete)));
            assert!(!cursor.is_idle());
        }
        let Ok(FrameState::Complete(frame)) = cursor.feed(&[*last]) else {
            panic!("frame should complete on the last byte");
        };
        assert_eq!(&frame.payload[..], b"Hello, chunked world");
        assert_eq!(frame.mask_key, Some([9, 8, 7, 6]));
        assert!(cursor.is_idle());
    }

    #[test]
    fn several_frames_in_one_read() {
        let mut bytes = encode(Opcode::Text, false, b"one").to_vec();
        bytes.extend_from_slice(&encode(Opcode::Ping, false, b"p"));
        bytes.extend_from_slice(&encode(Opcode::Text, false, b"thr")[..3]);

        let mut cursor = FrameCursor::new(MAX);
        cursor.push_bytes(&bytes);
        let mut seen = vec![];
        while let Ok(FrameState::Complete(frame)) = cursor.next_frame() {
            seen.push(frame.opcode);
        }
        assert_eq!(seen, vec![Opcode::Text, Opcode::Ping]);
        let Ok(FrameState::Complete(frame)) = cursor.feed(b"hr") else {
            panic!("tail should complete the third frame");
        };
        assert_eq!(&frame.payload[..], b"thr");
    }

    #[test]
    fn close_codes() {
        let (frame, _) = decode(&[0x88, 0x00], MAX).unwrap().unwrap();
        assert_eq!(frame.close_code, 1000);
        let (frame, _) = decode(&[0x88, 0x02, 0x03, 0xEE], MAX).unwrap().unwrap();
        assert_eq!(frame.close_code, 1006);
        let (frame, _) = decode(&[0x88, 0x01, 0x03], MAX).unwrap().unwrap();
        assert_eq!(
            frame.validate(false, [false; 3]).unwrap_err().close_reason().code(),
            1002
        );
    }

    #[test]
    fn oversized_frame_rejected_from_header() {
        let mut cursor = FrameCursor::new(1024);
        let header = [0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0];
        assert_eq!(cursor.feed(&header).unwrap_err(), FrameError::TooLarge(65536));
        assert!(cursor.is_idle());
    }

    #[test]
    fn oversized_ping_rejected_from_header() {
        let mut cursor = FrameCursor::new(MAX);
        // PING announcing 1 MiB, none of which is sent
        let header = [0x89, 127, 0, 0, 0, 0, 0, 0x10, 0, 0];
        assert_eq!(cursor.feed(&header).unwrap_err(), FrameError::ControlTooLong(1 << 20));
        assert!(cursor.is_idle());

        let header = [0x8A, 126, 0, 126];
        assert_eq!(cursor.feed(&header).unwrap_err(), FrameError::ControlTooLong(126));
        assert_eq!(
            FrameError::ControlTooLong(126).close_reason(),
            crate::CloseReason::ProtoError
        );
    }

    #[test]
    fn reserved_bits_survive_decoding() {
        let (frame, _) = decode(&[0xC1, 0x00], MAX).unwrap().unwrap();
        assert!(frame.rsv1);
        assert!(!frame.rsv2);
        assert_eq!(frame.payload, Bytes::new());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn decoder_handles_random_frames(
            opcode in opcode_strategy(),
            fin in any::<bool>(),
            payload in vec(any::<u8>(), 0..=125),
            key in any::<[u8; 4]>(),
            split in any::<prop::sample::Index>(),
        ) {
            let bytes = Frame::new(opcode, payload.clone()).with_fin(fin).with_mask(key).encode();
            let at = split.index(bytes.len());
            let mut cursor = FrameCursor::new(MAX);
            let first = cursor.feed(&bytes[..at]).unwrap();
            let frame = match first {
                FrameState::Complete(frame) => frame,
                FrameState::Incomplete => match cursor.feed(&bytes[at..]).unwrap() {
                    FrameState::Complete(frame) => frame,
                    FrameState::Incomplete => panic!("Got Incomplete for full frame"),
                },
            };
            prop_assert_eq!(&frame.payload[..], &payload[..]);
            prop_assert_eq!(frame.opcode, opcode);
            prop_assert_eq!(frame.fin, fin);
        }

        #[test]
        fn fuzz_decoder(buf in vec(any::<u8>(), 0..2048)) {
            let mut cursor = FrameCursor::new(4096);
            cursor.push_bytes(&buf);
            while let Ok(FrameState::Complete(_)) = cursor.next_frame() {}
        }
    }
}
