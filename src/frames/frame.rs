use bytes::{BufMut, Bytes, BytesMut};

use super::Opcode;
use crate::{
    error::{CloseReason, FrameError},
    protocol::mask,
};

pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;

/// One wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    /// Present iff the MASK bit is set.
    pub mask_key: Option<[u8; 4]>,
    /// Payload length as announced by the header.
    pub length: u64,
    /// Status code of a Close frame, 1000 when the peer gave none.
    pub close_code: u16,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// A single, final, unmasked frame.
    #[must_use]
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask_key: None,
            length: payload.len() as u64,
            close_code: 0,
            payload,
        }
    }

    #[must_use]
    pub fn text(text: &str) -> Self { Self::new(Opcode::Text, Bytes::copy_from_slice(text.as_bytes())) }

    #[must_use]
    pub fn binary(bytes: &[u8]) -> Self { Self::new(Opcode::Bin, Bytes::copy_from_slice(bytes)) }

    #[must_use]
    pub fn ping(payload: &[u8]) -> Self { Self::control(Opcode::Ping, payload) }

    #[must_use]
    pub fn pong(payload: &[u8]) -> Self { Self::control(Opcode::Pong, payload) }

    /// Close frame carrying `reason` followed by as much of `text` as fits in 123 bytes.
    #[must_use]
    pub fn close(reason: CloseReason, text: &str) -> Self {
        let text = &text[..floor_char_boundary(text, MAX_CONTROL_PAYLOAD - 2)];
        let mut buf = BytesMut::with_capacity(2 + text.len());
        buf.put_u16(reason.code());
        buf.extend_from_slice(text.as_bytes());
        let mut frame = Self::new(Opcode::Close, buf.freeze());
        frame.close_code = reason.code();
        frame
    }

    // control frames are capped at 125 bytes of payload
    fn control(opcode: Opcode, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_CONTROL_PAYLOAD);
        Self::new(opcode, Bytes::copy_from_slice(&payload[..len]))
    }

    /// Marks the frame as not final.
    #[must_use]
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Masks the frame with a fixed key when it is encoded.
    #[must_use]
    pub fn with_mask(mut self, mask_key: [u8; 4]) -> Self {
        self.mask_key = Some(mask_key);
        self
    }

    #[must_use]
    pub fn is_masked(&self) -> bool { self.mask_key.is_some() }

    /// Text following the status code of a Close frame.
    #[must_use]
    pub fn close_text(&self) -> &str {
        self.payload
            .get(2..)
            .and_then(|b| std::str::from_utf8(b).ok())
            .unwrap_or_default()
    }

    /// Checks the frame against the rules every endpoint enforces.
    ///
    /// `expect_masked` is true on the server side. `allow_rsv` lists the reserved bits claimed
    /// by a negotiated extension, which is never the case here, so callers pass all false.
    pub fn validate(&self, expect_masked: bool, allow_rsv: [bool; 3]) -> Result<(), FrameError> {
        if self.opcode.is_reserved() {
            return Err(FrameError::ReservedOpcode(self.opcode.as_u8()));
        }
        if (self.rsv1 && !allow_rsv[0]) || (self.rsv2 && !allow_rsv[1]) || (self.rsv3 && !allow_rsv[2])
        {
            return Err(FrameError::ReservedBits);
        }
        if self.is_masked() != expect_masked {
            return Err(FrameError::MaskDirection);
        }

        if self.opcode.is_control() {
            if !self.fin {
                return Err(FrameError::FragmentedControl);
            }
            if self.length > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::ControlTooLong(self.length));
            }
        }

        if self.opcode == Opcode::Close {
            match self.payload.len() {
                0 => {}
                1 => return Err(FrameError::ShortClosePayload),
                _ => {
                    if !CloseReason::is_valid_code(self.close_code) {
                        return Err(FrameError::InvalidCloseCode(self.close_code));
                    }
                    if std::str::from_utf8(&self.payload[2..]).is_err() {
                        return Err(FrameError::InvalidUtf8);
                    }
                }
            }
        }
        Ok(())
    }

    /// Serializes the frame. A mask key set on the frame is used as is.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 14);
        let mut b0 = self.opcode.as_u8();
        if self.fin {
            b0 |= 0b1000_0000;
        }
        if self.rsv1 {
            b0 |= 0b0100_0000;
        }
        if self.rsv2 {
            b0 |= 0b0010_0000;
        }
        if self.rsv3 {
            b0 |= 0b0001_0000;
        }
        buf.put_u8(b0);
        put_len(&mut buf, self.payload.len(), self.mask_key.is_some());

        if let Some(mask_key) = self.mask_key {
            buf.extend_from_slice(&mask_key);
            let start = buf.len();
            buf.extend_from_slice(&self.payload);
            mask(&mut buf[start..], mask_key);
        } else {
            buf.extend_from_slice(&self.payload);
        }

        tracing::trace!(
            opcode = ?self.opcode,
            fin = self.fin,
            len = self.payload.len(),
            masked = self.mask_key.is_some(),
            "encoded frame"
        );
        buf.freeze()
    }
}

/// Encodes a single final frame, generating a random mask key when `masked`.
#[must_use]
pub fn encode(opcode: Opcode, masked: bool, payload: &[u8]) -> Bytes {
    let mut frame = Frame::new(opcode, Bytes::copy_from_slice(payload));
    if masked {
        frame.mask_key = Some(random_mask_key());
    }
    frame.encode()
}

pub(crate) fn random_mask_key() -> [u8; 4] {
    let mut mask_key = [0; 4];
    rand::fill(&mut mask_key);
    mask_key
}

// push MASK bit and LEN, plus the extended length if needed
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn put_len(buf: &mut BytesMut, len: usize, masked: bool) {
    let mask_bit = if masked { 0x80 } else { 0 };
    match len {
        0..=125 => buf.put_u8(mask_bit | len as u8),
        126..=65535 => {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len as u16);
        }
        _ => {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(len as u64);
        }
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_RSV: [bool; 3] = [false; 3];

    #[test]
    fn hello_unmasked() {
        assert_eq!(
            &encode(Opcode::Text, false, b"Hello")[..],
            &[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]
        );
    }

    #[test]
    fn hello_masked_with_known_key() {
        let bytes = Frame::text("Hello").with_mask([0x37, 0xfa, 0x21, 0x3d]).encode();
        assert_eq!(
            &bytes[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn length_field_widths() {
        assert_eq!(encode(Opcode::Bin, false, &[0; 125]).len(), 2 + 125);
        let mid = encode(Opcode::Bin, false, &[0; 126]);
        assert_eq!(mid[1], 126);
        assert_eq!(&mid[2..4], &126u16.to_be_bytes());
        let big = encode(Opcode::Bin, true, &[0; 65536]);
        assert_eq!(big[1], 0x80 | 127);
        assert_eq!(&big[2..10], &65536u64.to_be_bytes());
        assert_eq!(big.len(), 2 + 8 + 4 + 65536);
    }

    #[test]
    fn control_payload_truncated() {
        assert_eq!(Frame::ping(&[7; 300]).payload.len(), 125);
        assert_eq!(Frame::pong(&[7; 3]).payload.len(), 3);
        let close = Frame::close(CloseReason::Normal, &"é".repeat(100));
        assert!(close.payload.len() <= 125);
        assert_eq!(&close.payload[..2], &1000u16.to_be_bytes());
        assert!(std::str::from_utf8(&close.payload[2..]).is_ok());
    }

    #[test]
    fn validate_mask_direction() {
        let unmasked = Frame::text("hi");
        assert_eq!(unmasked.validate(true, NO_RSV), Err(FrameError::MaskDirection));
        assert!(unmasked.validate(false, NO_RSV).is_ok());
        let masked = Frame::text("hi").with_mask([1, 2, 3, 4]);
        assert!(masked.validate(true, NO_RSV).is_ok());
        assert_eq!(masked.validate(false, NO_RSV), Err(FrameError::MaskDirection));
    }

    #[test]
    fn validate_reserved_bits() {
        let mut frame = Frame::binary(b"x");
        frame.rsv2 = true;
        assert_eq!(frame.validate(false, NO_RSV), Err(FrameError::ReservedBits));
        assert!(frame.validate(false, [false, true, false]).is_ok());
    }

    #[test]
    fn validate_control_rules() {
        let frame = Frame::ping(b"x").with_fin(false);
        assert_eq!(frame.validate(false, NO_RSV), Err(FrameError::FragmentedControl));

        let mut frame = Frame::ping(b"x");
        frame.length = 126;
        assert_eq!(frame.validate(false, NO_RSV), Err(FrameError::ControlTooLong(126)));

        let frame = Frame::new(Opcode::from(0x3), Bytes::new());
        assert_eq!(frame.validate(false, NO_RSV), Err(FrameError::ReservedOpcode(3)));
    }

    #[test]
    fn validate_close_payloads() {
        let frame = Frame::new(Opcode::Close, Bytes::from_static(&[3]));
        assert_eq!(frame.validate(false, NO_RSV), Err(FrameError::ShortClosePayload));
        assert_eq!(FrameError::ShortClosePayload.close_reason().code(), 1002);

        let mut frame = Frame::new(Opcode::Close, Bytes::from_static(&[0x03, 0xED]));
        frame.close_code = 1005;
        assert_eq!(frame.validate(false, NO_RSV), Err(FrameError::InvalidCloseCode(1005)));

        let mut frame = Frame::new(Opcode::Close, Bytes::from_static(&[0x03, 0xE8, 0xFF]));
        frame.close_code = 1000;
        assert_eq!(frame.validate(false, NO_RSV), Err(FrameError::InvalidUtf8));

        assert!(Frame::close(CloseReason::Application(4000), "bye").validate(false, NO_RSV).is_ok());
    }
}
