#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opcode {
    Cont,
    Text,
    Bin,
    /// 0x3-0x7
    ReservedData(u8),
    Close,
    Ping,
    Pong,
    /// 0xB-0xF
    ReservedControl(u8),
}

impl Opcode {
    /// Control frames have the high bit of the opcode set.
    #[must_use]
    pub fn is_control(self) -> bool { self.as_u8() & 0x8 != 0 }

    #[must_use]
    pub fn is_reserved(self) -> bool {
        matches!(self, Self::ReservedData(_) | Self::ReservedControl(_))
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Cont => 0x0,
            Self::Text => 0x1,
            Self::Bin => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::ReservedData(b) | Self::ReservedControl(b) => b,
        }
    }
}

/// Only the low nibble is looked at.
impl From<u8> for Opcode {
    fn from(b: u8) -> Self {
        match b & 0x0F {
            0x0 => Self::Cont,
            0x1 => Self::Text,
            0x2 => Self::Bin,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            b @ 0x3..=0x7 => Self::ReservedData(b),
            b => Self::ReservedControl(b),
        }
    }
}
