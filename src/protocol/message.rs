use crate::{
    error::FrameError,
    frames::{Frame, Opcode},
};

/// Assembled messages received from an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Valid UTF-8 message.
    Text(String),
    /// Binary message bytes.
    Binary(Vec<u8>),
}

impl Message {
    /// If the type is `Message::Text`, returns a reference to the internal `String`, otherwise
    /// `None`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Message::Binary(..) => None,
            Message::Text(s) => Some(s),
        }
    }

    /// Returns a reference to the data as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Binary(b) => b,
            Message::Text(s) => s.as_bytes(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize { self.as_bytes().len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub(crate) fn opcode(&self) -> Opcode {
        match self {
            Message::Text(_) => Opcode::Text,
            Message::Binary(_) => Opcode::Bin,
        }
    }
}

/// Turns a merged data frame into a message, checking Text payloads are UTF-8.
impl TryFrom<Frame> for Message {
    type Error = FrameError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        match frame.opcode {
            Opcode::Text => String::from_utf8(frame.payload.to_vec())
                .map(Message::Text)
                .map_err(|_| FrameError::InvalidUtf8),
            _ => Ok(Message::Binary(frame.payload.to_vec())),
        }
    }
}
