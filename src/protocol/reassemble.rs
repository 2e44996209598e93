use super::Message;
use crate::{
    error::FrameError,
    frames::{Frame, FrameAggregator, Merged, Opcode},
};

/// Tracks the data message in progress on one connection.
#[derive(Debug)]
pub(crate) struct Reassembler {
    partial: Option<FrameAggregator>,
    max_message: usize,
}

impl Reassembler {
    pub(crate) fn new(max_message: usize) -> Self {
        Self {
            partial: None,
            max_message,
        }
    }

    #[cfg(test)]
    fn in_progress(&self) -> bool { self.partial.is_some() }

    /// Takes a Text, Binary or Continuation frame. Returns the message once its final fragment
    /// arrives. Control frames must be handled by the caller and never reach here.
    pub(crate) fn push(&mut self, frame: Frame) -> Result<Option<Message>, FrameError> {
        tracing::trace!(
            partial = self.partial.is_some(),
            opcode = ?frame.opcode,
            fin = frame.fin,
            "handling message"
        );
        let buffered = self.partial.as_ref().map_or(0, FrameAggregator::len);
        let total = buffered + frame.payload.len();
        if total > self.max_message {
            self.partial = None;
            return Err(FrameError::TooLarge(total as u64));
        }

        match (self.partial.as_mut(), frame.opcode) {
            (None, Opcode::Text | Opcode::Bin) if frame.fin => Message::try_from(frame).map(Some),
            (None, Opcode::Text | Opcode::Bin) => {
                let mut agg = FrameAggregator::new();
                agg.append(frame);
                self.partial = Some(agg);
                Ok(None)
            }
            (Some(agg), Opcode::Cont) if !frame.fin => {
                agg.append(frame);
                tracing::trace!(current_len = agg.len(), "message fragment appended");
                Ok(None)
            }
            (Some(_), Opcode::Cont) => {
                let Some(mut agg) = self.partial.take() else {
                    return Err(FrameError::UnexpectedContinuation);
                };
                match agg.merge(frame) {
                    Merged::Message(merged) => Message::try_from(merged).map(Some),
                    Merged::Closed { .. } => Err(FrameError::UnfinishedMessage),
                }
            }
            (None, _) => Err(FrameError::UnexpectedContinuation),
            (Some(_), _) => {
                self.partial = None;
                Err(FrameError::UnfinishedMessage)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(opcode: Opcode, payload: &'static [u8], fin: bool) -> Frame {
        Frame::new(opcode, payload).with_fin(fin)
    }

    #[test]
    fn single_frame_message() {
        let mut r = Reassembler::new(1024);
        let msg = r.push(fragment(Opcode::Text, b"hi", true)).unwrap();
        assert_eq!(msg, Some(Message::Text("hi".into())));
        assert!(!r.in_progress());
    }

    #[test]
    fn fragmented_message() {
        let mut r = Reassembler::new(1024);
        assert_eq!(r.push(fragment(Opcode::Bin, b"\x01\x02", false)).unwrap(), None);
        assert!(r.in_progress());
        assert_eq!(r.push(fragment(Opcode::Cont, b"\x03", false)).unwrap(), None);
        let msg = r.push(fragment(Opcode::Cont, b"\x04", true)).unwrap();
        assert_eq!(msg, Some(Message::Binary(vec![1, 2, 3, 4])));
    }

    #[test]
    fn utf8_checked_on_whole_message() {
        // "é" split across fragments
        let mut r = Reassembler::new(1024);
        assert_eq!(r.push(fragment(Opcode::Text, b"\xc3", false)).unwrap(), None);
        let msg = r.push(fragment(Opcode::Cont, b"\xa9", true)).unwrap();
        assert_eq!(msg, Some(Message::Text("é".into())));

        let err = r.push(fragment(Opcode::Text, b"\xc3\x28", true)).unwrap_err();
        assert_eq!(err, FrameError::InvalidUtf8);
    }

    #[test]
    fn sequencing_violations() {
        let mut r = Reassembler::new(1024);
        assert_eq!(
            r.push(fragment(Opcode::Cont, b"x", true)).unwrap_err(),
            FrameError::UnexpectedContinuation
        );
        r.push(fragment(Opcode::Text, b"a", false)).unwrap();
        assert_eq!(
            r.push(fragment(Opcode::Text, b"b", true)).unwrap_err(),
            FrameError::UnfinishedMessage
        );
        assert!(!r.in_progress());
    }

    #[test]
    fn message_size_limit() {
        let mut r = Reassembler::new(4);
        r.push(fragment(Opcode::Bin, b"abc", false)).unwrap();
        let err = r.push(fragment(Opcode::Cont, b"de", true)).unwrap_err();
        assert_eq!(err, FrameError::TooLarge(5));
        assert_eq!(err.close_reason(), crate::CloseReason::TooBig);
    }
}
