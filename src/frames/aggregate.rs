use bytes::BytesMut;

use super::{Frame, Opcode};

/// Fragments of one logical message, in arrival order.
#[derive(Debug, Default)]
pub struct FrameAggregator {
    frames: Vec<Frame>,
    data_len: usize,
}

/// Outcome of [`FrameAggregator::merge`].
#[derive(Debug)]
pub enum Merged {
    /// All fragments arrived; the frame holds the whole payload with the initiating opcode.
    Message(Frame),
    /// A Close frame was interleaved. `partial` holds the data seen before it.
    Closed { partial: Frame, close: Frame },
}

impl FrameAggregator {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    pub fn append(&mut self, frame: Frame) {
        if !frame.opcode.is_control() {
            self.data_len += frame.payload.len();
        }
        self.frames.push(frame);
    }

    /// Opcode of the initiating fragment, [`Opcode::Cont`] when nothing is buffered.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        self.frames
            .iter()
            .find(|f| !f.opcode.is_control())
            .map_or(Opcode::Cont, |f| f.opcode)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.frames.iter().any(|f| f.opcode == Opcode::Close) }

    /// Buffered data payload bytes, control frames excluded.
    #[must_use]
    pub fn len(&self) -> usize { self.data_len }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.frames.is_empty() }

    /// Concatenates the buffered fragments and `last` into one frame. Ping and Pong frames are
    /// skipped; the first Close frame stops the merge. The aggregator is empty afterwards.
    pub fn merge(&mut self, last: Frame) -> Merged {
        self.append(last);
        let opcode = self.opcode();
        let frames = std::mem::take(&mut self.frames);
        let mut payload = BytesMut::with_capacity(self.data_len);
        self.data_len = 0;

        for frame in frames {
            match frame.opcode {
                Opcode::Ping | Opcode::Pong => {}
                Opcode::Close => {
                    return Merged::Closed {
                        partial: Frame::new(opcode, payload.freeze()),
                        close: frame,
                    };
                }
                _ => payload.extend_from_slice(&frame.payload),
            }
        }

        tracing::debug!(opcode = ?opcode, total_len = payload.len(), "message assembly complete");
        Merged::Message(Frame::new(opcode, payload.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloseReason;

    fn fragment(opcode: Opcode, payload: &str, fin: bool) -> Frame {
        Frame::new(opcode, payload.as_bytes().to_vec()).with_fin(fin)
    }

    #[test]
    fn fragments_merge_in_order() {
        let mut agg = FrameAggregator::new();
        assert_eq!(agg.opcode(), Opcode::Cont);
        agg.append(fragment(Opcode::Text, "Hel", false));
        agg.append(fragment(Opcode::Cont, "lo, ", false));
        assert_eq!(agg.opcode(), Opcode::Text);
        assert_eq!(agg.len(), 7);

        let Merged::Message(frame) = agg.merge(fragment(Opcode::Cont, "World", true)) else {
            panic!("no close was appended");
        };
        assert_eq!(&frame.payload[..], b"Hello, World");
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.fin);
        assert!(agg.is_empty());
    }

    #[test]
    fn pings_are_skipped() {
        let mut agg = FrameAggregator::new();
        agg.append(fragment(Opcode::Bin, "ab", false));
        agg.append(Frame::ping(b"zz"));
        agg.append(fragment(Opcode::Cont, "cd", false));
        agg.append(Frame::pong(b"yy"));
        assert_eq!(agg.len(), 4);
        let Merged::Message(frame) = agg.merge(fragment(Opcode::Cont, "ef", true)) else {
            panic!("no close was appended");
        };
        assert_eq!(&frame.payload[..], b"abcdef");
        assert_eq!(frame.opcode, Opcode::Bin);
    }

    #[test]
    fn close_stops_merge() {
        let mut agg = FrameAggregator::new();
        agg.append(fragment(Opcode::Text, "ab", false));
        agg.append(Frame::close(CloseReason::GoingAway, ""));
        assert!(agg.is_closed());
        match agg.merge(fragment(Opcode::Cont, "cd", true)) {
            Merged::Closed { partial, close } => {
                assert_eq!(&partial.payload[..], b"ab");
                assert_eq!(close.close_code, 1001);
            }
            Merged::Message(_) => panic!("close should interrupt the merge"),
        }
    }
}
