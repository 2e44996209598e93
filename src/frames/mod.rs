mod aggregate;
pub(crate) mod control;
mod data;
mod decode;
mod frame;
mod opcode;

pub use aggregate::{FrameAggregator, Merged};
pub(crate) use control::ControlFrame;
pub(crate) use data::DataFrame;
pub use decode::{FrameCursor, FrameState, decode};
pub use frame::{Frame, encode};
pub use opcode::Opcode;
