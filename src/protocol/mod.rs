mod mask;
mod message;
mod ping;
mod reassemble;

pub(crate) use mask::{mask, mask_from};
pub use message::Message;
pub(crate) use ping::{PingStats, PongError};
pub(crate) use reassemble::Reassembler;
