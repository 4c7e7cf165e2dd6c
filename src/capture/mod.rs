pub mod frame;
pub mod stream;

pub use frame::{Frame, PixelFormat, Pixels};
pub use stream::{FrameCallback, Stream, StreamHealth};
