mod frames;

pub use frames::FrameBuffer;
