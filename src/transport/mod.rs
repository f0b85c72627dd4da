mod directory;
mod message;
mod source;

pub use directory::DirectorySource;
pub use message::{
    decode_body, parse_timestamp, sanitize_filename, synthesize_filename, DecodeError, Delivery,
    FrameMetadata,
};
pub use source::{FrameSource, SourceError};
