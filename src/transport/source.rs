use thiserror::Error;

use super::Delivery;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown delivery tag {0}")]
    UnknownTag(u64),
}

/// A consumer handing out one delivery at a time. Every delivery must be
/// confirmed exactly once with [`ack`](FrameSource::ack) or
/// [`nack`](FrameSource::nack) before the next one is requested.
pub trait FrameSource: Send {
    /// `Ok(None)` when nothing is available right now.
    fn next_delivery(&mut self) -> Result<Option<Delivery>, SourceError>;

    fn ack(&mut self, tag: u64) -> Result<(), SourceError>;

    /// Rejects without requeue.
    fn nack(&mut self, tag: u64) -> Result<(), SourceError>;

    /// True once no further deliveries will ever arrive.
    fn is_finished(&self) -> bool;
}
