mod background;
mod detector;
mod pipeline;
mod region;
mod worker;

pub use detector::{DetectionMethod, DetectionParameters, DetectionResult, MismatchPolicy};
pub use pipeline::StreamingPipeline;
pub use region::{Region, RegionError};
pub use worker::{spawn_worker, StreamWorker};
