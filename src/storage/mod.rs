mod artifacts;
mod csv;
mod memory;
mod recorder;
mod region_store;

pub use artifacts::ArtifactWriter;
pub use csv::CsvRecorder;
pub use memory::MemoryRecorder;
pub use recorder::{CoverageRecord, Recorder, RecorderError, SqliteRecorder};
pub use region_store::{RegionSource, RegionStore, RegionStoreError};
