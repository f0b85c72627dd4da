use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use super::recorder::{CoverageRecord, Recorder, RecorderError, TIMESTAMP_FORMAT};

const HEADER: &str = "timestamp,bee_coverage_percent";

/// Appends `timestamp,bee_coverage_percent` rows to a CSV file. The header is
/// written only when the file starts out empty.
pub struct CsvRecorder {
    file: File,
}

impl CsvRecorder {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RecorderError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{HEADER}")?;
        }
        Ok(Self { file })
    }
}

impl Recorder for CsvRecorder {
    fn record(&mut self, record: &CoverageRecord) -> Result<(), RecorderError> {
        writeln!(
            self.file,
            "{},{}",
            record.timestamp.format(TIMESTAMP_FORMAT),
            record.coverage_percent
        )?;
        self.file.flush()?;

        tracing::debug!(
            filename = %record.filename,
            coverage = format!("{:.2}", record.coverage_percent),
            "appended csv row"
        );
        Ok(())
    }
}
