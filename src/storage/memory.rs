use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use super::recorder::{CoverageRecord, Recorder, RecorderError};

/// Shared in-process recorder for dry runs. Clones see the same records.
pub struct MemoryRecorder {
    records: Arc<RwLock<VecDeque<CoverageRecord>>>,
    max_records: usize,
}

impl MemoryRecorder {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::new())),
            max_records: max_records.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn last(&self) -> Option<CoverageRecord> {
        self.records.read().ok()?.back().cloned()
    }
}

#[cfg(test)]
impl MemoryRecorder {
    pub fn records(&self) -> Vec<CoverageRecord> {
        match self.records.read() {
            Ok(records) => records.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Recorder for MemoryRecorder {
    fn record(&mut self, record: &CoverageRecord) -> Result<(), RecorderError> {
        let mut records = self.records.write().map_err(|_| RecorderError::Poisoned)?;
        records.push_back(record.clone());
        while records.len() > self.max_records {
            records.pop_front();
        }
        Ok(())
    }
}

impl Clone for MemoryRecorder {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            max_records: self.max_records,
        }
    }
}
