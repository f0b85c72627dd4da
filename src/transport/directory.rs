use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::config::SourceConfig;

use super::{Delivery, FrameMetadata, FrameSource, SourceError};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "tiff"];

/// Frame files in a directory, handed out in name order. With `watch` the
/// directory is rescanned for files that appear later.
pub struct DirectorySource {
    dir: PathBuf,
    watch: bool,
    poll_interval: Duration,
    pending: VecDeque<PathBuf>,
    seen: HashSet<PathBuf>,
    scanned: bool,
    next_tag: u64,
    in_flight: Option<(u64, PathBuf)>,
    acked: u64,
    nacked: u64,
}

impl DirectorySource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        if !config.dir.is_dir() {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("input directory not found: {}", config.dir.display()),
            )));
        }

        Ok(Self {
            dir: config.dir.clone(),
            watch: config.watch,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            pending: VecDeque::new(),
            seen: HashSet::new(),
            scanned: false,
            next_tag: 1,
            in_flight: None,
            acked: 0,
            nacked: 0,
        })
    }

    /// Queues files not handed out before. Entries for files that have
    /// disappeared are forgotten so `seen` tracks the directory listing.
    fn scan(&mut self) -> Result<usize, SourceError> {
        let listing: HashSet<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        self.seen.retain(|p| listing.contains(p));

        let mut fresh: Vec<PathBuf> = listing
            .into_iter()
            .filter(|p| !self.seen.contains(p))
            .collect();
        fresh.sort();

        for path in &fresh {
            self.seen.insert(path.clone());
        }
        let count = fresh.len();
        self.pending.extend(fresh);
        self.scanned = true;

        if count > 0 {
            tracing::debug!(dir = %self.dir.display(), files = count, "found new frames");
        }
        Ok(count)
    }

    fn settle(&mut self, tag: u64) -> Result<PathBuf, SourceError> {
        match self.in_flight.take() {
            Some((t, path)) if t == tag => Ok(path),
            other => {
                self.in_flight = other;
                Err(SourceError::UnknownTag(tag))
            }
        }
    }
}

impl FrameSource for DirectorySource {
    fn next_delivery(&mut self) -> Result<Option<Delivery>, SourceError> {
        if self.pending.is_empty() && (self.watch || !self.scanned) {
            if self.scan()? == 0 && self.watch {
                thread::sleep(self.poll_interval);
                return Ok(None);
            }
        }

        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };

        let body = std::fs::read(&path)?;
        let timestamp = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .map(|t| DateTime::<Local>::from(t).to_rfc3339());

        let tag = self.next_tag;
        self.next_tag += 1;
        self.in_flight = Some((tag, path.clone()));

        Ok(Some(Delivery {
            tag,
            body,
            metadata: FrameMetadata {
                filename: path.file_name().and_then(|n| n.to_str()).map(String::from),
                timestamp,
            },
        }))
    }

    fn ack(&mut self, tag: u64) -> Result<(), SourceError> {
        let path = self.settle(tag)?;
        self.acked += 1;
        tracing::trace!(tag, path = %path.display(), acked = self.acked, "ack");
        Ok(())
    }

    fn nack(&mut self, tag: u64) -> Result<(), SourceError> {
        let path = self.settle(tag)?;
        self.nacked += 1;
        tracing::warn!(tag, path = %path.display(), nacked = self.nacked, "frame rejected");
        Ok(())
    }

    fn is_finished(&self) -> bool {
        !self.watch && self.scanned && self.pending.is_empty() && self.in_flight.is_none()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}
