use std::path::PathBuf;

use opencv::core::Mat;
use thiserror::Error;

use crate::analytics::{Region, RegionError};

#[derive(Debug, Error)]
pub enum RegionStoreError {
    #[error("region file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("region file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Interactive (or otherwise external) polygon picker, shown the first raw
/// frame. `None` means the operator cancelled.
pub trait RegionSelector: Send {
    fn select(&mut self, first_frame: &Mat) -> Option<Vec<[i32; 2]>>;
}

/// Persisted polygon as a JSON list of `[x, y]` pairs.
pub struct RegionStore {
    path: PathBuf,
}

impl RegionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<Option<Region>, RegionStoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let region: Region = serde_json::from_str(&content)?;
        Ok(Some(region))
    }

    pub fn save(&self, region: &Region) -> Result<(), RegionStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string(region)?)?;
        Ok(())
    }
}

/// Resolves the observation region: inline points, then the persisted file,
/// then the selector (whose answer gets persisted).
pub struct RegionSource {
    inline: Option<Vec<[i32; 2]>>,
    store: RegionStore,
    selector: Option<Box<dyn RegionSelector>>,
}

impl RegionSource {
    pub fn new(
        inline: Option<Vec<[i32; 2]>>,
        store: RegionStore,
        selector: Option<Box<dyn RegionSelector>>,
    ) -> Self {
        Self {
            inline,
            store,
            selector,
        }
    }

    /// `Ok(None)` when no region exists and none could be obtained.
    pub fn resolve(&mut self, first_frame: &Mat) -> Result<Option<Region>, RegionStoreError> {
        if let Some(points) = self.inline.clone() {
            tracing::info!(points = points.len(), "using region from config");
            return Ok(Some(Region::new(points)?));
        }

        if let Some(region) = self.store.load()? {
            tracing::info!(
                path = %self.store.path.display(),
                points = region.points().len(),
                "loaded region"
            );
            return Ok(Some(region));
        }

        let Some(selector) = self.selector.as_mut() else {
            tracing::warn!(path = %self.store.path.display(), "no region file and no selector");
            return Ok(None);
        };

        let Some(points) = selector.select(first_frame) else {
            tracing::warn!("region selection cancelled");
            return Ok(None);
        };

        let region = Region::new(points)?;
        self.store.save(&region)?;
        tracing::info!(
            path = %self.store.path.display(),
            points = region.points().len(),
            "region selected and saved"
        );
        Ok(Some(region))
    }
}
